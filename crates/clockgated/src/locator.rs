use std::path::Path;
use std::time::Duration;

use clockgate_core::extractor::FaceLocator;
use clockgate_core::quality::DetectedFace;
use image::GrayImage;

use crate::camera::{run_with_timeout, CameraError};

/// Face detector backed by an external command.
///
/// `{input}` in the template is replaced with the preview path. The command
/// prints a JSON array of faces in pixel coordinates on stdout:
/// `[{"x":..,"y":..,"width":..,"height":..,"confidence":..,"yaw":..}]`.
pub struct CommandLocator {
    template: Vec<String>,
    timeout: Duration,
}

impl CommandLocator {
    pub fn new(template: &str, timeout: Duration) -> Result<Self, CameraError> {
        let template: Vec<String> = template.split_whitespace().map(str::to_string).collect();
        if template.is_empty() {
            return Err(CameraError::EmptyCommand);
        }
        Ok(Self { template, timeout })
    }

    fn args_for(&self, path: &Path) -> Vec<String> {
        let input = path.to_string_lossy();
        self.template.iter().map(|a| a.replace("{input}", &input)).collect()
    }

    fn detect(&self, path: &Path) -> Result<Vec<DetectedFace>, String> {
        let args = self.args_for(path);
        let (program, rest) = args.split_first().ok_or("detector command is empty")?;

        let output = run_with_timeout(program, rest, self.timeout).map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(format!(
                "detector exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| format!("detector output: {e}"))
    }
}

impl FaceLocator for CommandLocator {
    fn locate(&self, path: &Path, _frame: &GrayImage) -> Option<Vec<DetectedFace>> {
        match self.detect(path) {
            Ok(faces) => {
                tracing::trace!(faces = faces.len(), "local detector answered");
                Some(faces)
            }
            Err(error) => {
                tracing::debug!(%error, "local detector unavailable for this frame");
                None
            }
        }
    }
}
