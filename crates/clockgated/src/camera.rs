use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How often a running capture command is checked for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("capture command is empty")]
    EmptyCommand,
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` still running after {after:?}, killed")]
    TimedOut { program: String, after: Duration },
    #[error("capture command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("capture produced no readable image at {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("frame directory {path}: {source}")]
    FrameDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Low-resolution, low-quality frame for the sampling loop.
    Preview,
    /// Full-quality frame submitted with the clock action.
    Full,
}

/// A frame on disk, owned by whoever holds this value.
///
/// The file is removed when the value is dropped, whether or not anything
/// read it.
#[derive(Debug)]
pub struct CapturedFrame {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

impl CapturedFrame {
    /// Take ownership of an existing file.
    pub fn adopt(path: PathBuf, width: u32, height: u32) -> Self {
        Self { path, width, height }
    }
}

impl Drop for CapturedFrame {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove frame file");
            }
        }
    }
}

/// Run an external command to completion, killing it once `timeout` passes.
///
/// Output is collected after exit, so the command must not write more than
/// a pipe buffer's worth while running.
pub fn run_with_timeout(program: &str, args: &[String], timeout: Duration) -> Result<Output, CameraError> {
    let spawn_error = |source| CameraError::Spawn {
        program: program.to_string(),
        source,
    };
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_error)?;

    let deadline = Instant::now() + timeout;
    while child.try_wait().map_err(spawn_error)?.is_none() {
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CameraError::TimedOut {
                program: program.to_string(),
                after: timeout,
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    child.wait_with_output().map_err(spawn_error)
}

/// Camera capability. Blocking; callers run it off the async scheduler.
pub trait Camera: Send + Sync {
    fn capture(&self, mode: CaptureMode) -> Result<CapturedFrame, CameraError>;
}

/// Camera backed by an external capture command (`fswebcam`, `libcamera-still`, …).
pub struct CommandCamera {
    template: Vec<String>,
    frame_dir: PathBuf,
    preview: (u32, u32, u8),
    full: (u32, u32, u8),
    timeout: Duration,
}

impl CommandCamera {
    pub fn new(
        template: &str,
        frame_dir: &Path,
        preview: (u32, u32, u8),
        full: (u32, u32, u8),
        timeout: Duration,
    ) -> Result<Self, CameraError> {
        let template: Vec<String> = template.split_whitespace().map(str::to_string).collect();
        if template.is_empty() {
            return Err(CameraError::EmptyCommand);
        }
        std::fs::create_dir_all(frame_dir).map_err(|source| CameraError::FrameDir {
            path: frame_dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            template,
            frame_dir: frame_dir.to_path_buf(),
            preview,
            full,
            timeout,
        })
    }

    fn args_for(&self, output: &Path, mode: CaptureMode) -> Vec<String> {
        let (width, height, quality) = match mode {
            CaptureMode::Preview => self.preview,
            CaptureMode::Full => self.full,
        };
        let output = output.to_string_lossy();
        self.template
            .iter()
            .map(|arg| {
                arg.replace("{output}", &output)
                    .replace("{quality}", &quality.to_string())
                    .replace("{width}", &width.to_string())
                    .replace("{height}", &height.to_string())
            })
            .collect()
    }
}

impl Camera for CommandCamera {
    fn capture(&self, mode: CaptureMode) -> Result<CapturedFrame, CameraError> {
        let path = self.frame_dir.join(format!("frame-{}.jpg", uuid::Uuid::new_v4()));
        let args = self.args_for(&path, mode);
        let (program, rest) = args.split_first().ok_or(CameraError::EmptyCommand)?;

        // Own the file from here on so every early return removes it,
        // including a partial write from a killed command.
        let mut frame = CapturedFrame::adopt(path, 0, 0);
        let output = run_with_timeout(program, rest, self.timeout)?;

        if !output.status.success() {
            return Err(CameraError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let (width, height) = image::image_dimensions(&frame.path).map_err(|e| CameraError::Unreadable {
            path: frame.path.clone(),
            reason: e.to_string(),
        })?;
        frame.width = width;
        frame.height = height;

        tracing::debug!(?mode, width, height, path = %frame.path.display(), "frame captured");
        Ok(frame)
    }
}
