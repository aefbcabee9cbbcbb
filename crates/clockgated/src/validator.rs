//! Authoritative preview validation over HTTP.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use clockgate_core::observation::{
    BoundingBox, DistanceClass, EyeOpenness, FrameObservation, Issue, ObservationSource, Pose, SizeClass,
};
use clockgate_core::{FrameAnalyzer, FrameSample};
use clockgate_device::DeviceHeaders;

use crate::http::{self, Multipart};

#[derive(Error, Debug)]
pub enum ValidatorError {
    #[error("failed to read frame: {0}")]
    Read(#[from] std::io::Error),
    #[error("validator request failed: {0}")]
    Transport(#[from] ureq::Error),
    #[error("validator returned HTTP {0}")]
    Status(u16),
    #[error("malformed validator reply: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ValidationMetadata {
    face_count: u32,
    angle: f32,
    size: Option<String>,
    distance: Option<String>,
    face_size: Option<f32>,
    head_euler_angle_x: f32,
    head_euler_angle_y: f32,
    head_euler_angle_z: f32,
    left_eye_open_probability: Option<f32>,
    right_eye_open_probability: Option<f32>,
    bounding_box: Option<WireBox>,
}

/// Validator reply body.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ValidationReply {
    metadata: Option<ValidationMetadata>,
    quality: f32,
    ready: bool,
    feedback: Option<String>,
    issues: Vec<String>,
}

impl ValidationReply {
    fn into_observation(self, frame: &FrameSample<'_>) -> FrameObservation {
        let meta = self.metadata.unwrap_or_default();
        let mut obs = FrameObservation::face(
            frame.at,
            ObservationSource::RemoteAuthoritative,
            meta.face_count,
            self.quality,
        );
        obs.size = meta.size.as_deref().map_or(SizeClass::Unknown, SizeClass::from_wire);
        obs.distance = meta
            .distance
            .as_deref()
            .map_or(DistanceClass::Unknown, DistanceClass::from_wire);
        obs.pose = Pose {
            yaw: meta.head_euler_angle_y,
            pitch: meta.head_euler_angle_x,
            roll: meta.head_euler_angle_z,
            angle: meta.angle,
        };
        obs.face_size = meta.face_size.unwrap_or(0.0);
        obs.eyes = EyeOpenness {
            left: meta.left_eye_open_probability.unwrap_or(1.0),
            right: meta.right_eye_open_probability.unwrap_or(1.0),
        };
        obs.bounding_box = meta.bounding_box.map(|b| {
            if b.width <= 1.0 && b.height <= 1.0 {
                BoundingBox::from_pixels(b.x, b.y, b.width, b.height, 1, 1)
            } else {
                BoundingBox::from_pixels(b.x, b.y, b.width, b.height, frame.width, frame.height)
            }
        });
        obs.issues = self.issues.iter().map(|t| Issue::from_wire(t)).collect();
        obs.feedback = self.feedback.filter(|f| !f.is_empty());
        obs.ready = self.ready;
        obs.normalized()
    }
}

/// Sends preview frames to the validation endpoint.
pub struct ValidatorClient {
    agent: ureq::Agent,
    url: String,
    headers: DeviceHeaders,
}

impl ValidatorClient {
    pub fn new(url: String, timeout: Duration, headers: DeviceHeaders) -> Self {
        Self {
            agent: http::agent(timeout),
            url,
            headers,
        }
    }

    fn request(&self, frame: &FrameSample<'_>) -> Result<ValidationReply, ValidatorError> {
        let bytes = std::fs::read(frame.path)?;
        let (content_type, body) = Multipart::new()
            .file("image", "preview.jpg", "image/jpeg", &bytes)
            .finish();

        let mut resp = http::with_device_headers(self.agent.post(&self.url), &self.headers)
            .header("Content-Type", &content_type)
            .send(&body[..])?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(ValidatorError::Status(status));
        }
        let text = resp.body_mut().read_to_string()?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl FrameAnalyzer for ValidatorClient {
    fn source(&self) -> ObservationSource {
        ObservationSource::RemoteAuthoritative
    }

    fn analyze(&self, frame: &FrameSample<'_>) -> FrameObservation {
        match self.request(frame) {
            Ok(reply) => reply.into_observation(frame),
            Err(e) => {
                tracing::warn!(error = %e, "preview validation failed, treating as no face");
                FrameObservation::validation_error(frame.at)
            }
        }
    }
}
