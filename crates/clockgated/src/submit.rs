//! Clock-action submission and verify-after-timeout recovery.
//!
//! A submission that times out may still have been recorded server-side
//! (recognition is slow). Such a submission is never retried blindly: the
//! status endpoint is asked whether a matching clock entry exists within its
//! window, and only its answer decides the outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use clockgate_core::ActivityType;
use clockgate_device::DeviceHeaders;

use crate::http::{self, Multipart};

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("clock submission timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("device pending approval: {0}")]
    DevicePendingApproval(String),
    #[error("rejected by server (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("clock action unsuccessful: {0}")]
    Unsuccessful(String),
    #[error("malformed server reply: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<ureq::Error> for SubmitError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Timeout(_) => Self::Timeout,
            other => Self::Network(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeValidation {
    pub is_on_time: Option<bool>,
    pub expected_time: Option<String>,
    pub warning: Option<String>,
}

impl TimeValidation {
    /// The warning to show, if the action was outside working hours.
    pub fn late_warning(&self) -> Option<&str> {
        match self.is_on_time {
            Some(false) => self.warning.as_deref(),
            _ => None,
        }
    }
}

/// Successful clock-action reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClockReceipt {
    pub success: bool,
    pub staff_name: Option<String>,
    pub clock_type: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub confidence: Option<f32>,
    pub time_validation: Option<TimeValidation>,
    pub device_message: Option<String>,
    /// Set when the receipt was recovered through the status endpoint.
    #[serde(skip_deserializing)]
    pub verified_after_timeout: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ErrorReply {
    error: Option<String>,
    message: Option<String>,
    requires_device_approval: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerifyReply {
    clocked: bool,
    log: Option<VerifiedLog>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct VerifiedLog {
    clock_type: Option<String>,
    timestamp: Option<String>,
    confidence: Option<f32>,
    staff_name: Option<String>,
}

/// A clock action ready to send.
#[derive(Debug, Clone)]
pub struct ClockRequest {
    pub activity: ActivityType,
    pub latitude: f64,
    pub longitude: f64,
    pub image: Vec<u8>,
    pub requested_at: DateTime<Utc>,
}

/// Answer from the status endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Clocked(ClockReceipt),
    NotClocked,
}

/// Final outcome of a submission, after any recovery.
#[derive(Debug)]
pub enum ClockOutcome {
    Success(ClockReceipt),
    Failed(SubmitError),
    /// The submission timed out and the status check could not settle it.
    Unknown(String),
}

/// Clock-action backend. Blocking.
pub trait ClockSubmitter: Send + Sync {
    fn submit(&self, request: &ClockRequest) -> Result<ClockReceipt, SubmitError>;

    fn verify(&self, activity: ActivityType, at: DateTime<Utc>) -> Result<VerifyOutcome, SubmitError>;
}

/// Submit, and on timeout ask the status endpoint before deciding.
pub fn submit_with_recovery(submitter: &dyn ClockSubmitter, request: &ClockRequest) -> ClockOutcome {
    match submitter.submit(request) {
        Ok(receipt) if receipt.success => ClockOutcome::Success(receipt),
        Ok(receipt) => ClockOutcome::Failed(SubmitError::Unsuccessful(
            receipt
                .device_message
                .unwrap_or_else(|| "the server did not accept the clock action".to_string()),
        )),
        Err(SubmitError::Timeout) => {
            tracing::warn!(activity = %request.activity, "clock submission timed out, verifying");
            match submitter.verify(request.activity, request.requested_at) {
                Ok(VerifyOutcome::Clocked(receipt)) => {
                    tracing::info!(activity = %request.activity, "clock action confirmed after timeout");
                    ClockOutcome::Success(receipt)
                }
                Ok(VerifyOutcome::NotClocked) => ClockOutcome::Failed(SubmitError::Timeout),
                Err(e) => {
                    tracing::warn!(error = %e, "clock verification failed");
                    ClockOutcome::Unknown(format!(
                        "The clock request timed out and could not be verified ({e}). Check your recent clocks before trying again."
                    ))
                }
            }
        }
        Err(e) => ClockOutcome::Failed(e),
    }
}

/// HTTP clock backend.
pub struct HttpSubmitter {
    submit_agent: ureq::Agent,
    verify_agent: ureq::Agent,
    clock_url: String,
    verify_url: String,
    headers: DeviceHeaders,
}

impl HttpSubmitter {
    pub fn new(
        clock_url: String,
        verify_url: String,
        submit_timeout: Duration,
        verify_timeout: Duration,
        headers: DeviceHeaders,
    ) -> Self {
        Self {
            submit_agent: http::agent(submit_timeout),
            verify_agent: http::agent(verify_timeout),
            clock_url,
            verify_url,
            headers,
        }
    }
}

impl ClockSubmitter for HttpSubmitter {
    fn submit(&self, request: &ClockRequest) -> Result<ClockReceipt, SubmitError> {
        let (content_type, body) = Multipart::new()
            .text("type", request.activity.legacy_code())
            .text("latitude", &request.latitude.to_string())
            .text("longitude", &request.longitude.to_string())
            .file("image", "capture.jpg", "image/jpeg", &request.image)
            .finish();

        tracing::info!(
            activity = %request.activity,
            bytes = request.image.len(),
            "submitting clock action"
        );

        let mut resp = http::with_device_headers(self.submit_agent.post(&self.clock_url), &self.headers)
            .header("Content-Type", &content_type)
            .send(&body[..])?;
        let status = resp.status().as_u16();
        let text = resp.body_mut().read_to_string()?;
        parse_submit_reply(status, &text)
    }

    fn verify(&self, activity: ActivityType, at: DateTime<Utc>) -> Result<VerifyOutcome, SubmitError> {
        let mut resp = http::with_device_headers(self.verify_agent.get(&self.verify_url), &self.headers)
            .query("type", activity.legacy_code())
            .query("timestamp", at.timestamp_millis().to_string())
            .query("deviceId", &self.headers.device_id)
            .call()?;
        let status = resp.status().as_u16();
        let text = resp.body_mut().read_to_string()?;
        parse_verify_reply(status, &text, activity)
    }
}

fn parse_submit_reply(status: u16, text: &str) -> Result<ClockReceipt, SubmitError> {
    if (200..300).contains(&status) {
        return Ok(serde_json::from_str(text)?);
    }

    let reply: ErrorReply = serde_json::from_str(text).unwrap_or_default();
    let message = reply
        .error
        .or(reply.message)
        .unwrap_or_else(|| format!("HTTP {status}"));
    if status == 403 && reply.requires_device_approval {
        return Err(SubmitError::DevicePendingApproval(message));
    }
    Err(SubmitError::Rejected { status, message })
}

fn parse_verify_reply(status: u16, text: &str, activity: ActivityType) -> Result<VerifyOutcome, SubmitError> {
    if !(200..300).contains(&status) {
        return Err(SubmitError::Rejected {
            status,
            message: "verification request failed".to_string(),
        });
    }
    let reply: VerifyReply = serde_json::from_str(text)?;
    if !reply.clocked {
        return Ok(VerifyOutcome::NotClocked);
    }
    let log = reply.log.unwrap_or_default();
    let (date, time) = log
        .timestamp
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| (Some(t.format("%Y-%m-%d").to_string()), Some(t.format("%H:%M").to_string())))
        .unwrap_or((None, None));
    Ok(VerifyOutcome::Clocked(ClockReceipt {
        success: true,
        staff_name: log.staff_name,
        clock_type: log.clock_type.or_else(|| Some(activity.legacy_code().to_string())),
        date,
        time,
        confidence: log.confidence,
        verified_after_timeout: true,
        ..ClockReceipt::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted {
        submit: Mutex<Option<Result<ClockReceipt, SubmitError>>>,
        verify: Mutex<Option<Result<VerifyOutcome, SubmitError>>>,
        verify_calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(
            submit: Result<ClockReceipt, SubmitError>,
            verify: Option<Result<VerifyOutcome, SubmitError>>,
        ) -> Self {
            Self {
                submit: Mutex::new(Some(submit)),
                verify: Mutex::new(verify),
                verify_calls: Mutex::new(0),
            }
        }
    }

    impl ClockSubmitter for Scripted {
        fn submit(&self, _request: &ClockRequest) -> Result<ClockReceipt, SubmitError> {
            self.submit.lock().unwrap().take().unwrap()
        }

        fn verify(&self, _activity: ActivityType, _at: DateTime<Utc>) -> Result<VerifyOutcome, SubmitError> {
            *self.verify_calls.lock().unwrap() += 1;
            self.verify.lock().unwrap().take().unwrap()
        }
    }

    fn request() -> ClockRequest {
        ClockRequest {
            activity: ActivityType::ClockIn,
            latitude: -26.2,
            longitude: 28.04,
            image: vec![0xff, 0xd8],
            requested_at: Utc::now(),
        }
    }

    fn receipt() -> ClockReceipt {
        ClockReceipt {
            success: true,
            staff_name: Some("Thandi".into()),
            ..ClockReceipt::default()
        }
    }

    #[test]
    fn test_success_passes_through_without_verify() {
        let s = Scripted::new(Ok(receipt()), None);
        assert!(matches!(submit_with_recovery(&s, &request()), ClockOutcome::Success(_)));
        assert_eq!(*s.verify_calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_success_false_is_failure() {
        let s = Scripted::new(
            Ok(ClockReceipt {
                success: false,
                ..receipt()
            }),
            None,
        );
        assert!(matches!(
            submit_with_recovery(&s, &request()),
            ClockOutcome::Failed(SubmitError::Unsuccessful(_))
        ));
    }

    #[test]
    fn test_timeout_then_clocked_is_success() {
        let s = Scripted::new(Err(SubmitError::Timeout), Some(Ok(VerifyOutcome::Clocked(receipt()))));
        assert!(matches!(submit_with_recovery(&s, &request()), ClockOutcome::Success(_)));
        assert_eq!(*s.verify_calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_timeout_then_not_clocked_is_failure() {
        let s = Scripted::new(Err(SubmitError::Timeout), Some(Ok(VerifyOutcome::NotClocked)));
        assert!(matches!(
            submit_with_recovery(&s, &request()),
            ClockOutcome::Failed(SubmitError::Timeout)
        ));
    }

    #[test]
    fn test_timeout_then_verify_error_is_unknown() {
        let s = Scripted::new(
            Err(SubmitError::Timeout),
            Some(Err(SubmitError::Network("connection reset".into()))),
        );
        assert!(matches!(submit_with_recovery(&s, &request()), ClockOutcome::Unknown(_)));
    }

    #[test]
    fn test_network_error_not_verified() {
        let s = Scripted::new(Err(SubmitError::Network("refused".into())), None);
        assert!(matches!(
            submit_with_recovery(&s, &request()),
            ClockOutcome::Failed(SubmitError::Network(_))
        ));
        assert_eq!(*s.verify_calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_parse_receipt() {
        let r = parse_submit_reply(
            200,
            r#"{"success": true, "staffName": "Thandi", "clockType": "in", "date": "2026-10-18",
                "time": "08:02", "confidence": 0.93,
                "timeValidation": {"isOnTime": false, "warning": "Clocked in 2 minutes late"}}"#,
        )
        .unwrap();
        assert_eq!(r.staff_name.as_deref(), Some("Thandi"));
        assert_eq!(
            r.time_validation.as_ref().and_then(|t| t.late_warning()),
            Some("Clocked in 2 minutes late")
        );
        assert!(!r.verified_after_timeout);
    }

    #[test]
    fn test_parse_device_pending() {
        let err = parse_submit_reply(
            403,
            r#"{"success": false, "error": "This device is pending approval.", "requiresDeviceApproval": true}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SubmitError::DevicePendingApproval(m) if m.contains("pending")));
    }

    #[test]
    fn test_parse_other_forbidden() {
        let err = parse_submit_reply(403, r#"{"error": "This device has been revoked."}"#).unwrap_err();
        assert!(matches!(err, SubmitError::Rejected { status: 403, .. }));
        let err = parse_submit_reply(500, "<html>").unwrap_err();
        assert!(matches!(err, SubmitError::Rejected { status: 500, message } if message == "HTTP 500"));
    }

    #[test]
    fn test_parse_verify() {
        let outcome = parse_verify_reply(
            200,
            r#"{"success": true, "clocked": true,
                "log": {"clockType": "in", "timestamp": "2026-10-18T08:02:11.000Z", "confidence": 0.9}}"#,
            ActivityType::ClockIn,
        )
        .unwrap();
        let VerifyOutcome::Clocked(receipt) = outcome else {
            panic!("expected clocked");
        };
        assert!(receipt.verified_after_timeout);
        assert_eq!(receipt.date.as_deref(), Some("2026-10-18"));
        assert_eq!(receipt.time.as_deref(), Some("08:02"));

        assert_eq!(
            parse_verify_reply(200, r#"{"success": true, "clocked": false}"#, ActivityType::ClockOut).unwrap(),
            VerifyOutcome::NotClocked
        );
    }
}
