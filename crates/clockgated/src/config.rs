use std::path::PathBuf;
use std::time::Duration;

use clockgate_core::{Thresholds, ThresholdsError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read thresholds file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("thresholds file {path}: {source}")]
    Thresholds {
        path: PathBuf,
        #[source]
        source: ThresholdsError,
    },
}

/// Sampling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureProfile {
    /// Face capture for clock actions.
    Attendance,
    /// Faster cadence for document capture.
    Document,
}

impl CaptureProfile {
    pub fn tick_interval(&self) -> Duration {
        match self {
            Self::Attendance => Duration::from_millis(500),
            Self::Document => Duration::from_millis(300),
        }
    }

    fn from_env_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "document" => Self::Document,
            _ => Self::Attendance,
        }
    }
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Backend base URL; `/staff/...` paths are appended.
    pub api_base_url: String,
    /// Capture command template. `{output}`, `{quality}`, `{width}` and
    /// `{height}` are substituted per argument.
    pub capture_command: String,
    /// Optional local face detector command. `{input}` is replaced with the
    /// preview path; the command prints a JSON array of faces.
    pub face_detector_command: Option<String>,
    /// Directory for temporary frame files.
    pub frame_dir: PathBuf,
    /// JPEG quality for preview frames (0..=100).
    pub preview_quality: u8,
    /// JPEG quality for the final capture.
    pub full_quality: u8,
    pub preview_size: (u32, u32),
    pub full_size: (u32, u32),
    pub profile: CaptureProfile,
    /// Longest a single capture command may run before it is killed.
    pub capture_timeout_secs: u64,
    /// Timeout for one preview validation round-trip.
    pub validator_timeout_secs: u64,
    /// Timeout for the clock submission (recognition can be slow).
    pub submit_timeout_secs: u64,
    /// Timeout for the verify-after-timeout status check.
    pub verify_timeout_secs: u64,
    /// Fixed kiosk location, if known at startup.
    pub location: Option<(f64, f64)>,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Optional TOML file overriding admission thresholds.
    pub thresholds_file: Option<PathBuf>,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `CLOCKGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("clockgate");

        let db_path = std::env::var("CLOCKGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("clock.db"));

        let frame_dir = std::env::var("CLOCKGATE_FRAME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("clockgate-frames"));

        let location = match (env_f64("CLOCKGATE_LATITUDE"), env_f64("CLOCKGATE_LONGITUDE")) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        };

        Self {
            api_base_url: std::env::var("CLOCKGATE_API_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://localhost:5000/api".to_string()),
            capture_command: std::env::var("CLOCKGATE_CAPTURE_COMMAND").unwrap_or_else(|_| {
                "fswebcam -q --no-banner -r {width}x{height} --jpeg {quality} {output}".to_string()
            }),
            face_detector_command: std::env::var("CLOCKGATE_FACE_DETECTOR_COMMAND")
                .ok()
                .filter(|c| !c.trim().is_empty()),
            frame_dir,
            preview_quality: env_parse("CLOCKGATE_PREVIEW_QUALITY", 30u8).min(100),
            full_quality: env_parse("CLOCKGATE_FULL_QUALITY", 90u8).min(100),
            preview_size: (
                env_parse("CLOCKGATE_PREVIEW_WIDTH", 640),
                env_parse("CLOCKGATE_PREVIEW_HEIGHT", 480),
            ),
            full_size: (
                env_parse("CLOCKGATE_FULL_WIDTH", 1280),
                env_parse("CLOCKGATE_FULL_HEIGHT", 960),
            ),
            profile: std::env::var("CLOCKGATE_PROFILE")
                .map(|v| CaptureProfile::from_env_value(&v))
                .unwrap_or(CaptureProfile::Attendance),
            capture_timeout_secs: env_parse("CLOCKGATE_CAPTURE_TIMEOUT_SECS", 10),
            validator_timeout_secs: env_parse("CLOCKGATE_VALIDATOR_TIMEOUT_SECS", 10),
            submit_timeout_secs: env_parse("CLOCKGATE_SUBMIT_TIMEOUT_SECS", 120),
            verify_timeout_secs: env_parse("CLOCKGATE_VERIFY_TIMEOUT_SECS", 15),
            location,
            db_path,
            thresholds_file: std::env::var("CLOCKGATE_THRESHOLDS_FILE").ok().map(PathBuf::from),
            session_bus: env_flag("CLOCKGATE_SESSION_BUS"),
        }
    }

    /// Default thresholds, overridden by the thresholds file when configured.
    pub fn load_thresholds(&self) -> Result<Thresholds, ConfigError> {
        let Some(path) = &self.thresholds_file else {
            return Ok(Thresholds::default());
        };
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Thresholds::from_toml_str(&source).map_err(|source| ConfigError::Thresholds {
            path: path.clone(),
            source,
        })
    }

    pub fn validator_url(&self) -> String {
        format!("{}/staff/validate-preview", self.api_base_url)
    }

    pub fn clock_url(&self) -> String {
        format!("{}/staff/clock", self.api_base_url)
    }

    pub fn verify_url(&self) -> String {
        format!("{}/staff/verify-clock", self.api_base_url)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Boolean switch. Accepts the same spellings as the `clockgate` CLI;
/// unset, empty or unrecognised values are off.
fn env_flag(key: &str) -> bool {
    let Ok(value) = std::env::var(key) else {
        return false;
    };
    parse_flag(&value).unwrap_or_else(|| {
        tracing::warn!(key, value = %value, "unrecognised boolean, treating as off");
        false
    })
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Some(true),
        "" | "n" | "no" | "f" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}
