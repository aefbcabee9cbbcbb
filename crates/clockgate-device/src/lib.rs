//! Device fingerprint headers attached to every validator and clock request.
//!
//! The kiosk identifies itself with a stable `deviceId` (SHA-256 of the
//! machine identifier) and a `deviceHash` over the full device description,
//! so the backend can track per-device capture quality and gate unapproved
//! devices. The values are opaque to the rest of the system.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const APP_NAME: &str = "Clockgate";

/// Header names in the order they are sent.
pub const HEADER_NAMES: [&str; 7] = [
    "x-device-useragent",
    "x-device-platform",
    "x-device-language",
    "x-device-timezone",
    "x-device-id",
    "x-device-info",
    "x-device-hash",
];

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode device info: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Hex SHA-256 of a string.
pub fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Stable device identifier derived from the machine identifier.
pub fn device_id(identifier: &str) -> String {
    sha256_hex(identifier.trim())
}

/// Hash over `key:value` pairs in key order, joined with `|`.
pub fn device_hash(info: &BTreeMap<&'static str, String>) -> String {
    let joined = info
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join("|");
    sha256_hex(&joined)
}

/// What the kiosk knows about itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProfile {
    pub platform: String,
    pub os_name: String,
    pub os_version: String,
    pub kernel: String,
    pub hostname: String,
    pub language: String,
    pub timezone: String,
    pub app_version: String,
    pub device_id: String,
}

impl DeviceProfile {
    /// Probe the running system.
    pub fn probe() -> Result<Self, FingerprintError> {
        Self::probe_at(Path::new("/"), std::env::var("LANG").ok(), std::env::var("TZ").ok())
    }

    /// Probe a filesystem rooted at `root`. `lang` and `tz` override the
    /// locale and timezone files when set.
    pub fn probe_at(root: &Path, lang: Option<String>, tz: Option<String>) -> Result<Self, FingerprintError> {
        let os_release = read_optional(&root.join("etc/os-release"))?.unwrap_or_default();
        let field = |key: &str| {
            os_release
                .lines()
                .find_map(|l| l.strip_prefix(key)?.strip_prefix('='))
                .map(|v| v.trim().trim_matches('"').to_string())
        };

        let hostname = read_optional(&root.join("etc/hostname"))?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "localhost".to_string());

        let identifier = match read_optional(&root.join("etc/machine-id"))? {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                tracing::warn!("machine-id unavailable, falling back to hostname identifier");
                format!("clockgate-{hostname}")
            }
        };

        let language = lang
            .filter(|l| !l.is_empty())
            .map(|l| l.split('.').next().unwrap_or("en").replace('_', "-"))
            .unwrap_or_else(|| "en".to_string());

        let timezone = match tz.filter(|t| !t.is_empty()) {
            Some(tz) => tz,
            None => read_optional(&root.join("etc/timezone"))?
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "UTC".to_string()),
        };

        Ok(Self {
            platform: std::env::consts::OS.to_string(),
            os_name: field("NAME").unwrap_or_else(|| "Linux".to_string()),
            os_version: field("VERSION_ID").unwrap_or_default(),
            kernel: read_optional(&root.join("proc/sys/kernel/osrelease"))?
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
            hostname,
            language,
            timezone,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            device_id: device_id(&identifier),
        })
    }

    /// Flat description, keyed in the order the hash is computed.
    pub fn info(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("appVersion", self.app_version.clone()),
            ("deviceId", self.device_id.clone()),
            ("hostname", self.hostname.clone()),
            ("kernel", self.kernel.clone()),
            ("language", self.language.clone()),
            ("osName", self.os_name.clone()),
            ("osVersion", self.os_version.clone()),
            ("platform", self.platform.clone()),
            ("timezone", self.timezone.clone()),
        ])
    }

    pub fn user_agent(&self) -> String {
        format!("{APP_NAME}/{} ({}; {} {})", self.app_version, self.platform, self.os_name, self.os_version)
            .replace("  ", " ")
            .replace(" )", ")")
    }

    pub fn headers(&self) -> Result<DeviceHeaders, FingerprintError> {
        let info = self.info();
        Ok(DeviceHeaders {
            user_agent: self.user_agent(),
            platform: self.platform.clone(),
            language: self.language.clone(),
            timezone: self.timezone.clone(),
            device_id: self.device_id.clone(),
            device_info: serde_json::to_string(&info)?,
            device_hash: device_hash(&info),
        })
    }
}

/// The `x-device-*` header values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHeaders {
    pub user_agent: String,
    pub platform: String,
    pub language: String,
    pub timezone: String,
    pub device_id: String,
    pub device_info: String,
    pub device_hash: String,
}

impl DeviceHeaders {
    pub fn pairs(&self) -> [(&'static str, &str); 7] {
        [
            (HEADER_NAMES[0], self.user_agent.as_str()),
            (HEADER_NAMES[1], self.platform.as_str()),
            (HEADER_NAMES[2], self.language.as_str()),
            (HEADER_NAMES[3], self.timezone.as_str()),
            (HEADER_NAMES[4], self.device_id.as_str()),
            (HEADER_NAMES[5], self.device_info.as_str()),
            (HEADER_NAMES[6], self.device_hash.as_str()),
        ]
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, FingerprintError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(FingerprintError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}
