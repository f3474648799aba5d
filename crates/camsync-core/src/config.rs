//! Session configuration
//!
//! Everything the engine needs to talk to one server: endpoint, credentials,
//! timeouts and transport tuning. Validated before any network call so a
//! missing setting fails fast as a configuration error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::models::DeviceId;

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Payloads estimated below this go up in a single request
pub const DEFAULT_ONE_STEP_THRESHOLD_BYTES: u64 = 2_000_000;

/// How the transport strategy is chosen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportPreference {
    /// Pick by estimated payload size against the threshold
    #[default]
    Auto,
    /// Always send the whole payload in one request
    AlwaysOneStep,
    /// Always send table by table, record by record
    AlwaysMultiStep,
}

/// Upload credentials. `Debug` redacts the password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Configuration for one synchronization session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Full URL of the server's API endpoint
    pub server_url: String,
    pub credentials: Credentials,
    pub device_id: DeviceId,
    pub device_friendly_name: String,
    /// Per-request timeout; a timeout is reported as a network failure
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub transport_preference: TransportPreference,
    #[serde(default = "default_threshold")]
    pub one_step_threshold_bytes: u64,
    /// Permit plain-HTTP servers. Off by default; meant for local testing.
    #[serde(default)]
    pub allow_insecure_http: bool,
}

const fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

const fn default_threshold() -> u64 {
    DEFAULT_ONE_STEP_THRESHOLD_BYTES
}

impl SyncConfig {
    /// Check the settings needed before any network call
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(SyncError::Config("server URL is not set".to_string()));
        }
        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(SyncError::Config(format!(
                "server URL must be http(s): {}",
                self.server_url
            )));
        }
        if self.server_url.starts_with("http://") && !self.allow_insecure_http {
            return Err(SyncError::Config(format!(
                "refusing plain HTTP without allow_insecure_http: {}",
                self.server_url
            )));
        }
        if self.credentials.username.trim().is_empty() {
            return Err(SyncError::Config("username is not set".to_string()));
        }
        if self.credentials.password.is_empty() {
            return Err(SyncError::Config("password is not set".to_string()));
        }
        Ok(())
    }
}
