//! Device identity
//!
//! Created once per installation; the identifier never changes, the friendly
//! name may.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stable identifier for this installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Create a new unique device ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DeviceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// One completed registration against a server endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Server URL the device registered with
    pub server: String,
    /// When the registration completed
    pub registered_at: DateTime<Utc>,
}

/// This installation's identity and registration history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Immutable identifier
    pub id: DeviceId,
    /// User-visible name, mutable
    pub friendly_name: String,
    /// Servers this device has registered with
    pub registrations: Vec<Registration>,
}

impl Device {
    /// Create a fresh, unregistered device
    #[must_use]
    pub fn new(friendly_name: impl Into<String>) -> Self {
        Self {
            id: DeviceId::new(),
            friendly_name: friendly_name.into(),
            registrations: Vec::new(),
        }
    }

    /// Record a successful registration with `server`
    pub fn record_registration(&mut self, server: impl Into<String>) {
        self.registrations.push(Registration {
            server: server.into(),
            registered_at: Utc::now(),
        });
    }

    /// Has this device ever registered with `server`?
    #[must_use]
    pub fn is_registered_with(&self, server: &str) -> bool {
        self.registrations
            .iter()
            .any(|registration| registration.server == server)
    }

    /// Rename the device; the identifier is untouched
    pub fn rename(&mut self, friendly_name: impl Into<String>) {
        self.friendly_name = friendly_name.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_are_unique() {
        assert_ne!(DeviceId::new(), DeviceId::new());
    }

    #[test]
    fn registration_is_tracked_per_server() {
        let mut device = Device::new("Ward 3 tablet");
        assert!(!device.is_registered_with("https://a.example.com/api"));

        device.record_registration("https://a.example.com/api");
        assert!(device.is_registered_with("https://a.example.com/api"));
        assert!(!device.is_registered_with("https://b.example.com/api"));
    }

    #[test]
    fn rename_keeps_identifier() {
        let mut device = Device::new("before");
        let id = device.id;
        device.rename("after");
        assert_eq!(device.id, id);
        assert_eq!(device.friendly_name, "after");
    }
}
