//! Dotted protocol version numbers
//!
//! The server and every table requirement speak in `major.minor.patch`
//! strings; comparisons drive the catalog's fatal/warn decisions, so parsing
//! is lenient about missing components but strict about garbage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version of the sync protocol this client implements
pub const CLIENT_VERSION: Version = Version::new(2, 4, 0);

/// Oldest server this client is prepared to talk to at all
pub const MINIMUM_SERVER_VERSION: Version = Version::new(2, 3, 0);

/// A `major.minor.patch` version with total ordering
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Failure to parse a version string
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid version string: {0:?}")]
pub struct VersionParseError(pub String);

impl Version {
    /// Create a version from its components
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    /// Parse `"2.4"` as `2.4.0`; anything non-numeric is an error
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(VersionParseError(s.to_string()));
        }
        let mut components = [0u32; 3];
        let mut count = 0;
        for part in trimmed.split('.') {
            if count >= components.len() {
                return Err(VersionParseError(s.to_string()));
            }
            components[count] = part
                .parse::<u32>()
                .map_err(|_| VersionParseError(s.to_string()))?;
            count += 1;
        }
        Ok(Self::new(components[0], components[1], components[2]))
    }
}

impl TryFrom<String> for Version {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}
