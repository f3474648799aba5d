//! Server capability snapshot
//!
//! Everything the server tells us about itself during registration or an
//! info fetch. Replaced wholesale on refresh, never field-merged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::version::Version;

/// Description of one ID number type, as defined server-side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdNumDescription {
    /// Which ID number type this describes
    pub which_idnum: u16,
    /// Long description, e.g. "NHS number"
    pub description: String,
    /// Short description, e.g. "NHS"
    pub short_description: String,
    /// Server-side validation method name, if any (newer servers only)
    pub validation_method: Option<String>,
}

/// A localized extra string delivered by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraString {
    pub task: String,
    pub name: String,
    pub language: String,
    pub value: String,
}

/// The last-fetched server capability snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server protocol version
    pub server_version: Version,
    /// Server database title
    pub database_title: String,
    /// Minimum identifiers for a patient to be transferable at all
    pub upload_policy: String,
    /// Minimum identifiers for a patient's data to be irreversibly moved
    pub finalize_policy: String,
    /// ID number type -> descriptions
    pub id_descriptions: BTreeMap<u16, IdNumDescription>,
    /// Allowed table name -> minimum client version the server requires
    pub allowed_tables: BTreeMap<String, Version>,
    /// Localized extra strings
    pub extra_strings: Vec<ExtraString>,
}

impl ServerInfo {
    /// Is `table` accepted by this server at all?
    #[must_use]
    pub fn allows_table(&self, table: &str) -> bool {
        self.allowed_tables.contains_key(table)
    }

    /// The server's minimum client version for `table`, if the table exists
    #[must_use]
    pub fn min_client_version_for(&self, table: &str) -> Option<Version> {
        self.allowed_tables.get(table).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lookups() {
        let info = ServerInfo {
            allowed_tables: BTreeMap::from([("phq9".to_string(), Version::new(2, 0, 0))]),
            ..ServerInfo::default()
        };
        assert!(info.allows_table("phq9"));
        assert!(!info.allows_table("cecaq3"));
        assert_eq!(
            info.min_client_version_for("phq9"),
            Some(Version::new(2, 0, 0))
        );
    }
}
