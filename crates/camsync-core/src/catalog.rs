//! Per-session table inventory
//!
//! Before anything is transmitted, every local table is checked against the
//! server's capabilities. The ruling principle: version or availability skew
//! in a table that carries no data never blocks a sync, but a table that does
//! carry data is never silently dropped - that aborts the session instead.

use std::collections::BTreeMap;

use crate::error::{Result, SyncError};
use crate::models::{ServerInfo, Version};
use crate::store::{LocalStore, BLOB_TABLE};

/// One table cleared for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableUploadPlan {
    pub table: String,
    pub row_count: usize,
    /// Approximate wire size of the pending rows
    pub payload_bytes: u64,
    /// Large-object tables are always sent record by record
    pub force_recordwise: bool,
}

/// A table left out of the session without risk to data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSkip {
    pub table: String,
    pub reason: String,
}

/// The catalog result: what to send, what to mark empty, what to skip
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    /// Non-empty, compatible tables, in name order
    pub plans: Vec<TableUploadPlan>,
    /// Empty but server-accepted tables; the server is told they are empty
    pub empty_tables: Vec<String>,
    /// Tables skipped with a warning
    pub skipped: Vec<TableSkip>,
}

impl Catalog {
    /// Total estimated wire size across all planned tables
    #[must_use]
    pub fn total_payload_bytes(&self) -> u64 {
        self.plans.iter().map(|plan| plan.payload_bytes).sum()
    }

    #[must_use]
    pub fn table_names(&self) -> Vec<&str> {
        self.plans.iter().map(|plan| plan.table.as_str()).collect()
    }
}

/// Build the session catalog.
///
/// `client_min_server_versions` carries each table's own minimum server
/// version, where one exists; tables not listed fall back to the global
/// minimum already enforced at registration.
pub fn catalog(
    store: &dyn LocalStore,
    server_info: &ServerInfo,
    client_version: Version,
    client_min_server_versions: &BTreeMap<String, Version>,
) -> Result<Catalog> {
    let mut result = Catalog::default();

    for table in store.client_tables()? {
        let row_count = store.row_count(&table)?;
        let non_empty = row_count > 0;

        if !server_info.allows_table(&table) {
            if non_empty {
                return Err(SyncError::IncompatibleTable {
                    table,
                    reason: "not accepted by this server".to_string(),
                });
            }
            skip(&mut result, table, "not accepted by this server");
            continue;
        }

        if let Some(required) = server_info.min_client_version_for(&table) {
            if client_version < required {
                if non_empty {
                    return Err(SyncError::IncompatibleTable {
                        table,
                        reason: format!(
                            "server requires client version {required}, this client is {client_version}"
                        ),
                    });
                }
                skip(
                    &mut result,
                    table,
                    &format!("server requires client version {required}"),
                );
                continue;
            }
        }

        if let Some(&required) = client_min_server_versions.get(&table) {
            if server_info.server_version < required {
                if non_empty {
                    return Err(SyncError::IncompatibleTable {
                        table,
                        reason: format!(
                            "this client requires server version {required}, server is {}",
                            server_info.server_version
                        ),
                    });
                }
                skip(
                    &mut result,
                    table,
                    &format!("this client requires server version {required}"),
                );
                continue;
            }
        }

        if non_empty {
            result.plans.push(TableUploadPlan {
                payload_bytes: store.payload_bytes(&table)?,
                force_recordwise: table == BLOB_TABLE,
                table,
                row_count,
            });
        } else {
            result.empty_tables.push(table);
        }
    }

    tracing::debug!(
        planned = result.plans.len(),
        empty = result.empty_tables.len(),
        skipped = result.skipped.len(),
        "table catalog complete"
    );
    Ok(result)
}

fn skip(result: &mut Catalog, table: String, reason: &str) {
    tracing::warn!(table = %table, reason, "skipping empty table");
    result.skipped.push(TableSkip {
        table,
        reason: reason.to_string(),
    });
}
