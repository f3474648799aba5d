//! Upload transport
//!
//! Two strategies behind one entry point: the whole pending delta in a single
//! request, or table-by-table with large-object tables sent record by record.
//! Either way the logical outcome is the same - every planned record durably
//! stored server-side, or a typed failure naming what wasn't.

use serde_json::json;

use crate::catalog::{Catalog, TableUploadPlan};
use crate::config::{SyncConfig, TransportPreference};
use crate::error::{Result, SyncError};
use crate::models::{AbortFlag, CLIENT_VERSION};
use crate::protocol::{join_sql_literals, keys, ops, ServerReply, ServerRequest};
use crate::store::{LocalStore, StoredRow, PK_FIELD};

/// One server round trip. The implementation owns authentication and session
/// echo; callers only supply operation fields.
pub trait ServerApi {
    /// Perform one request; a reply reporting failure comes back as
    /// [`SyncError::Server`].
    async fn call(&mut self, request: ServerRequest) -> Result<ServerReply>;
}

/// HTTP implementation of [`ServerApi`] over the form-encoded API
pub struct HttpServerApi {
    client: reqwest::Client,
    config: SyncConfig,
    session: Option<(String, String)>,
}

impl HttpServerApi {
    /// Build a client for the configured server
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            config,
            session: None,
        })
    }
}

impl ServerApi for HttpServerApi {
    async fn call(&mut self, mut request: ServerRequest) -> Result<ServerReply> {
        request.push_field(keys::CLIENT_VERSION, CLIENT_VERSION.to_string());
        request.push_field(keys::DEVICE, self.config.device_id.to_string());
        request.push_field(
            keys::DEVICE_FRIENDLY_NAME,
            self.config.device_friendly_name.clone(),
        );
        request.push_field(keys::USER, self.config.credentials.username.clone());
        request.push_field(keys::PASSWORD, self.config.credentials.password.clone());
        if let Some((id, token)) = &self.session {
            request.push_field(keys::SESSION_ID, id.clone());
            request.push_field(keys::SESSION_TOKEN, token.clone());
        }

        tracing::debug!(operation = request.operation(), "sending request");
        let response = self
            .client
            .post(&self.config.server_url)
            .form(request.fields())
            .send()
            .await?;
        let body = response.text().await?;

        let reply = ServerReply::parse(&body);
        reply.ensure_api_reply(&body)?;
        self.session = reply.session();
        if reply.success() {
            Ok(reply)
        } else {
            Err(SyncError::Server(reply.error_message()))
        }
    }
}

/// Which strategy a session will use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    OneStep,
    MultiStep,
}

/// Pick the transport strategy from preference, estimate and threshold
#[must_use]
pub fn select_mode(
    preference: TransportPreference,
    estimated_bytes: u64,
    threshold_bytes: u64,
) -> TransportMode {
    let mode = match preference {
        TransportPreference::AlwaysOneStep => TransportMode::OneStep,
        TransportPreference::AlwaysMultiStep => TransportMode::MultiStep,
        TransportPreference::Auto => {
            if estimated_bytes < threshold_bytes {
                TransportMode::OneStep
            } else {
                TransportMode::MultiStep
            }
        }
    };
    tracing::debug!(?preference, estimated_bytes, threshold_bytes, ?mode, "transport selected");
    mode
}

/// Receives transport progress. The CLI prints these; tests mostly ignore
/// them, so every method defaults to a no-op.
pub trait ProgressListener {
    fn table_started(&mut self, _table: &str, _records: usize) {}
    fn record_sent(&mut self, _table: &str, _sent: usize, _total: usize) {}
    fn table_finished(&mut self, _table: &str) {}
}

/// Listener that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressListener for NullProgress {}

/// One record the server refused during a recordwise upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub table: String,
    pub pk: i64,
    pub reason: String,
}

/// What a completed transport run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub mode: TransportMode,
    pub tables_sent: Vec<String>,
    pub records_sent: usize,
}

/// Run the full upload exchange for a cataloged session.
///
/// `finalizing` asks the server to preserve the uploaded records. The abort
/// flag is consulted between tables and between recordwise sends; records the
/// server has already acknowledged are never rolled back.
pub async fn execute<A: ServerApi>(
    api: &mut A,
    store: &dyn LocalStore,
    catalog: &Catalog,
    mode: TransportMode,
    finalizing: bool,
    abort: &AbortFlag,
    progress: &mut dyn ProgressListener,
) -> Result<UploadOutcome> {
    match mode {
        TransportMode::OneStep => execute_one_step(api, store, catalog, finalizing).await,
        TransportMode::MultiStep => {
            execute_multi_step(api, store, catalog, finalizing, abort, progress).await
        }
    }
}

async fn execute_one_step<A: ServerApi>(
    api: &mut A,
    store: &dyn LocalStore,
    catalog: &Catalog,
    finalizing: bool,
) -> Result<UploadOutcome> {
    let mut dbdata = serde_json::Map::new();
    let mut pknames = serde_json::Map::new();
    let mut records_sent = 0;

    for plan in &catalog.plans {
        let rows = store.rows(&plan.table)?;
        records_sent += rows.len();
        dbdata.insert(plan.table.clone(), table_dump(store, &plan.table, &rows)?);
        pknames.insert(plan.table.clone(), json!(PK_FIELD));
    }
    for table in &catalog.empty_tables {
        dbdata.insert(table.clone(), table_dump(store, table, &[])?);
        pknames.insert(table.clone(), json!(PK_FIELD));
    }

    let request = ServerRequest::new(ops::UPLOAD_ENTIRE_DATABASE)
        .field(keys::DBDATA, serde_json::to_string(&dbdata)?)
        .field(keys::PKNAMEINFO, serde_json::to_string(&pknames)?)
        .field(keys::FINALIZING, if finalizing { "1" } else { "0" });
    api.call(request).await?;

    tracing::info!(
        tables = catalog.plans.len(),
        records = records_sent,
        "one-step upload accepted"
    );
    Ok(UploadOutcome {
        mode: TransportMode::OneStep,
        tables_sent: catalog.plans.iter().map(|plan| plan.table.clone()).collect(),
        records_sent,
    })
}

fn table_dump(
    store: &dyn LocalStore,
    table: &str,
    rows: &[StoredRow],
) -> Result<serde_json::Value> {
    let records: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| json!(row.values))
        .collect();
    Ok(json!({
        "fields": store.field_names(table)?,
        "records": records,
    }))
}

async fn execute_multi_step<A: ServerApi>(
    api: &mut A,
    store: &dyn LocalStore,
    catalog: &Catalog,
    finalizing: bool,
    abort: &AbortFlag,
    progress: &mut dyn ProgressListener,
) -> Result<UploadOutcome> {
    api.call(ServerRequest::new(ops::START_UPLOAD)).await?;
    if finalizing {
        api.call(ServerRequest::new(ops::START_PRESERVATION)).await?;
    }

    if !catalog.empty_tables.is_empty() {
        let request = ServerRequest::new(ops::UPLOAD_EMPTY_TABLES)
            .field(keys::TABLES, catalog.empty_tables.join(","));
        api.call(request).await?;
    }

    let mut records_sent = 0;
    let mut tables_sent = Vec::new();
    for plan in &catalog.plans {
        if abort.is_set() {
            return Err(SyncError::Aborted);
        }
        let rows = store.rows(&plan.table)?;
        progress.table_started(&plan.table, rows.len());
        records_sent += if plan.force_recordwise {
            send_table_recordwise(api, plan, &rows, abort, progress).await?
        } else {
            send_table_whole(api, plan, &rows).await?
        };
        progress.table_finished(&plan.table);
        tables_sent.push(plan.table.clone());
    }

    api.call(ServerRequest::new(ops::END_UPLOAD)).await?;
    tracing::info!(
        tables = tables_sent.len(),
        records = records_sent,
        "multi-step upload complete"
    );
    Ok(UploadOutcome {
        mode: TransportMode::MultiStep,
        tables_sent,
        records_sent,
    })
}

async fn send_table_whole<A: ServerApi>(
    api: &mut A,
    plan: &TableUploadPlan,
    rows: &[StoredRow],
) -> Result<usize> {
    let mut request = ServerRequest::new(ops::UPLOAD_TABLE)
        .field(keys::TABLE, plan.table.clone())
        .field(keys::PKNAME, PK_FIELD)
        .field(keys::NRECORDS, rows.len().to_string());
    for (index, row) in rows.iter().enumerate() {
        request.push_field(
            &format!("{}{index}", keys::NRECORDS_FIELD_PREFIX),
            join_sql_literals(&row.values),
        );
    }
    api.call(request).await?;
    tracing::debug!(table = %plan.table, records = rows.len(), "table uploaded");
    Ok(rows.len())
}

/// Recordwise send: prune server-side strays, ask which keys the server still
/// wants, then send those one at a time. A single rejected record fails only
/// itself; the table-level failure is raised after the last record, naming
/// every rejected one.
async fn send_table_recordwise<A: ServerApi>(
    api: &mut A,
    plan: &TableUploadPlan,
    rows: &[StoredRow],
    abort: &AbortFlag,
    progress: &mut dyn ProgressListener,
) -> Result<usize> {
    let pk_csv = rows
        .iter()
        .map(|row| row.pk.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let prune = ServerRequest::new(ops::DELETE_WHERE_KEY_NOT)
        .field(keys::TABLE, plan.table.clone())
        .field(keys::PKNAME, PK_FIELD)
        .field(keys::PKVALUES, pk_csv.clone());
    api.call(prune).await?;

    let date_csv = rows
        .iter()
        .map(|row| row.when_modified.clone().unwrap_or_default())
        .collect::<Vec<_>>()
        .join(",");
    let move_off_csv = rows
        .iter()
        .map(|row| if row.move_off { "1" } else { "0" })
        .collect::<Vec<_>>()
        .join(",");
    let which = ServerRequest::new(ops::WHICH_KEYS_TO_SEND)
        .field(keys::TABLE, plan.table.clone())
        .field(keys::PKNAME, PK_FIELD)
        .field(keys::PKVALUES, pk_csv)
        .field(keys::DATEVALUES, date_csv)
        .field(keys::MOVE_OFF_VALUES, move_off_csv);
    let reply = api.call(which).await?;
    let wanted = wanted_pks(&reply);

    let mut sent = 0;
    let mut failures = Vec::new();
    for row in rows {
        if !wanted.contains(&row.pk) {
            continue;
        }
        if abort.is_set() {
            return Err(SyncError::Aborted);
        }
        let request = ServerRequest::new(ops::UPLOAD_RECORD)
            .field(keys::TABLE, plan.table.clone())
            .field(keys::PKNAME, PK_FIELD)
            .field(keys::VALUES, join_sql_literals(&row.values));
        match api.call(request).await {
            Ok(_) => {
                sent += 1;
                progress.record_sent(&plan.table, sent, wanted.len());
            }
            Err(SyncError::Server(reason)) => {
                tracing::warn!(table = %plan.table, pk = row.pk, %reason, "record rejected");
                failures.push(RecordFailure {
                    table: plan.table.clone(),
                    pk: row.pk,
                    reason,
                });
            }
            Err(other) => return Err(other),
        }
    }

    if failures.is_empty() {
        tracing::debug!(table = %plan.table, records = sent, "recordwise table uploaded");
        Ok(sent)
    } else {
        Err(SyncError::RecordsRejected {
            table: plan.table.clone(),
            failures,
        })
    }
}

/// Primary keys the server asked for in a `which_keys_to_send` reply
fn wanted_pks(reply: &ServerReply) -> Vec<i64> {
    reply
        .get(keys::RESULT)
        .map(|csv| {
            csv.split(',')
                .filter_map(|piece| piece.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::test_support::{MockServerApi, SimulatedServer};
    use super::*;
    use crate::catalog::catalog;
    use crate::models::{ServerInfo, Version};
    use crate::store::test_support::open_test_db;
    use crate::store::SqliteStore;

    fn full_server_info() -> ServerInfo {
        ServerInfo {
            server_version: Version::new(2, 4, 0),
            allowed_tables: ["patient", "patient_idnum", "blobs", "phq9", "cecaq3"]
                .iter()
                .map(|name| ((*name).to_string(), Version::new(2, 0, 0)))
                .collect(),
            ..ServerInfo::default()
        }
    }

    fn seed_data(conn: &rusqlite::Connection) {
        conn.execute_batch(
            "INSERT INTO patient (id, forename, surname, sex) VALUES (1, 'J', 'S', 'M');
             INSERT INTO patient_idnum (id, patient_id, which_idnum, idnum_value)
                 VALUES (1, 1, 1, 100);
             INSERT INTO phq9 (id, patient_id, total_score, when_modified)
                 VALUES (1, 1, 10, '2026-08-01'), (2, 1, 14, '2026-08-02');
             INSERT INTO blobs (id, src_table, src_pk, src_field, data, when_modified)
                 VALUES (1, 'phq9', 1, 'photo', X'AB', '2026-08-01');",
        )
        .unwrap();
    }

    #[test]
    fn threshold_selects_transport_mode() {
        assert_eq!(
            select_mode(TransportPreference::Auto, 500_000, 2_000_000),
            TransportMode::OneStep
        );
        assert_eq!(
            select_mode(TransportPreference::Auto, 500_000, 100_000),
            TransportMode::MultiStep
        );
        assert_eq!(
            select_mode(TransportPreference::AlwaysOneStep, u64::MAX, 1),
            TransportMode::OneStep
        );
        assert_eq!(
            select_mode(TransportPreference::AlwaysMultiStep, 0, u64::MAX),
            TransportMode::MultiStep
        );
    }

    #[tokio::test]
    async fn multi_step_sequences_operations() {
        let conn = open_test_db();
        seed_data(&conn);
        let store = SqliteStore::new(&conn);
        let plan = catalog(
            &store,
            &full_server_info(),
            Version::new(2, 4, 0),
            &std::collections::BTreeMap::new(),
        )
        .unwrap();

        let mut api = MockServerApi::new();
        let outcome = execute(
            &mut api,
            &store,
            &plan,
            TransportMode::MultiStep,
            true,
            &AbortFlag::new(),
            &mut NullProgress,
        )
        .await
        .unwrap();

        let operations = api.operations();
        assert_eq!(operations[0], ops::START_UPLOAD);
        assert_eq!(operations[1], ops::START_PRESERVATION);
        assert_eq!(operations[2], ops::UPLOAD_EMPTY_TABLES);
        assert_eq!(operations.last().copied(), Some(ops::END_UPLOAD));
        // Blob table goes recordwise.
        assert!(operations.contains(&ops::DELETE_WHERE_KEY_NOT));
        assert!(operations.contains(&ops::WHICH_KEYS_TO_SEND));
        assert!(outcome.records_sent >= 4);
    }

    #[tokio::test]
    async fn copy_mode_skips_preservation() {
        let conn = open_test_db();
        seed_data(&conn);
        let store = SqliteStore::new(&conn);
        let plan = catalog(
            &store,
            &full_server_info(),
            Version::new(2, 4, 0),
            &std::collections::BTreeMap::new(),
        )
        .unwrap();

        let mut api = MockServerApi::new();
        execute(
            &mut api,
            &store,
            &plan,
            TransportMode::MultiStep,
            false,
            &AbortFlag::new(),
            &mut NullProgress,
        )
        .await
        .unwrap();
        assert!(!api.operations().contains(&ops::START_PRESERVATION));
    }

    #[tokio::test]
    async fn one_step_and_multi_step_agree_on_final_server_state() {
        let conn = open_test_db();
        seed_data(&conn);
        let store = SqliteStore::new(&conn);
        let plan = catalog(
            &store,
            &full_server_info(),
            Version::new(2, 4, 0),
            &std::collections::BTreeMap::new(),
        )
        .unwrap();

        let mut one_step = SimulatedServer::default();
        execute(
            &mut one_step,
            &store,
            &plan,
            TransportMode::OneStep,
            true,
            &AbortFlag::new(),
            &mut NullProgress,
        )
        .await
        .unwrap();

        let mut multi_step = SimulatedServer::default();
        execute(
            &mut multi_step,
            &store,
            &plan,
            TransportMode::MultiStep,
            true,
            &AbortFlag::new(),
            &mut NullProgress,
        )
        .await
        .unwrap();

        assert_eq!(one_step.tables, multi_step.tables);
        assert!(one_step.preserving);
        assert!(multi_step.preserving);
        assert_eq!(one_step.tables["phq9"].len(), 2);
    }

    #[tokio::test]
    async fn rejected_record_fails_only_itself() {
        let conn = open_test_db();
        conn.execute_batch(
            "INSERT INTO blobs (id, src_table, src_pk, src_field, data)
             VALUES (1, 'phq9', 1, 'a', X'01'), (2, 'phq9', 2, 'b', X'02'),
                    (3, 'phq9', 3, 'c', X'03');
             INSERT INTO phq9 (id) VALUES (1), (2), (3);",
        )
        .unwrap();
        let store = SqliteStore::new(&conn);
        let plan = catalog(
            &store,
            &full_server_info(),
            Version::new(2, 4, 0),
            &std::collections::BTreeMap::new(),
        )
        .unwrap();

        let mut api = MockServerApi::new();
        // start_upload, empty tables, blobs prune, which_keys (wants all three).
        api.push_ok();
        api.push_ok();
        api.push_ok();
        api.push_ok_with(&[(keys::RESULT, "1,2,3")]);
        // Record 1 ok, record 2 rejected, record 3 ok.
        api.push_ok();
        api.push_error("checksum mismatch");
        api.push_ok();

        let error = execute(
            &mut api,
            &store,
            &plan,
            TransportMode::MultiStep,
            false,
            &AbortFlag::new(),
            &mut NullProgress,
        )
        .await
        .unwrap_err();

        let SyncError::RecordsRejected { table, failures } = error else {
            panic!("expected RecordsRejected");
        };
        assert_eq!(table, "blobs");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].pk, 2);
        assert_eq!(failures[0].reason, "checksum mismatch");
        // All three records were attempted despite the mid-table rejection.
        let record_sends = api
            .operations()
            .iter()
            .filter(|operation| **operation == ops::UPLOAD_RECORD)
            .count();
        assert_eq!(record_sends, 3);
    }

    #[tokio::test]
    async fn abort_between_tables_stops_without_rollback() {
        let conn = open_test_db();
        seed_data(&conn);
        let store = SqliteStore::new(&conn);
        let plan = catalog(
            &store,
            &full_server_info(),
            Version::new(2, 4, 0),
            &std::collections::BTreeMap::new(),
        )
        .unwrap();

        let abort = AbortFlag::new();
        abort.request_abort();
        let mut api = MockServerApi::new();
        let error = execute(
            &mut api,
            &store,
            &plan,
            TransportMode::MultiStep,
            false,
            &abort,
            &mut NullProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(error, SyncError::Aborted));
        // The session opener went out; no table data followed, and nothing
        // was retracted.
        assert!(api.operations().contains(&ops::START_UPLOAD));
        assert!(!api.operations().contains(&ops::UPLOAD_TABLE));
        assert!(!api.operations().contains(&ops::END_UPLOAD));
    }
}
