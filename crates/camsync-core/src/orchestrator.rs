//! Top-level synchronization state machine
//!
//! One session runs the fixed pipeline: registration check, server info
//! fetch, policy validation, table cataloging, patient validation, transport,
//! finalization. Any component failure becomes the session's terminal
//! outcome; the orchestrator is the single place deciding fatal versus warn.
//!
//! Abort is honored at state boundaries. An in-flight request completes or
//! fails on its own first, and recordwise progress the server has already
//! acknowledged stays acknowledged.

use std::collections::BTreeMap;

use serde_json::json;

use crate::cache::ServerInfoCache;
use crate::catalog::{catalog, Catalog, TableSkip};
use crate::cleanup::{self, CleanupReport};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::models::{
    AbortFlag, ServerInfo, SessionMode, Version, CLIENT_VERSION, MINIMUM_SERVER_VERSION,
};
use crate::policy::IdPolicy;
use crate::protocol::{
    allowed_tables_from_records, extra_strings_from_records, keys, ops, ServerIdentification,
    ServerRequest, WireRecord,
};
use crate::resolver::{resolve, PatientResolution};
use crate::store::LocalStore;
use crate::transport::{
    execute, select_mode, NullProgress, ProgressListener, ServerApi, TransportMode, UploadOutcome,
};

/// Where a session currently is, or where it ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    RegistrationCheck,
    ServerInfoFetch,
    PolicyValidation,
    TableCataloging,
    PatientValidation,
    TransportExecution,
    Finalization,
    Completed,
    Failed,
    Aborted,
}

/// Everything a completed session can tell the caller
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub warnings: Vec<String>,
    pub skipped_tables: Vec<TableSkip>,
    /// Patients copied instead of moved for failing the finalize policy
    pub demoted_patients: Vec<String>,
    pub upload: Option<UploadOutcome>,
    pub cleanup: Option<CleanupReport>,
}

/// What one validated session is about to do. Built fresh per run once the
/// patients clear validation, then dropped with the session.
struct UploadSession {
    mode: SessionMode,
    transport_mode: TransportMode,
    finalizing: bool,
    plan: Catalog,
    resolutions: Vec<PatientResolution>,
}

/// Drives one synchronization session over one server connection
pub struct SyncOrchestrator<'a, A: ServerApi> {
    api: &'a mut A,
    store: &'a dyn LocalStore,
    config: &'a SyncConfig,
    cache: &'a mut ServerInfoCache,
    abort: AbortFlag,
    progress: Option<&'a mut dyn ProgressListener>,
    /// Per-table minimum server versions, from the task registry
    min_server_versions: BTreeMap<String, Version>,
    state: SyncState,
}

impl<'a, A: ServerApi> SyncOrchestrator<'a, A> {
    pub fn new(
        api: &'a mut A,
        store: &'a dyn LocalStore,
        config: &'a SyncConfig,
        cache: &'a mut ServerInfoCache,
        abort: AbortFlag,
    ) -> Self {
        Self {
            api,
            store,
            config,
            cache,
            abort,
            progress: None,
            min_server_versions: BTreeMap::new(),
            state: SyncState::Idle,
        }
    }

    /// Supply per-table minimum server versions before running
    pub fn with_min_server_versions(mut self, versions: BTreeMap<String, Version>) -> Self {
        self.min_server_versions = versions;
        self
    }

    /// Attach a listener for transport progress
    pub fn with_progress(mut self, listener: &'a mut dyn ProgressListener) -> Self {
        self.progress = Some(listener);
        self
    }

    #[must_use]
    pub const fn state(&self) -> SyncState {
        self.state
    }

    /// Register this device with the server and cache its capabilities
    pub async fn register(&mut self) -> Result<ServerInfo> {
        self.config.validate()?;
        let request = ServerRequest::new(ops::REGISTER);
        let reply = self.api.call(request).await?;
        let identification = ServerIdentification::try_from(&reply)?;
        let info = self.assemble_server_info(identification).await?;
        self.cache.refresh(info.clone());
        tracing::info!(server_version = %info.server_version, "device registered");
        Ok(info)
    }

    /// Fetch the server's current capabilities and refresh the cache
    pub async fn fetch_server_info(&mut self) -> Result<ServerInfo> {
        self.config.validate()?;
        let reply = self.api.call(ServerRequest::new(ops::GET_ID_INFO)).await?;
        let identification = ServerIdentification::try_from(&reply)?;
        let info = self.assemble_server_info(identification).await?;
        self.cache.refresh(info.clone());
        Ok(info)
    }

    /// Fetch the server's task schedules for this device
    pub async fn fetch_task_schedules(&mut self) -> Result<Vec<WireRecord>> {
        self.config.validate()?;
        let reply = self.api.call(ServerRequest::new(ops::GET_TASK_SCHEDULES)).await?;
        if reply.record_count() == 0 {
            return Ok(Vec::new());
        }
        reply.records()
    }

    /// Run one full session. On error the state is `Failed` (or `Aborted`).
    pub async fn run(&mut self, mode: SessionMode, force_fetch: bool) -> Result<SyncReport> {
        let result = self.run_inner(mode, force_fetch).await;
        match &result {
            Ok(_) => self.state = SyncState::Completed,
            Err(SyncError::Aborted) => self.state = SyncState::Aborted,
            Err(_) => self.state = SyncState::Failed,
        }
        result
    }

    async fn run_inner(&mut self, mode: SessionMode, force_fetch: bool) -> Result<SyncReport> {
        self.config.validate()?;
        let mut report = SyncReport::default();

        self.enter(SyncState::RegistrationCheck)?;
        self.check_registered().await?;

        self.enter(SyncState::ServerInfoFetch)?;
        let previous_policies = self
            .cache
            .get()
            .map(|info| (info.upload_policy.clone(), info.finalize_policy.clone()));
        if force_fetch || self.cache.is_stale() {
            self.fetch_server_info().await?;
        }
        let info = self
            .cache
            .get()
            .ok_or_else(|| SyncError::Config("no server info available".to_string()))?
            .clone();

        self.enter(SyncState::PolicyValidation)?;
        let upload_policy = parse_policy("upload", &info.upload_policy)?;
        let finalize_policy = parse_policy("finalize", &info.finalize_policy)?;
        if let Some((old_upload, old_finalize)) = previous_policies {
            if old_upload != info.upload_policy || old_finalize != info.finalize_policy {
                let warning = format!(
                    "server ID policies have changed (upload: {:?} -> {:?}, finalize: {:?} -> {:?}); using the server's current policies",
                    old_upload, info.upload_policy, old_finalize, info.finalize_policy
                );
                tracing::warn!("{warning}");
                report.warnings.push(warning);
            }
        }

        self.enter(SyncState::TableCataloging)?;
        let plan = catalog(self.store, &info, CLIENT_VERSION, &self.min_server_versions)?;
        report.skipped_tables = plan.skipped.clone();
        for skipped in &plan.skipped {
            report
                .warnings
                .push(format!("table {} skipped: {}", skipped.table, skipped.reason));
        }

        self.enter(SyncState::PatientValidation)?;
        let patients = self.store.patients()?;
        let resolutions = resolve(mode, &patients, &upload_policy, &finalize_policy)?;
        report.demoted_patients = resolutions
            .iter()
            .filter(|resolution| resolution.demoted)
            .map(|resolution| resolution.description.clone())
            .collect();
        self.validate_patients_with_server(&patients, &resolutions)
            .await?;

        self.enter(SyncState::TransportExecution)?;
        let session = UploadSession {
            mode,
            transport_mode: select_mode(
                self.config.transport_preference,
                plan.total_payload_bytes(),
                self.config.one_step_threshold_bytes,
            ),
            finalizing: resolutions
                .iter()
                .any(|resolution| resolution.action.finalizes()),
            plan,
            resolutions,
        };
        let mut silent = NullProgress;
        let progress = self.progress.as_deref_mut().unwrap_or(&mut silent);
        let outcome = execute(
            self.api,
            self.store,
            &session.plan,
            session.transport_mode,
            session.finalizing,
            &self.abort,
            progress,
        )
        .await?;
        report.upload = Some(outcome);

        self.enter(SyncState::Finalization)?;
        self.wipe_moved_on_server(session.mode, &session.resolutions)
            .await?;
        report.cleanup = Some(cleanup::finalize(
            self.store,
            session.mode,
            &session.resolutions,
        )?);

        tracing::info!(?mode, "synchronization complete");
        Ok(report)
    }

    fn enter(&mut self, next: SyncState) -> Result<()> {
        if self.abort.is_set() {
            tracing::info!(?next, "abort observed at state boundary");
            return Err(SyncError::Aborted);
        }
        self.state = next;
        Ok(())
    }

    async fn check_registered(&mut self) -> Result<()> {
        let checks = [ops::CHECK_DEVICE_REGISTERED, ops::CHECK_UPLOAD_USER_AND_DEVICE];
        for operation in checks {
            match self.api.call(ServerRequest::new(operation)).await {
                Ok(reply) => {
                    // Any reply may carry the server version; an upgrade seen
                    // here marks the cached capabilities stale.
                    if let Some(version) = reply.server_version() {
                        self.cache.observe_version(version);
                    }
                }
                Err(SyncError::Server(message)) => {
                    tracing::warn!(operation, %message, "device/user check refused");
                    return Err(SyncError::NotRegistered);
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    async fn assemble_server_info(
        &mut self,
        identification: ServerIdentification,
    ) -> Result<ServerInfo> {
        if identification.server_version < MINIMUM_SERVER_VERSION {
            return Err(SyncError::Protocol(format!(
                "server version {} is below the minimum supported {}",
                identification.server_version, MINIMUM_SERVER_VERSION
            )));
        }

        let tables_reply = self
            .api
            .call(ServerRequest::new(ops::GET_ALLOWED_TABLES))
            .await?;
        let allowed_tables = allowed_tables_from_records(&tables_reply.records()?)?;

        let strings_reply = self
            .api
            .call(ServerRequest::new(ops::GET_EXTRA_STRINGS))
            .await?;
        let extra_strings = if strings_reply.record_count() == 0 {
            Vec::new()
        } else {
            extra_strings_from_records(&strings_reply.records()?)?
        };

        Ok(identification.into_server_info(allowed_tables, extra_strings))
    }

    async fn validate_patients_with_server(
        &mut self,
        patients: &[crate::models::Patient],
        resolutions: &[PatientResolution],
    ) -> Result<()> {
        if patients.is_empty() {
            return Ok(());
        }
        let payload: Vec<serde_json::Value> = patients
            .iter()
            .map(|patient| {
                let finalizing = resolutions
                    .iter()
                    .find(|resolution| resolution.patient_pk == patient.pk)
                    .is_some_and(|resolution| resolution.action.finalizes());
                patient.validation_json(finalizing)
            })
            .collect();
        let request = ServerRequest::new(ops::VALIDATE_PATIENTS)
            .field(keys::PATIENT_INFO, serde_json::to_string(&json!(payload))?);
        self.api.call(request).await?;
        Ok(())
    }

    /// Ask the server to close out moved patients and anonymous tasks
    async fn wipe_moved_on_server(
        &mut self,
        mode: SessionMode,
        resolutions: &[PatientResolution],
    ) -> Result<()> {
        let moved: Vec<String> = resolutions
            .iter()
            .filter(|resolution| resolution.action.deletes_tasks())
            .map(|resolution| resolution.patient_pk.to_string())
            .collect();
        if moved.is_empty() && !mode.is_finalizing() {
            return Ok(());
        }
        let request = ServerRequest::new(ops::WIPE_SPECIFIED)
            .field(keys::PKVALUES, moved.join(","))
            .field(keys::FINALIZING, if mode.is_finalizing() { "1" } else { "0" });
        self.api.call(request).await?;
        Ok(())
    }
}

fn parse_policy(context: &str, text: &str) -> Result<IdPolicy> {
    IdPolicy::parse(text).map_err(|_| SyncError::InvalidPolicy {
        context: context.to_string(),
        text: text.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{Credentials, SyncConfig, TransportPreference};
    use crate::models::DeviceId;
    use crate::protocol::ServerReply;
    use crate::store::test_support::open_test_db;
    use crate::store::SqliteStore;
    use crate::transport::test_support::{ok_reply, SimulatedServer};

    /// Full protocol double: answers identification operations with canned
    /// data and delegates upload operations to a [`SimulatedServer`].
    struct FullServerMock {
        upload: SimulatedServer,
        operations: Vec<String>,
        device_known: bool,
        upload_policy: String,
        finalize_policy: String,
        allowed_tables: Vec<&'static str>,
        fail_operation: Option<&'static str>,
    }

    impl FullServerMock {
        fn new() -> Self {
            Self {
                upload: SimulatedServer::default(),
                operations: Vec::new(),
                device_known: true,
                upload_policy: "anyidnum".to_string(),
                finalize_policy: "idnum1".to_string(),
                allowed_tables: vec!["patient", "patient_idnum", "blobs", "phq9", "cecaq3"],
                fail_operation: None,
            }
        }

        fn saw(&self, operation: &str) -> bool {
            self.operations.iter().any(|seen| seen == operation)
        }
    }

    impl ServerApi for FullServerMock {
        async fn call(&mut self, request: ServerRequest) -> Result<ServerReply> {
            let operation = request.operation().to_string();
            self.operations.push(operation.clone());
            if Some(operation.as_str()) == self.fail_operation {
                return Err(SyncError::Server("scripted failure".to_string()));
            }
            match operation.as_str() {
                ops::CHECK_DEVICE_REGISTERED | ops::CHECK_UPLOAD_USER_AND_DEVICE => {
                    if self.device_known {
                        Ok(ok_reply(&[(keys::SERVER_VERSION, "2.4.6")]))
                    } else {
                        Err(SyncError::Server("unknown device".to_string()))
                    }
                }
                ops::GET_ID_INFO | ops::REGISTER => Ok(ok_reply(&[
                    (keys::SERVER_VERSION, "2.4.6"),
                    (keys::DATABASE_TITLE, "Test DB"),
                    (keys::ID_POLICY_UPLOAD, self.upload_policy.as_str()),
                    (keys::ID_POLICY_FINALIZE, self.finalize_policy.as_str()),
                    ("idDescription1", "NHS number"),
                    ("idShortDescription1", "NHS"),
                ])),
                ops::GET_ALLOWED_TABLES => {
                    let mut extra: Vec<(String, String)> = vec![
                        (keys::NFIELDS.to_string(), "2".to_string()),
                        (
                            keys::NRECORDS.to_string(),
                            self.allowed_tables.len().to_string(),
                        ),
                        (
                            keys::FIELDS.to_string(),
                            "tablename,min_client_version".to_string(),
                        ),
                    ];
                    for (index, table) in self.allowed_tables.iter().enumerate() {
                        extra.push((format!("record{index}"), format!("'{table}','2.0.0'")));
                    }
                    let pairs: Vec<(&str, &str)> = extra
                        .iter()
                        .map(|(key, value)| (key.as_str(), value.as_str()))
                        .collect();
                    Ok(ok_reply(&pairs))
                }
                ops::GET_EXTRA_STRINGS | ops::GET_TASK_SCHEDULES => {
                    Ok(ok_reply(&[(keys::NRECORDS, "0")]))
                }
                ops::VALIDATE_PATIENTS | ops::WIPE_SPECIFIED => Ok(ok_reply(&[])),
                _ => self.upload.call(request).await,
            }
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            server_url: "https://server.example.org/api".to_string(),
            credentials: Credentials {
                username: "uploader".to_string(),
                password: "pw".to_string(),
            },
            device_id: DeviceId::new(),
            device_friendly_name: "test tablet".to_string(),
            timeout: std::time::Duration::from_secs(5),
            transport_preference: TransportPreference::Auto,
            one_step_threshold_bytes: 2_000_000,
            allow_insecure_http: false,
        }
    }

    fn seed_compliant_patient(conn: &rusqlite::Connection) {
        conn.execute_batch(
            "INSERT INTO patient (id, forename, surname, sex) VALUES (1, 'J', 'Smith', 'M');
             INSERT INTO patient_idnum (id, patient_id, which_idnum, idnum_value)
                 VALUES (1, 1, 1, 100);
             INSERT INTO phq9 (id, patient_id, total_score, when_modified)
                 VALUES (1, 1, 9, '2026-08-01');",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn full_copy_session_completes() {
        let conn = open_test_db();
        seed_compliant_patient(&conn);
        let store = SqliteStore::new(&conn);
        let config = test_config();
        let mut cache = ServerInfoCache::new();
        let mut api = FullServerMock::new();

        let mut orchestrator =
            SyncOrchestrator::new(&mut api, &store, &config, &mut cache, AbortFlag::new());
        let report = orchestrator.run(SessionMode::Copy, false).await.unwrap();

        assert_eq!(orchestrator.state(), SyncState::Completed);
        assert!(report.upload.is_some());
        assert!(report.cleanup.is_some());
        assert!(api.upload.tables.contains_key("phq9"));
        // Copy mode leaves local data alone.
        assert_eq!(store.row_count("phq9").unwrap(), 1);
        // No moves, so no server-side wipe.
        assert!(!api.saw(ops::WIPE_SPECIFIED));
    }

    #[tokio::test]
    async fn move_session_wipes_locally_and_server_side() {
        let conn = open_test_db();
        seed_compliant_patient(&conn);
        let store = SqliteStore::new(&conn);
        let mut config = test_config();
        config.transport_preference = TransportPreference::AlwaysMultiStep;
        let mut cache = ServerInfoCache::new();
        let mut api = FullServerMock::new();

        let mut orchestrator =
            SyncOrchestrator::new(&mut api, &store, &config, &mut cache, AbortFlag::new());
        let report = orchestrator.run(SessionMode::Move, false).await.unwrap();

        assert!(api.saw(ops::START_PRESERVATION));
        assert!(api.saw(ops::WIPE_SPECIFIED));
        assert_eq!(store.row_count("phq9").unwrap(), 0);
        assert_eq!(store.row_count("patient").unwrap(), 0);
        assert_eq!(report.cleanup.unwrap().patients_deleted, 1);
    }

    #[tokio::test]
    async fn unknown_device_requires_reregistration() {
        let conn = open_test_db();
        let store = SqliteStore::new(&conn);
        let config = test_config();
        let mut cache = ServerInfoCache::new();
        let mut api = FullServerMock::new();
        api.device_known = false;

        let mut orchestrator =
            SyncOrchestrator::new(&mut api, &store, &config, &mut cache, AbortFlag::new());
        let error = orchestrator.run(SessionMode::Copy, false).await.unwrap_err();
        assert!(matches!(error, SyncError::NotRegistered));
        assert_eq!(orchestrator.state(), SyncState::Failed);
        assert!(!api.saw(ops::START_UPLOAD));
    }

    #[tokio::test]
    async fn zero_id_patient_halts_before_any_transfer() {
        let conn = open_test_db();
        conn.execute(
            "INSERT INTO patient (id, forename, surname) VALUES (1, 'No', 'Ids')",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO phq9 (id, patient_id) VALUES (1, 1)", [])
            .unwrap();
        let store = SqliteStore::new(&conn);
        let config = test_config();
        let mut cache = ServerInfoCache::new();
        let mut api = FullServerMock::new();

        let mut orchestrator =
            SyncOrchestrator::new(&mut api, &store, &config, &mut cache, AbortFlag::new());
        let error = orchestrator.run(SessionMode::Copy, false).await.unwrap_err();

        let SyncError::PatientsRejected(rejections) = error else {
            panic!("expected PatientsRejected");
        };
        assert_eq!(rejections.len(), 1);
        assert!(rejections[0].description.contains("Ids"));
        // Rejection happened before any upload operation.
        assert!(!api.saw(ops::START_UPLOAD));
        assert!(!api.saw(ops::UPLOAD_ENTIRE_DATABASE));
    }

    #[tokio::test]
    async fn abort_before_transport_never_finalizes() {
        let conn = open_test_db();
        seed_compliant_patient(&conn);
        let store = SqliteStore::new(&conn);
        let config = test_config();
        let mut cache = ServerInfoCache::new();
        let mut api = FullServerMock::new();
        let abort = AbortFlag::new();
        abort.request_abort();

        let mut orchestrator =
            SyncOrchestrator::new(&mut api, &store, &config, &mut cache, abort);
        let error = orchestrator.run(SessionMode::Move, false).await.unwrap_err();

        assert!(matches!(error, SyncError::Aborted));
        assert_eq!(orchestrator.state(), SyncState::Aborted);
        assert!(!api.saw(ops::WIPE_SPECIFIED));
        // Nothing was cleaned up locally.
        assert_eq!(store.row_count("phq9").unwrap(), 1);
    }

    #[tokio::test]
    async fn transport_failure_skips_finalization() {
        let conn = open_test_db();
        seed_compliant_patient(&conn);
        let store = SqliteStore::new(&conn);
        let config = test_config();
        let mut cache = ServerInfoCache::new();
        let mut api = FullServerMock::new();
        api.fail_operation = Some(ops::UPLOAD_ENTIRE_DATABASE);

        let mut orchestrator =
            SyncOrchestrator::new(&mut api, &store, &config, &mut cache, AbortFlag::new());
        let error = orchestrator.run(SessionMode::Move, false).await.unwrap_err();

        assert!(matches!(error, SyncError::Server(_)));
        assert_eq!(orchestrator.state(), SyncState::Failed);
        assert!(!api.saw(ops::WIPE_SPECIFIED));
        assert_eq!(store.row_count("phq9").unwrap(), 1);
    }

    #[tokio::test]
    async fn policy_change_is_a_warning_not_a_failure() {
        let conn = open_test_db();
        seed_compliant_patient(&conn);
        let store = SqliteStore::new(&conn);
        let config = test_config();
        let mut cache = ServerInfoCache::new();
        // Pre-populate the cache with different policies, then force a fetch.
        cache.refresh(ServerInfo {
            server_version: Version::new(2, 4, 6),
            upload_policy: "sex AND anyidnum".to_string(),
            finalize_policy: "sex AND idnum1".to_string(),
            ..ServerInfo::default()
        });
        let mut api = FullServerMock::new();

        let mut orchestrator =
            SyncOrchestrator::new(&mut api, &store, &config, &mut cache, AbortFlag::new());
        let report = orchestrator.run(SessionMode::Copy, true).await.unwrap();

        assert!(report
            .warnings
            .iter()
            .any(|warning| warning.contains("policies have changed")));
        assert_eq!(orchestrator.state(), SyncState::Completed);
    }

    #[tokio::test]
    async fn empty_unknown_table_does_not_block_the_session() {
        let conn = open_test_db();
        seed_compliant_patient(&conn);
        let store = SqliteStore::new(&conn);
        let config = test_config();
        let mut cache = ServerInfoCache::new();
        let mut api = FullServerMock::new();
        // Older server has never heard of cecaq3; the table is empty locally.
        api.allowed_tables = vec!["patient", "patient_idnum", "blobs", "phq9"];

        let mut orchestrator =
            SyncOrchestrator::new(&mut api, &store, &config, &mut cache, AbortFlag::new());
        let report = orchestrator.run(SessionMode::Copy, false).await.unwrap();

        assert_eq!(orchestrator.state(), SyncState::Completed);
        assert!(report
            .skipped_tables
            .iter()
            .any(|skipped| skipped.table == "cecaq3"));
        assert!(api.upload.tables.contains_key("phq9"));
    }

    #[tokio::test]
    async fn finalize_noncompliant_patient_is_demoted_and_kept() {
        let conn = open_test_db();
        // idnum2 passes "anyidnum" upload policy, fails "idnum1" finalize.
        conn.execute_batch(
            "INSERT INTO patient (id, forename, surname) VALUES (1, 'Partial', 'Ids');
             INSERT INTO patient_idnum (id, patient_id, which_idnum, idnum_value)
                 VALUES (1, 1, 2, 55);
             INSERT INTO phq9 (id, patient_id) VALUES (1, 1);",
        )
        .unwrap();
        let store = SqliteStore::new(&conn);
        let config = test_config();
        let mut cache = ServerInfoCache::new();
        let mut api = FullServerMock::new();

        let mut orchestrator =
            SyncOrchestrator::new(&mut api, &store, &config, &mut cache, AbortFlag::new());
        let report = orchestrator.run(SessionMode::Move, false).await.unwrap();

        assert_eq!(report.demoted_patients.len(), 1);
        // The demoted patient's data stays local despite the move request.
        assert_eq!(store.row_count("phq9").unwrap(), 1);
        assert_eq!(store.row_count("patient").unwrap(), 1);
    }

    #[tokio::test]
    async fn version_bump_seen_during_checks_forces_a_refetch() {
        let conn = open_test_db();
        seed_compliant_patient(&conn);
        let store = SqliteStore::new(&conn);
        let config = test_config();
        let mut cache = ServerInfoCache::new();
        // Cached snapshot predates a server upgrade to 2.4.6.
        cache.refresh(ServerInfo {
            server_version: Version::new(2, 4, 0),
            upload_policy: "anyidnum".to_string(),
            finalize_policy: "idnum1".to_string(),
            ..ServerInfo::default()
        });
        let mut api = FullServerMock::new();

        let mut orchestrator =
            SyncOrchestrator::new(&mut api, &store, &config, &mut cache, AbortFlag::new());
        orchestrator.run(SessionMode::Copy, false).await.unwrap();
        drop(orchestrator);

        // The upgrade was noticed during the registration checks and the
        // capabilities were refetched without --force-fetch.
        assert!(api.saw(ops::GET_ID_INFO));
        assert_eq!(cache.get().unwrap().server_version, Version::new(2, 4, 6));
    }

    #[tokio::test]
    async fn second_sync_reuses_fresh_cache() {
        let conn = open_test_db();
        seed_compliant_patient(&conn);
        let store = SqliteStore::new(&conn);
        let config = test_config();
        let mut cache = ServerInfoCache::new();

        let mut api = FullServerMock::new();
        let mut orchestrator =
            SyncOrchestrator::new(&mut api, &store, &config, &mut cache, AbortFlag::new());
        orchestrator.run(SessionMode::Copy, false).await.unwrap();
        drop(orchestrator);
        let first_fetches = api
            .operations
            .iter()
            .filter(|operation| *operation == ops::GET_ID_INFO)
            .count();
        assert_eq!(first_fetches, 1);

        let mut orchestrator =
            SyncOrchestrator::new(&mut api, &store, &config, &mut cache, AbortFlag::new());
        orchestrator.run(SessionMode::Copy, false).await.unwrap();
        let total_fetches = api
            .operations
            .iter()
            .filter(|operation| *operation == ops::GET_ID_INFO)
            .count();
        // Cache was fresh; no second fetch.
        assert_eq!(total_fetches, 1);
    }
}
