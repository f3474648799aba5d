//! camsync CLI - drive device-to-server synchronization from the terminal
//!
//! Server address and credentials come from the environment (or a `.env`
//! file): `CAMSYNC_SERVER_URL`, `CAMSYNC_USER`, `CAMSYNC_PASSWORD`, plus the
//! optional `CAMSYNC_DEVICE_NAME`, `CAMSYNC_TIMEOUT_SECS`,
//! `CAMSYNC_TRANSPORT` (auto | one-step | multi-step),
//! `CAMSYNC_ONE_STEP_THRESHOLD` and `CAMSYNC_ALLOW_HTTP` tuning knobs.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camsync_core::cache::ServerInfoCache;
use camsync_core::config::{
    Credentials, SyncConfig, TransportPreference, DEFAULT_ONE_STEP_THRESHOLD_BYTES,
    DEFAULT_TIMEOUT,
};
use camsync_core::store::{LocalStore, SqliteStore};
use camsync_core::transport::{HttpServerApi, ProgressListener};
use camsync_core::{
    AbortFlag, Device, ServerInfo, SessionMode, SyncError, SyncOrchestrator, SyncReport,
};
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::Connection;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "camsync")]
#[command(about = "Upload clinical assessment data to a CamCOPS-compatible server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to the local database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this device with the configured server
    Register,
    /// Run a synchronization session
    Sync {
        /// What to do with patient data after upload
        #[arg(long, value_enum, default_value_t = ModeArg::Copy)]
        mode: ModeArg,
        /// Refetch server info even if the cached copy looks fresh
        #[arg(long)]
        force_fetch: bool,
    },
    /// Show device, server and pending-data status
    Status,
    /// Fetch and display the server's current capabilities
    FetchInfo,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum ModeArg {
    /// Upload copies; everything stays on the device
    Copy,
    /// Move all data off the device
    Move,
    /// Move task data but keep patient records
    KeepPatients,
}

impl From<ModeArg> for SessionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Copy => Self::Copy,
            ModeArg::Move => Self::Move,
            ModeArg::KeepPatients => Self::KeepPatientsAndMove,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{0} is not set. Configure it in the environment or a .env file.")]
    MissingSetting(&'static str),
    #[error("Invalid value for {name}: {value}")]
    InvalidSetting { name: &'static str, value: String },
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        if matches!(error, CliError::Sync(SyncError::NotRegistered)) {
            eprintln!("Run `camsync register` first.");
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("camsync=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = resolve_data_dir()?;
    let db_path = cli
        .db_path
        .unwrap_or_else(|| data_dir.join("camsync.db"));

    match cli.command {
        Commands::Register => run_register(&data_dir, &db_path).await,
        Commands::Sync { mode, force_fetch } => {
            run_sync(&data_dir, &db_path, mode.into(), force_fetch).await
        }
        Commands::Status => run_status(&data_dir, &db_path),
        Commands::FetchInfo => run_fetch_info(&data_dir, &db_path).await,
    }
}

fn resolve_data_dir() -> Result<PathBuf, CliError> {
    let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join("camsync");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn device_path(data_dir: &Path) -> PathBuf {
    data_dir.join("device.json")
}

fn server_info_path(data_dir: &Path) -> PathBuf {
    data_dir.join("server_info.json")
}

fn load_or_create_device(data_dir: &Path) -> Result<Device, CliError> {
    let path = device_path(data_dir);
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        return Ok(serde_json::from_str(&raw)?);
    }
    let friendly_name =
        env::var("CAMSYNC_DEVICE_NAME").unwrap_or_else(|_| "camsync device".to_string());
    let device = Device::new(friendly_name);
    save_device(data_dir, &device)?;
    Ok(device)
}

fn save_device(data_dir: &Path, device: &Device) -> Result<(), CliError> {
    std::fs::write(
        device_path(data_dir),
        serde_json::to_string_pretty(device)?,
    )?;
    Ok(())
}

fn load_cache(data_dir: &Path) -> Result<ServerInfoCache, CliError> {
    let mut cache = ServerInfoCache::new();
    let path = server_info_path(data_dir);
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let info: ServerInfo = serde_json::from_str(&raw)?;
        cache.refresh(info);
    }
    Ok(cache)
}

fn save_cache(data_dir: &Path, cache: &ServerInfoCache) -> Result<(), CliError> {
    if let Some(info) = cache.get() {
        std::fs::write(
            server_info_path(data_dir),
            serde_json::to_string_pretty(info)?,
        )?;
    }
    Ok(())
}

fn config_from_env(device: &Device) -> Result<SyncConfig, CliError> {
    let timeout_secs = optional_u64("CAMSYNC_TIMEOUT_SECS")?;
    let threshold = optional_u64("CAMSYNC_ONE_STEP_THRESHOLD")?;
    let transport_preference = match env::var("CAMSYNC_TRANSPORT").ok().as_deref() {
        None | Some("auto") => TransportPreference::Auto,
        Some("one-step") => TransportPreference::AlwaysOneStep,
        Some("multi-step") => TransportPreference::AlwaysMultiStep,
        Some(other) => {
            return Err(CliError::InvalidSetting {
                name: "CAMSYNC_TRANSPORT",
                value: other.to_string(),
            })
        }
    };
    Ok(SyncConfig {
        server_url: require_env("CAMSYNC_SERVER_URL")?,
        credentials: Credentials {
            username: require_env("CAMSYNC_USER")?,
            password: require_env("CAMSYNC_PASSWORD")?,
        },
        device_id: device.id,
        device_friendly_name: device.friendly_name.clone(),
        timeout: timeout_secs.map_or(DEFAULT_TIMEOUT, Duration::from_secs),
        transport_preference,
        one_step_threshold_bytes: threshold.unwrap_or(DEFAULT_ONE_STEP_THRESHOLD_BYTES),
        allow_insecure_http: env_flag("CAMSYNC_ALLOW_HTTP"),
    })
}

fn env_flag(name: &str) -> bool {
    matches!(env::var(name).ok().as_deref(), Some("1" | "true" | "yes"))
}

fn require_env(name: &'static str) -> Result<String, CliError> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or(CliError::MissingSetting(name))
}

fn optional_u64(name: &'static str) -> Result<Option<u64>, CliError> {
    match env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| CliError::InvalidSetting { name, value: raw }),
    }
}

/// System tables the sync engine expects; task tables come from the task
/// layer's own migrations.
fn open_database(db_path: &Path) -> Result<Connection, CliError> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS patient (
             id INTEGER PRIMARY KEY,
             forename TEXT, surname TEXT, sex TEXT, dob TEXT,
             email TEXT, address TEXT, gp TEXT, other_details TEXT,
             when_modified TEXT,
             _move_off_device INTEGER NOT NULL DEFAULT 0
         );
         CREATE TABLE IF NOT EXISTS patient_idnum (
             id INTEGER PRIMARY KEY,
             patient_id INTEGER NOT NULL,
             which_idnum INTEGER NOT NULL,
             idnum_value INTEGER,
             when_modified TEXT,
             _move_off_device INTEGER NOT NULL DEFAULT 0
         );
         CREATE TABLE IF NOT EXISTS blobs (
             id INTEGER PRIMARY KEY,
             src_table TEXT NOT NULL,
             src_pk INTEGER NOT NULL,
             src_field TEXT NOT NULL,
             data BLOB,
             when_modified TEXT,
             _move_off_device INTEGER NOT NULL DEFAULT 0
         );",
    )?;
    Ok(conn)
}

fn spawn_abort_listener() -> AbortFlag {
    let abort = AbortFlag::new();
    let flag = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Abort requested; letting the current request finish...");
            flag.request_abort();
        }
    });
    abort
}

async fn run_register(data_dir: &Path, db_path: &Path) -> Result<(), CliError> {
    let mut device = load_or_create_device(data_dir)?;
    let config = config_from_env(&device)?;
    let conn = open_database(db_path)?;
    let store = SqliteStore::new(&conn);
    let mut cache = load_cache(data_dir)?;
    let mut api = HttpServerApi::new(config.clone())?;

    tracing::info!(server = %config.server_url, device = %device.id, "registering device");
    let mut orchestrator =
        SyncOrchestrator::new(&mut api, &store, &config, &mut cache, AbortFlag::new());
    let info = orchestrator.register().await?;

    device.record_registration(config.server_url.clone());
    save_device(data_dir, &device)?;
    save_cache(data_dir, &cache)?;

    println!("Registered with {}", config.server_url);
    println!("  Server version: {}", info.server_version);
    println!("  Database:       {}", info.database_title);
    println!("  Upload policy:  {}", info.upload_policy);
    println!("  Finalize policy: {}", info.finalize_policy);
    println!("  Allowed tables: {}", info.allowed_tables.len());
    Ok(())
}

/// Prints transport progress as tables and records go up
struct ConsoleProgress;

impl ProgressListener for ConsoleProgress {
    fn table_started(&mut self, table: &str, records: usize) {
        println!("Uploading {table} ({records} record(s))...");
    }

    fn record_sent(&mut self, table: &str, sent: usize, total: usize) {
        if total > 1 {
            println!("  {table}: {sent}/{total}");
        }
    }
}

async fn run_sync(
    data_dir: &Path,
    db_path: &Path,
    mode: SessionMode,
    force_fetch: bool,
) -> Result<(), CliError> {
    let device = load_or_create_device(data_dir)?;
    let config = config_from_env(&device)?;
    let conn = open_database(db_path)?;
    let store = SqliteStore::new(&conn);
    let mut cache = load_cache(data_dir)?;
    let mut api = HttpServerApi::new(config.clone())?;
    let abort = spawn_abort_listener();
    let mut progress = ConsoleProgress;
    tracing::info!(?mode, force_fetch, db = %db_path.display(), "starting synchronization");

    let mut orchestrator = SyncOrchestrator::new(&mut api, &store, &config, &mut cache, abort)
        .with_progress(&mut progress);
    let result = orchestrator.run(mode, force_fetch).await;
    save_cache(data_dir, &cache)?;

    let report = result?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SyncReport) {
    for warning in &report.warnings {
        println!("Warning: {warning}");
    }
    for patient in &report.demoted_patients {
        println!("Copied instead of moved (finalize policy not met): {patient}");
    }
    if let Some(upload) = &report.upload {
        println!(
            "Uploaded {} record(s) across {} table(s) ({:?}).",
            upload.records_sent,
            upload.tables_sent.len(),
            upload.mode
        );
    }
    if let Some(cleanup) = &report.cleanup {
        if cleanup.task_rows_deleted > 0 || cleanup.patients_deleted > 0 {
            println!(
                "Cleaned up locally: {} task row(s), {} patient(s) removed, {} kept as shells, {} blob(s) pruned.",
                cleanup.task_rows_deleted,
                cleanup.patients_deleted,
                cleanup.patients_reduced_to_shell,
                cleanup.blobs_pruned
            );
        }
    }
    println!("Sync complete.");
}

fn run_status(data_dir: &Path, db_path: &Path) -> Result<(), CliError> {
    let device = load_or_create_device(data_dir)?;
    println!("Device: {} ({})", device.friendly_name, device.id);
    if device.registrations.is_empty() {
        println!("  Not registered with any server.");
    }
    for registration in &device.registrations {
        println!(
            "  Registered with {} at {}",
            registration.server, registration.registered_at
        );
    }

    let cache = load_cache(data_dir)?;
    match cache.get() {
        None => println!("Server info: none cached."),
        Some(info) => {
            println!("Server info (cached):");
            println!("  Version:         {}", info.server_version);
            println!("  Database:        {}", info.database_title);
            println!("  Upload policy:   {}", info.upload_policy);
            println!("  Finalize policy: {}", info.finalize_policy);
            println!("  Allowed tables:  {}", info.allowed_tables.len());
        }
    }

    let conn = open_database(db_path)?;
    let store = SqliteStore::new(&conn);
    let mut pending = 0;
    for table in store.client_tables()? {
        let rows = store.row_count(&table)?;
        if rows > 0 {
            println!("  {table}: {rows} row(s) pending");
            pending += rows;
        }
    }
    if pending == 0 {
        println!("No pending data.");
    }
    Ok(())
}

async fn run_fetch_info(data_dir: &Path, db_path: &Path) -> Result<(), CliError> {
    let device = load_or_create_device(data_dir)?;
    let config = config_from_env(&device)?;
    let conn = open_database(db_path)?;
    let store = SqliteStore::new(&conn);
    let mut cache = load_cache(data_dir)?;
    let mut api = HttpServerApi::new(config.clone())?;

    let mut orchestrator =
        SyncOrchestrator::new(&mut api, &store, &config, &mut cache, AbortFlag::new());
    let info = orchestrator.fetch_server_info().await?;
    let schedules = orchestrator.fetch_task_schedules().await?;
    save_cache(data_dir, &cache)?;

    println!("Server version:  {}", info.server_version);
    println!("Database:        {}", info.database_title);
    println!("Upload policy:   {}", info.upload_policy);
    println!("Finalize policy: {}", info.finalize_policy);
    println!("ID number types:");
    for description in info.id_descriptions.values() {
        println!(
            "  {}: {} ({})",
            description.which_idnum, description.description, description.short_description
        );
    }
    println!("Allowed tables ({}):", info.allowed_tables.len());
    for (table, min_version) in &info.allowed_tables {
        println!("  {table} (client >= {min_version})");
    }
    println!("Task schedules: {}", schedules.len());
    Ok(())
}
