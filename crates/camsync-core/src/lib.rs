//! camsync-core - Core library for camsync
//!
//! This crate contains the device-to-server synchronization engine for
//! clinical assessment data: ID policy evaluation, server capability
//! caching, table cataloging, per-patient move resolution, the wire
//! protocol, upload transport, the session state machine, and post-upload
//! cleanup.

pub mod cache;
pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod policy;
pub mod protocol;
pub mod resolver;
pub mod store;
pub mod transport;

pub use error::{Result, SyncError};
pub use models::{AbortFlag, Device, DeviceId, Patient, ServerInfo, SessionMode, Version};
pub use orchestrator::{SyncOrchestrator, SyncReport, SyncState};
