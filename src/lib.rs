//! Backup and restore orchestration for Cassandra clusters.
//!
//! A request is loaded, validated into a [`request::Validated`] value, and then
//! either run on the local node ([`backup::run_backup_flow`],
//! [`restore::run_restore_flow`]) or, for global requests, fanned out across the
//! cluster by the [`coordinator::Coordinator`].

pub mod backup;
pub mod cassandra;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod manifest;
pub mod request;
pub mod restore;
pub mod retry;
pub mod storage;
pub mod transfer;

pub use errors::{BackupError, Result};
