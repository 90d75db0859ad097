//! # Permission Sync Library
//!
//! Keeps the repository permission tables in step with what each code host
//! reports: the sync engine, the durable job queue with its workers and
//! resetters, and the supporting configuration, storage and telemetry.

pub mod authz;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod perms_syncer;
pub mod repositories;
pub mod resetter;
pub mod service;
pub mod telemetry;
pub mod worker;
pub use migration;
