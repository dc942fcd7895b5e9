//! Syncflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Syncflow workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`SyncflowError`] and the [`Result`] alias
//! - **Checksums**: stable content hashing used for idempotent upserts
//! - **Logging**: `tracing` subscriber bootstrap shared by every binary
//! - **Types**: records, breadcrumbs and identity keys that flow through a sync
//!
//! # Example
//!
//! ```no_run
//! use syncflow_common::types::{Record, RecordKey};
//!
//! let record = Record::new(RecordKey::new("task-1"), "task", serde_json::json!({"title": "Ship it"}));
//! let hash = record.content_hash().unwrap();
//! println!("{} -> {}", record.key, hash);
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SyncflowError};
