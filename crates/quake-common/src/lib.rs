//! Quake Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging and error handling for the earthquake ingestion
//! workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`QuakeError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup shared by every binary
//! - **Messages**: the JSON contracts exchanged between the submission API,
//!   the manager and the workers, plus the HTTP response bodies the CLI reads
//!
//! # Example
//!
//! ```no_run
//! use quake_common::messages::{JobRequest, EARTHQUAKE_INGESTION_JOB};
//!
//! let request = JobRequest::earthquake_ingestion("nightly-2024-01-18", "2024/01");
//! assert_eq!(request.job_type, EARTHQUAKE_INGESTION_JOB);
//! ```

pub mod error;
pub mod logging;
pub mod messages;

// Re-export commonly used types
pub use error::{QuakeError, Result};
