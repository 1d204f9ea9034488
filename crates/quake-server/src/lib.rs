//! Quake Server Library
//!
//! Partitioned batch ingestion of USGS earthquake CSV files.
//!
//! # Overview
//!
//! A run request names a data directory. The manager plans one partition per
//! matching file and publishes one work assignment per partition. Workers
//! claim assignments from the shared queue, run each file through the row
//! pipeline in transactional chunks and reply with counts or a diagnostic.
//! The manager correlates replies by partition id and records the terminal
//! status once every partition has reported.
//!
//! - **broker**: durable queues with at-least-once delivery
//! - **ingest**: planner, channel, worker, manager, row pipeline, job tracker
//! - **features**: HTTP submission and status API
//! - **config**, **error**, **middleware**: environment configuration, HTTP
//!   errors, CORS and request tracing
//!
//! One binary runs any role: `api`, `manager`, `worker` or `standalone`.

pub mod broker;
pub mod config;
pub mod error;
pub mod features;
pub mod ingest;
pub mod middleware;

pub use config::Config;
pub use error::AppError;
