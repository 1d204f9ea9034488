//! Jobs feature
//!
//! Submits run requests to the job-requests queue and answers status and
//! failure queries from the job tracker. Nothing here waits for a job.

pub mod commands;
pub mod queries;
pub mod routes;

pub use routes::jobs_routes;
