//! API client module
//!
//! HTTP client for the quake submission and status API.

pub mod client;
pub mod endpoints;

pub use client::ApiClient;
