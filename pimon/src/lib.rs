//! Library for the pimon client: telemetry polling and a remote shell session
//! against a single headless host.

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod sanitize;
pub mod session;
pub mod source;
pub mod targets;
pub mod transport;
pub mod types;
