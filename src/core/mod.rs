//! Core infrastructure.
//!
//! - [`config`] - configuration parsing and validation
//! - [`error`] - the crate-wide error type
//! - [`ids`] - keys, node and transaction identifiers
//! - [`runtime`] - two-phase cache construction and command routing
//! - [`telemetry`] - tracing subscriber setup

pub mod config;
pub mod error;
pub mod ids;
pub mod runtime;
pub mod telemetry;
