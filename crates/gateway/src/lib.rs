//! HTTP surface for the agent sandbox.
//!
//! Exposes tool invocation, raw command execution and session teardown
//! over JSON, plus health and Prometheus endpoints.

pub mod server;

pub use server::{status_for, ApiError, AppState, GatewayConfig, GatewayServer};
