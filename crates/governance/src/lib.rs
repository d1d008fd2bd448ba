//! Observability for the agent sandbox.
//!
//! This crate provides:
//! - Log and trace subscriber setup (stdout, JSON, OTLP)
//! - Prometheus metrics recorder and helpers
//! - Audit event sinks (tracing, hash-chained JSONL log)

pub mod audit;
pub mod metrics;
pub mod tracing_layer;

pub use audit::{AuditEntry, AuditLog, AuditLogEmitter, CompositeEventEmitter, TracingEventEmitter};
pub use crate::metrics::{set_active_containers, setup_metrics_recorder, track_request};
pub use tracing_layer::configure_tracing;
