//! Observability setup for Trellis: structured logging and optional
//! OpenTelemetry trace export.

pub mod tracing_setup;
