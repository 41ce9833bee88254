//! Workflow engine core: definition parsing, graph compilation, routing and
//! durable checkpointing.
//!
//! - `definition` -- YAML parsing, validation, filesystem load/save
//! - `graph` -- compiled graph with static and conditional transitions
//! - `context` -- context merging, schema checks and input templates
//! - `step` -- step executor port and registry
//! - `router` -- decision router for conditional edges
//! - `retry` -- retry controller and error monitor
//! - `checkpoint` -- checkpoint writer with degraded-mode handling
//! - `executor` -- the graph engine driving workflows node by node

pub mod checkpoint;
pub mod context;
pub mod definition;
pub mod executor;
pub mod graph;
pub mod retry;
pub mod router;
pub mod step;
