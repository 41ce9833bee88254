//! Shared domain types for Trellis.
//!
//! This crate contains the core domain types used across the Trellis engine:
//! workflow definitions, workflow state and checkpoints, decision and error
//! records, sessions, events, engine configuration and storage errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod session;
pub mod workflow;
