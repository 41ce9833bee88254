//! Engine logic and repository trait definitions for Trellis.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements. It depends only on `trellis-types` -- never on
//! `trellis-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod session;
pub mod workflow;
