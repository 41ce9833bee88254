//! Infrastructure layer for Trellis.
//!
//! Contains implementations of the port traits defined in `trellis-core`:
//! a JSONL checkpoint store on the filesystem, SQLite session storage, and
//! the engine configuration loader.

pub mod config;
pub mod filesystem;
pub mod sqlite;
