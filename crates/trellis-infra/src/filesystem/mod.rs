//! Filesystem adapters.

pub mod checkpoint;

pub use checkpoint::JsonlCheckpointStore;
