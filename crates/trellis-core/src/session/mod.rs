//! Session management: grouping workflows and conversation history.

pub mod manager;
pub mod memory;

pub use manager::{SessionError, SessionManager, StartedWorkflow};
pub use memory::InMemorySessionRepository;
