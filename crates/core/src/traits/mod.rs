//! Core traits for the agent sandbox.
//!
//! - `skills`: tool interface and tool registry
//! - `events`: audit event emission

pub mod events;
pub mod skills;

pub use events::*;
pub use skills::*;
