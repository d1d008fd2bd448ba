//! Core type definitions for the agent sandbox.

pub mod exec;
pub mod session;
pub mod tool;

pub use exec::*;
pub use session::*;
pub use tool::*;
