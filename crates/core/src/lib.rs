#![deny(unused)]
//! Core types, traits, and error definitions for the agent sandbox.
//!
//! This crate provides the building blocks shared by the workspace layer,
//! the container execution plane, and the HTTP surface.

pub mod config;
pub mod error;
pub mod events;
pub mod mocks;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use events::*;
pub use traits::*;
pub use types::*;
