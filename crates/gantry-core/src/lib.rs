//! Gantry Core
//!
//! Core domain types, port traits, and error handling for Gantry.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod concurrency;
pub mod error;
pub mod ids;
pub mod job;
pub mod ports;
pub mod preexec;
pub mod run;
pub mod status;
pub mod task;
pub mod trust;
pub mod workflow;

pub use error::{Error, Result};
pub use ids::*;
pub use status::Status;
