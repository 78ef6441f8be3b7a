// src/core/mod.rs

//! The central module containing the core logic and data structures of the
//! monitor.

pub mod errors;
pub mod monitor;

pub use errors::StewardError;
