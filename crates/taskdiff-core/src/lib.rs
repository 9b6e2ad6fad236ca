//! Core types shared across the taskdiff crates.
//!
//! This crate provides:
//!
//! - The compute [`Device`] a checkpoint is realized on
//! - Error handling infrastructure
//! - Secure handling of Hub tokens ([`SecretString`])

#![warn(missing_docs)]

mod error;
mod secrets;
mod types;

pub use error::*;
pub use secrets::SecretString;
pub use types::*;
