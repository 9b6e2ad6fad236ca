//! HuggingFace Hub integration for taskdiff.
//!
//! This crate provides blocking downloads of:
//! - Model weights (single-file or sharded safetensors) and their config
//! - Tokenizer assets, fetched best-effort

#![warn(missing_docs)]

mod download;

pub use download::*;
