//! Task-vector arithmetic on language-model checkpoints.
//!
//! Computes the parameter-wise difference between a fine-tuned model and its
//! base, scales it, and adds it to a third model:
//!
//! ```text
//! target[k] += alpha * (source[k] - base[k])
//! ```
//!
//! # Pipeline
//!
//! 1. **Load**: resolve each identifier (local path or Hub repo) and realize
//!    every safetensors tensor as `f32` on the requested device
//! 2. **Diff**: compute the full [`TaskVector`] over the source keys
//! 3. **Apply**: add the scaled diff to every target tensor
//! 4. **Save**: write the target as safetensors with its config, then copy the
//!    source tokenizer best-effort
//!
//! # Example
//!
//! ```ignore
//! use taskdiff_merge::DiffBuilder;
//!
//! let report = DiffBuilder::new()
//!     .source("Qwen/Qwen3-14B")
//!     .base("Qwen/Qwen3-14B-Base")
//!     .target("./models/qwen3-14b-test")
//!     .output("./output_model")
//!     .alpha(1.0)
//!     .run(&mut ())?;
//! ```

#![warn(missing_docs)]

mod config;
mod device;
mod error;
mod loader;
mod merge;
mod task_vector;
mod tokenizer;
mod writer;

pub use config::*;
pub use device::*;
pub use error::*;
pub use loader::*;
pub use merge::*;
pub use task_vector::*;
pub use tokenizer::*;
pub use writer::*;
