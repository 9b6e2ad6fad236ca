//! Task vectors: the difference between a fine-tuned model and its base.
//!
//! As described in "Editing Models with Task Arithmetic" (Ilharco et al., 2022).
//! A task vector captures what changed during fine-tuning and can be added,
//! scaled, to a different model that shares the same architecture:
//!
//! Formula: `W_target += alpha * (W_source - W_base)`
//!
//! The operation is two-phase. [`TaskVector::between`] computes the full diff
//! over every source key before [`TaskVector::apply`] touches any target
//! tensor, so a key missing from the base model is always reported before the
//! target is modified.

use candle_core::Tensor;
use tracing::debug;

use crate::{MergeError, ParameterMapping, Result};

/// Receives progress events while a task vector is applied.
///
/// All methods default to no-ops.
pub trait ApplyObserver {
    /// Called once before the first target key, with the number of keys.
    fn on_start(&mut self, _total: usize) {}

    /// Called after each target key has been updated.
    fn on_tensor(&mut self, _name: &str) {}

    /// Called once after every target key has been updated.
    fn on_finish(&mut self) {}
}

impl ApplyObserver for () {}

/// Logs progress through `tracing`: every key at `debug`, every 100th at `info`.
#[derive(Debug, Default)]
pub struct TracingObserver {
    total: usize,
    done: usize,
}

impl ApplyObserver for TracingObserver {
    fn on_start(&mut self, total: usize) {
        self.total = total;
        self.done = 0;
    }

    fn on_tensor(&mut self, name: &str) {
        self.done += 1;
        debug!("Applied diff {}/{}: {}", self.done, self.total, name);
        if self.done % 100 == 1 || self.done == self.total {
            tracing::info!("Applying diff {}/{}: {}", self.done, self.total, name);
        }
    }
}

/// Per-parameter difference `source - base`, keyed like `source`.
#[derive(Debug, Clone)]
pub struct TaskVector {
    diffs: ParameterMapping,
}

impl TaskVector {
    /// Compute `source[k] - base[k]` for every key of `source`.
    ///
    /// Keys of `base` that `source` lacks are ignored. Fails on the first
    /// source key absent from `base`, or whose shape differs from `base`'s.
    pub fn between(source: &ParameterMapping, base: &ParameterMapping) -> Result<Self> {
        let mut diffs = ParameterMapping::new();

        for (name, source_tensor) in source {
            let base_tensor = base.get(name).ok_or_else(|| MergeError::MissingKey {
                key: name.clone(),
                mapping: "base",
            })?;

            check_shape(name, source_tensor, base_tensor)?;

            let diff = source_tensor
                .sub(base_tensor)
                .map_err(|source| MergeError::Tensor {
                    name: name.clone(),
                    source,
                })?;
            diffs.insert(name.clone(), diff);
        }

        debug!("Computed task vector over {} tensors", diffs.len());

        Ok(Self { diffs })
    }

    /// Diff for a key.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.diffs.get(name)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    /// Whether the task vector has no keys.
    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    /// Keys in iteration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.diffs.keys().map(String::as_str)
    }

    /// Add `alpha * diff[k]` to every tensor of `target` and return it.
    ///
    /// Every key of `target` must have a diff of identical shape. The first
    /// missing key or shape mismatch aborts the whole operation; keys are
    /// visited in `target`'s order. Diff keys that `target` lacks are never
    /// applied.
    pub fn apply(
        &self,
        mut target: ParameterMapping,
        alpha: f64,
        observer: &mut dyn ApplyObserver,
    ) -> Result<ParameterMapping> {
        observer.on_start(target.len());

        for (name, tensor) in target.iter_mut() {
            let diff = self.diffs.get(name).ok_or_else(|| MergeError::MissingKey {
                key: name.clone(),
                mapping: "diff",
            })?;

            check_shape(name, tensor, diff)?;

            let updated = diff
                .affine(alpha, 0.0)
                .and_then(|scaled| tensor.add(&scaled))
                .map_err(|source| MergeError::Tensor {
                    name: name.clone(),
                    source,
                })?;
            *tensor = updated;

            observer.on_tensor(name);
        }

        let unused = self
            .diffs
            .keys()
            .filter(|name| !target.contains_key(*name))
            .count();
        if unused > 0 {
            debug!("{} diff tensors have no counterpart in target", unused);
        }

        observer.on_finish();

        Ok(target)
    }
}

fn check_shape(name: &str, expected: &Tensor, actual: &Tensor) -> Result<()> {
    if expected.dims() != actual.dims() {
        return Err(MergeError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.dims().to_vec(),
            actual: actual.dims().to_vec(),
        });
    }
    Ok(())
}
