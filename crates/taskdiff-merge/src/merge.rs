//! Task-vector run orchestration.
//!
//! This module provides the high-level API: resolve the three models, compute
//! the task vector, apply it to the target and save the result.

use std::path::{Path, PathBuf};

use taskdiff_core::{Device, SecretString};
use tracing::{info, warn};

use crate::{
    copy_tokenizer, load_checkpoint_from, open_device, save_checkpoint, ApplyObserver,
    Checkpoint, DiffConfig, MergeError, ModelSource, Result, TaskVector,
};

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    /// Directory the merged model was written to.
    pub output_path: PathBuf,
    /// Number of target tensors the task vector was added to.
    pub tensors_applied: usize,
    /// Safetensors files written.
    pub weight_files: Vec<PathBuf>,
    /// Tokenizer files copied from the source model.
    pub tokenizer_files: Vec<PathBuf>,
}

impl ApplyReport {
    /// Whether tokenizer assets made it into the output.
    pub fn tokenizer_copied(&self) -> bool {
        !self.tokenizer_files.is_empty()
    }
}

/// Main entry point: `target += alpha * (source - base)`, saved to the output path.
///
/// All three identifiers are resolved before any tensor is realized. The full
/// task vector is computed before the target is touched, and source and base
/// are released before the target is loaded. Tokenizer copying is the only
/// step whose failure is logged instead of returned.
pub fn run_apply_diff(
    config: &DiffConfig,
    observer: &mut dyn ApplyObserver,
) -> Result<ApplyReport> {
    config.validate()?;
    info!(
        "Applying task vector: target += {} * (source - base) on {}",
        config.alpha, config.device
    );

    let device = open_device(config.device)?;
    let token = config.resolved_token();
    let token = token.as_ref();

    let source = ModelSource::parse(&config.source);
    let base = ModelSource::parse(&config.base);
    let target = ModelSource::parse(&config.target);

    let source_path = source.resolve(token)?;
    let base_path = base.resolve(token)?;
    let target_path = target.resolve(token)?;

    let task_vector = {
        let source_ckpt = load_role("Source", &source_path, &device)?;
        let base_ckpt = load_role("Base", &base_path, &device)?;
        TaskVector::between(&source_ckpt.params, &base_ckpt.params)?
    };
    info!("Computed task vector over {} tensors", task_vector.len());

    let mut target_ckpt = load_role("Target", &target_path, &device)?;
    let params = std::mem::take(&mut target_ckpt.params);
    target_ckpt.params = task_vector.apply(params, config.alpha, observer)?;
    drop(task_vector);

    info!("Saving model to {:?}", config.output_path);
    let written = save_checkpoint(&target_ckpt, &config.output_path, config.max_shard_size)?;

    let tokenizer_files = if config.copy_tokenizer {
        match copy_tokenizer(&source, &config.output_path, token) {
            Ok(files) => {
                info!("Tokenizer saved ({} files).", files.len());
                files
            }
            Err(e) => {
                warn!("Could not save tokenizer: {}", e);
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    Ok(ApplyReport {
        output_path: config.output_path.clone(),
        tensors_applied: target_ckpt.params.len(),
        weight_files: written.files,
        tokenizer_files,
    })
}

fn load_role(role: &str, path: &Path, device: &candle_core::Device) -> Result<Checkpoint> {
    info!("Loading {} model from {:?}", role.to_lowercase(), path);
    let checkpoint = load_checkpoint_from(path, device)?;
    info!("{} model keys: {:?} ...", role, checkpoint.first_keys(5));
    Ok(checkpoint)
}

/// Builder for creating run configurations programmatically.
#[derive(Debug, Default)]
pub struct DiffBuilder {
    source: Option<String>,
    base: Option<String>,
    target: Option<String>,
    output_path: Option<PathBuf>,
    alpha: Option<f64>,
    device: Option<Device>,
    hf_token: Option<SecretString>,
    max_shard_size: Option<u64>,
    copy_tokenizer: Option<bool>,
}

impl DiffBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration, e.g. one loaded from YAML.
    pub fn from_config(config: DiffConfig) -> Self {
        Self {
            source: Some(config.source),
            base: Some(config.base),
            target: Some(config.target),
            output_path: Some(config.output_path),
            alpha: Some(config.alpha),
            device: Some(config.device),
            hf_token: config.hf_token,
            max_shard_size: Some(config.max_shard_size),
            copy_tokenizer: Some(config.copy_tokenizer),
        }
    }

    /// Set the fine-tuned model the task vector is taken from.
    pub fn source(mut self, model: impl Into<String>) -> Self {
        self.source = Some(model.into());
        self
    }

    /// Set the base model.
    pub fn base(mut self, model: impl Into<String>) -> Self {
        self.base = Some(model.into());
        self
    }

    /// Set the model receiving the task vector.
    pub fn target(mut self, model: impl Into<String>) -> Self {
        self.target = Some(model.into());
        self
    }

    /// Set the output path.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    /// Set the task vector scale factor.
    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = Some(alpha);
        self
    }

    /// Set the compute device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Set the Hub token.
    pub fn hf_token(mut self, token: impl Into<SecretString>) -> Self {
        self.hf_token = Some(token.into());
        self
    }

    /// Set the maximum shard size in bytes.
    pub fn max_shard_size(mut self, bytes: u64) -> Self {
        self.max_shard_size = Some(bytes);
        self
    }

    /// Enable or disable tokenizer copying.
    pub fn copy_tokenizer(mut self, enabled: bool) -> Self {
        self.copy_tokenizer = Some(enabled);
        self
    }

    /// Build the run configuration.
    pub fn build(self) -> Result<DiffConfig> {
        let required = |value: Option<String>, role: &str| {
            value.ok_or_else(|| MergeError::InvalidConfig(format!("{} model is required", role)))
        };

        let mut config = DiffConfig::new(
            required(self.source, "source")?,
            required(self.base, "base")?,
            required(self.target, "target")?,
            self.output_path.ok_or_else(|| {
                MergeError::InvalidConfig("output path is required".to_string())
            })?,
        );

        if let Some(alpha) = self.alpha {
            config.alpha = alpha;
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(bytes) = self.max_shard_size {
            config.max_shard_size = bytes;
        }
        if let Some(enabled) = self.copy_tokenizer {
            config.copy_tokenizer = enabled;
        }
        config.hf_token = self.hf_token;

        config.validate()?;
        Ok(config)
    }

    /// Build and run.
    pub fn run(self, observer: &mut dyn ApplyObserver) -> Result<ApplyReport> {
        let config = self.build()?;
        run_apply_diff(&config, observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = DiffBuilder::new()
            .source("ft")
            .base("base")
            .target("other")
            .output("out")
            .build()
            .unwrap();

        assert_eq!(config.alpha, 1.0);
        assert_eq!(config.device, Device::Cpu);
        assert!(config.copy_tokenizer);
    }

    #[test]
    fn test_builder_overrides() {
        let config = DiffBuilder::new()
            .source("ft")
            .base("base")
            .target("other")
            .output("out")
            .alpha(-0.5)
            .device(Device::Cuda(1))
            .max_shard_size(1024)
            .copy_tokenizer(false)
            .hf_token("hf_abc")
            .build()
            .unwrap();

        assert_eq!(config.alpha, -0.5);
        assert_eq!(config.device, Device::Cuda(1));
        assert_eq!(config.max_shard_size, 1024);
        assert!(!config.copy_tokenizer);
        assert!(config.hf_token.is_some());
    }

    #[test]
    fn test_builder_requires_models() {
        let err = DiffBuilder::new()
            .source("ft")
            .target("other")
            .output("out")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("base"));
    }

    #[test]
    fn test_builder_requires_output() {
        let result = DiffBuilder::new()
            .source("ft")
            .base("base")
            .target("other")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_config_roundtrip() {
        let original = DiffConfig::new("a", "b", "c", "d");
        let rebuilt = DiffBuilder::from_config(original.clone())
            .alpha(3.0)
            .build()
            .unwrap();
        assert_eq!(rebuilt.source, original.source);
        assert_eq!(rebuilt.output_path, original.output_path);
        assert_eq!(rebuilt.alpha, 3.0);
    }

    #[test]
    fn test_run_rejects_invalid_config_before_io() {
        let mut config = DiffConfig::new("a", "b", "c", "d");
        config.alpha = f64::INFINITY;
        let err = run_apply_diff(&config, &mut ()).unwrap_err();
        assert!(matches!(err, MergeError::InvalidConfig(_)));
    }
}
