//! Configuration for a task-vector run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use taskdiff_core::{Device, SecretString};

use crate::{MergeError, Result};

/// Default shard limit for written checkpoints (5 GiB).
pub const DEFAULT_MAX_SHARD_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Complete run configuration, typically loaded from YAML.
///
/// The run computes `target += alpha * (source - base)` and saves the result
/// to `output_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Fine-tuned model the task vector is taken from (path or Hub id).
    pub source: String,

    /// Base model `source` was fine-tuned from (path or Hub id).
    pub base: String,

    /// Model receiving the scaled task vector (path or Hub id).
    pub target: String,

    /// Output directory for the merged model.
    pub output_path: PathBuf,

    /// Scale factor applied to the task vector.
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Compute device for all three loads.
    #[serde(default)]
    pub device: Device,

    /// HuggingFace token for private repositories. Falls back to `HF_TOKEN`.
    #[serde(default, skip_serializing)]
    pub hf_token: Option<SecretString>,

    /// Maximum size in bytes of a single written safetensors file.
    #[serde(default = "default_max_shard_size")]
    pub max_shard_size: u64,

    /// Copy tokenizer assets from `source` into the output directory.
    #[serde(default = "default_true")]
    pub copy_tokenizer: bool,
}

fn default_alpha() -> f64 {
    1.0
}

fn default_max_shard_size() -> u64 {
    DEFAULT_MAX_SHARD_SIZE
}

fn default_true() -> bool {
    true
}

impl DiffConfig {
    /// Create a configuration with default alpha, device and shard size.
    pub fn new(
        source: impl Into<String>,
        base: impl Into<String>,
        target: impl Into<String>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: source.into(),
            base: base.into(),
            target: target.into(),
            output_path: output_path.into(),
            alpha: default_alpha(),
            device: Device::default(),
            hf_token: None,
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
            copy_tokenizer: true,
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Token used for Hub downloads: the configured one, else `HF_TOKEN`.
    pub fn resolved_token(&self) -> Option<SecretString> {
        self.hf_token
            .clone()
            .filter(|token| !token.is_empty())
            .or_else(|| SecretString::from_env("HF_TOKEN"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        for (role, id) in [
            ("source", &self.source),
            ("base", &self.base),
            ("target", &self.target),
        ] {
            if id.trim().is_empty() {
                return Err(MergeError::InvalidConfig(format!(
                    "{} model identifier is empty",
                    role
                )));
            }
        }

        if self.output_path.as_os_str().is_empty() {
            return Err(MergeError::InvalidConfig(
                "output path is empty".to_string(),
            ));
        }

        if !self.alpha.is_finite() {
            return Err(MergeError::InvalidConfig(format!(
                "alpha must be finite, got {}",
                self.alpha
            )));
        }

        if self.max_shard_size == 0 {
            return Err(MergeError::InvalidConfig(
                "max_shard_size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
source: Qwen/Qwen3-14B
base: Qwen/Qwen3-14B-Base
target: ./models/qwen3-14b-test
output_path: ./output_model
"#;

        let config = DiffConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.source, "Qwen/Qwen3-14B");
        assert_eq!(config.alpha, 1.0);
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.max_shard_size, DEFAULT_MAX_SHARD_SIZE);
        assert!(config.copy_tokenizer);
        assert!(config.hf_token.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
source: ft
base: base
target: other
output_path: out
alpha: 0.5
device: mps
hf_token: hf_xyz
max_shard_size: 1048576
copy_tokenizer: false
"#;

        let config = DiffConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.alpha, 0.5);
        assert_eq!(config.device, Device::Metal(0));
        assert_eq!(config.max_shard_size, 1 << 20);
        assert!(!config.copy_tokenizer);
        assert_eq!(config.resolved_token().unwrap().expose_secret(), "hf_xyz");
    }

    #[test]
    fn test_invalid_device_rejected() {
        let yaml = "source: a\nbase: b\ntarget: c\noutput_path: d\ndevice: tpu\n";
        assert!(DiffConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_identifier() {
        let config = DiffConfig::new("a", " ", "c", "out");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("base"));
    }

    #[test]
    fn test_validate_rejects_non_finite_alpha() {
        let mut config = DiffConfig::new("a", "b", "c", "out");
        config.alpha = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_not_serialized() {
        let mut config = DiffConfig::new("a", "b", "c", "out");
        config.hf_token = Some(SecretString::new("hf_secret"));
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("hf_secret"));
    }

    #[test]
    fn test_default_shard_size_is_five_gib() {
        let bytes: u64 = DEFAULT_MAX_SHARD_SIZE;
        assert_eq!(bytes, 5 << 30);
    }
}
