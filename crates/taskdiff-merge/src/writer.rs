//! Saving merged checkpoints.
//!
//! Tensors are written as `F32` safetensors. When the checkpoint exceeds the
//! shard limit it is split into `model-0000i-of-0000n.safetensors` files with a
//! `model.safetensors.index.json` weight map, the layout `from_pretrained`
//! loaders expect.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use safetensors::tensor::TensorView;
use tracing::{debug, info};

use crate::{Checkpoint, MergeError, ParameterMapping, Result, DEFAULT_MAX_SHARD_SIZE};

/// Name of a single-file checkpoint.
pub const SINGLE_FILE_NAME: &str = "model.safetensors";

/// Name of the shard index of a sharded checkpoint.
pub const INDEX_FILE_NAME: &str = "model.safetensors.index.json";

/// Writer for saving merged tensors.
pub struct TensorWriter {
    /// Output directory.
    output_path: PathBuf,
    /// Accumulated tensors for current shard.
    current_shard: BTreeMap<String, (Vec<usize>, Vec<f32>)>,
    /// Current shard size in bytes.
    current_size: u64,
    /// Maximum shard size (default 5GB).
    max_shard_size: u64,
    /// Paths of shards written so far, in order.
    shards: Vec<PathBuf>,
    /// Tensor name to shard index.
    weight_map: BTreeMap<String, usize>,
    /// Bytes of tensor data written.
    total_size: u64,
}

/// Files produced by [`TensorWriter::finalize`].
#[derive(Debug, Clone)]
pub struct WrittenTensors {
    /// Final safetensors files, in shard order.
    pub files: Vec<PathBuf>,
    /// Index file, present only for sharded output.
    pub index: Option<PathBuf>,
    /// Bytes of tensor data written.
    pub total_size: u64,
}

impl TensorWriter {
    /// Create a new tensor writer.
    pub fn new(output_path: impl AsRef<Path>) -> Result<Self> {
        let output_path = output_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_path)?;

        Ok(Self {
            output_path,
            current_shard: BTreeMap::new(),
            current_size: 0,
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
            shards: Vec::new(),
            weight_map: BTreeMap::new(),
            total_size: 0,
        })
    }

    /// Set maximum shard size.
    pub fn with_max_shard_size(mut self, size: u64) -> Self {
        self.max_shard_size = size;
        self
    }

    /// Write a tensor, copying it to host memory as `f32`.
    pub fn write_tensor(&mut self, name: &str, tensor: &Tensor) -> Result<()> {
        let host = tensor
            .to_device(&candle_core::Device::Cpu)
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|source| MergeError::Tensor {
                name: name.to_string(),
                source,
            })?;
        let shape = tensor.dims().to_vec();
        let size = (host.len() * std::mem::size_of::<f32>()) as u64;

        // Check if we need to flush current shard
        if self.current_size + size > self.max_shard_size && !self.current_shard.is_empty() {
            self.flush_shard()?;
        }

        self.current_shard.insert(name.to_string(), (shape, host));
        self.current_size += size;

        Ok(())
    }

    /// Write every tensor of a mapping in iteration order.
    pub fn write_all(&mut self, params: &ParameterMapping) -> Result<()> {
        for (name, tensor) in params {
            self.write_tensor(name, tensor)?;
        }
        Ok(())
    }

    /// Flush current shard to disk under a provisional name.
    fn flush_shard(&mut self) -> Result<()> {
        if self.current_shard.is_empty() {
            return Ok(());
        }

        let shard_idx = self.shards.len();
        let shard_path = self
            .output_path
            .join(format!("model-{:05}.safetensors.partial", shard_idx + 1));
        info!("Writing shard: {:?}", shard_path);

        let tensors = self
            .current_shard
            .iter()
            .map(|(name, (shape, data))| {
                TensorView::new(
                    safetensors::Dtype::F32,
                    shape.clone(),
                    bytemuck::cast_slice(data.as_slice()),
                )
                .map(|view| (name.as_str(), view))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
        safetensors::serialize_to_file(tensors, &metadata, &shard_path)?;

        for name in self.current_shard.keys() {
            self.weight_map.insert(name.clone(), shard_idx);
        }
        self.total_size += self.current_size;
        self.shards.push(shard_path);
        self.current_shard.clear();
        self.current_size = 0;

        Ok(())
    }

    /// Finalize: flush remaining tensors, name the shards and write the index.
    pub fn finalize(mut self) -> Result<WrittenTensors> {
        self.flush_shard()?;

        if self.shards.is_empty() {
            return Err(MergeError::InvalidConfig(
                "no tensors were written".to_string(),
            ));
        }

        remove_stale_weights(&self.output_path)?;

        let count = self.shards.len();
        let final_names: Vec<String> = if count == 1 {
            vec![SINGLE_FILE_NAME.to_string()]
        } else {
            (1..=count)
                .map(|i| format!("model-{:05}-of-{:05}.safetensors", i, count))
                .collect()
        };

        let mut files = Vec::with_capacity(count);
        for (partial, name) in self.shards.iter().zip(&final_names) {
            let path = self.output_path.join(name);
            std::fs::rename(partial, &path)?;
            files.push(path);
        }

        let index = if count > 1 {
            let weight_map: BTreeMap<&str, &str> = self
                .weight_map
                .iter()
                .map(|(name, idx)| (name.as_str(), final_names[*idx].as_str()))
                .collect();
            let index = serde_json::json!({
                "metadata": { "total_size": self.total_size },
                "weight_map": weight_map,
            });

            let path = self.output_path.join(INDEX_FILE_NAME);
            std::fs::write(&path, serde_json::to_string_pretty(&index)?)?;
            Some(path)
        } else {
            None
        };

        Ok(WrittenTensors {
            files,
            index,
            total_size: self.total_size,
        })
    }
}

/// Whether `name` is a final shard name like `model-00001-of-00003.safetensors`.
fn is_shard_name(name: &str) -> bool {
    let Some(stem) = name
        .strip_prefix("model-")
        .and_then(|rest| rest.strip_suffix(".safetensors"))
    else {
        return false;
    };
    match stem.split_once("-of-") {
        Some((index, count)) => {
            !index.is_empty()
                && !count.is_empty()
                && index.bytes().all(|b| b.is_ascii_digit())
                && count.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Delete weight files left in `dir` by an earlier save.
fn remove_stale_weights(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == SINGLE_FILE_NAME || name == INDEX_FILE_NAME || is_shard_name(name) {
            debug!("Removing stale weight file {:?}", path);
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Write the architecture metadata a checkpoint carries.
///
/// `config.json` gets `torch_dtype` set to `float32`, matching the written
/// tensors. `generation_config.json` is copied verbatim.
pub fn write_model_config(checkpoint: &Checkpoint, output_path: &Path) -> Result<()> {
    if let Some(config) = &checkpoint.config {
        let mut config = config.clone();
        if let Some(obj) = config.as_object_mut() {
            obj.insert("torch_dtype".to_string(), "float32".into());
        }
        std::fs::write(
            output_path.join("config.json"),
            serde_json::to_string_pretty(&config)?,
        )?;
    }

    if let Some(generation_config) = &checkpoint.generation_config {
        std::fs::write(
            output_path.join("generation_config.json"),
            serde_json::to_string_pretty(generation_config)?,
        )?;
    }

    Ok(())
}

/// Save a checkpoint's parameters and metadata to `output_path`.
pub fn save_checkpoint(
    checkpoint: &Checkpoint,
    output_path: &Path,
    max_shard_size: u64,
) -> Result<WrittenTensors> {
    let mut writer = TensorWriter::new(output_path)?.with_max_shard_size(max_shard_size);
    writer.write_all(&checkpoint.params)?;
    let written = writer.finalize()?;

    write_model_config(checkpoint, output_path)?;

    info!(
        "Saved {} tensors in {} file(s) to {:?}",
        checkpoint.params.len(),
        written.files.len(),
        output_path
    );

    Ok(written)
}
