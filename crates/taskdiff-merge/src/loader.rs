//! Checkpoint resolution and loading.
//!
//! A model identifier is resolved to a local directory (downloading from the
//! Hub when needed), its safetensors files are memory-mapped, and every tensor
//! is realized as `f32` on the requested device.
//!
//! Loading is all-or-nothing: the first unreadable file, unsupported dtype or
//! failed device placement aborts the whole load.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use safetensors::{Dtype, SafeTensors};
use taskdiff_core::SecretString;
use tracing::{debug, info};

use crate::{MergeError, Result};

/// Named tensors of a model, iterated in sorted key order.
pub type ParameterMapping = BTreeMap<String, Tensor>;

// =============================================================================
// Model Sources
// =============================================================================

/// A model identifier, either a local path or a Hub repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Local path to model directory or file.
    Local(PathBuf),
    /// HuggingFace Hub repository ID.
    Hub {
        /// Repository ID (e.g., "Qwen/Qwen3-14B").
        repo_id: String,
        /// Optional revision (branch, tag, or commit).
        revision: Option<String>,
    },
}

impl ModelSource {
    /// Create a model source from a local path.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::Local(path.as_ref().to_path_buf())
    }

    /// Create a model source from a HuggingFace repo ID.
    pub fn from_hub(repo_id: impl Into<String>) -> Self {
        Self::Hub {
            repo_id: repo_id.into(),
            revision: None,
        }
    }

    /// Parse a model source from a string.
    ///
    /// Existing paths and strings starting with `/` or `.` are local. Anything
    /// else is a Hub repo ID, optionally pinned with `@revision`
    /// (`org/model@main`).
    pub fn parse(s: &str) -> Self {
        let path = Path::new(s);
        if path.exists() {
            return Self::Local(path.to_path_buf());
        }

        // "org/repo" must stay a Hub id even though it looks like a relative path
        if s.starts_with('/') || s.starts_with('.') {
            return Self::Local(path.to_path_buf());
        }

        #[cfg(windows)]
        if s.contains('\\') {
            return Self::Local(path.to_path_buf());
        }

        match s.rsplit_once('@') {
            Some((repo_id, revision)) if !repo_id.is_empty() && !revision.is_empty() => {
                Self::Hub {
                    repo_id: repo_id.to_string(),
                    revision: Some(revision.to_string()),
                }
            }
            _ => Self::from_hub(s),
        }
    }

    /// Resolve to a local directory or file holding the checkpoint.
    pub fn resolve(&self, token: Option<&SecretString>) -> Result<PathBuf> {
        match self {
            Self::Local(path) => {
                if !path.exists() {
                    return Err(MergeError::ModelLoad(format!(
                        "model path {:?} does not exist",
                        path
                    )));
                }
                Ok(path.clone())
            }
            Self::Hub { repo_id, revision } => {
                info!("Downloading model from Hub: {}", repo_id);
                taskdiff_hub::download_model(repo_id, revision.as_deref(), token)
                    .map_err(|e| MergeError::ModelLoad(format!("{}: {}", repo_id, e)))
            }
        }
    }

    /// Locate the directory holding this model's tokenizer assets.
    ///
    /// Hub sources fetch whichever of `filenames` exist. Returns `None` when
    /// nothing could be fetched.
    pub fn tokenizer_dir(
        &self,
        token: Option<&SecretString>,
        filenames: &[&str],
    ) -> Result<Option<PathBuf>> {
        match self {
            Self::Local(path) => Ok(Some(model_dir(path))),
            Self::Hub { repo_id, revision } => {
                Ok(taskdiff_hub::download_tokenizer_files(
                    repo_id,
                    revision.as_deref(),
                    token,
                    filenames,
                )?)
            }
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Hub {
                repo_id,
                revision: Some(rev),
            } => write!(f, "{}@{}", repo_id, rev),
            Self::Hub { repo_id, .. } => write!(f, "{}", repo_id),
        }
    }
}

/// Directory of a checkpoint: the path itself, or the parent of a single file.
fn model_dir(path: &Path) -> PathBuf {
    if path.is_file() {
        path.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        path.to_path_buf()
    }
}

/// Select the safetensors files that make up the checkpoint at `path`.
///
/// A directory with a shard index loads exactly the shards its weight map
/// names. Otherwise `model.safetensors` is used when present, and every
/// `*.safetensors` file in the directory as a last resort.
fn weight_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() && path.extension().is_some_and(|e| e == "safetensors") {
        return Ok(vec![path.to_path_buf()]);
    }

    let index_path = path.join(taskdiff_hub::SAFETENSORS_INDEX);
    if index_path.is_file() {
        let index: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
        let shards = taskdiff_hub::shard_filenames(&index);
        if shards.is_empty() {
            return Err(MergeError::ModelLoad(format!(
                "{:?} lists no shards",
                index_path
            )));
        }

        let mut files = Vec::with_capacity(shards.len());
        for shard in shards {
            let file = path.join(&shard);
            if !file.is_file() {
                return Err(MergeError::ModelLoad(format!(
                    "shard {} named by {:?} is missing",
                    shard, index_path
                )));
            }
            files.push(file);
        }
        return Ok(files);
    }

    let single = path.join("model.safetensors");
    if single.is_file() {
        return Ok(vec![single]);
    }

    let mut files = Vec::new();
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let file_path = entry?.path();
            if file_path.is_file() && file_path.extension().is_some_and(|e| e == "safetensors") {
                files.push(file_path);
            }
        }
    }

    if files.is_empty() {
        return Err(MergeError::ModelLoad(format!(
            "No safetensors files found in {:?}",
            path
        )));
    }

    // Sort for deterministic ordering
    files.sort();
    debug!("No index or model.safetensors in {:?}, loading all files", path);
    Ok(files)
}

// =============================================================================
// Safetensors Loading
// =============================================================================

/// Location of a tensor within a memory-mapped file.
#[derive(Debug, Clone)]
struct TensorLocation {
    /// Index into mmaps array.
    file_idx: usize,
    /// Byte offset within the file.
    offset: usize,
    /// Length in bytes.
    len: usize,
    /// Stored data type.
    dtype: Dtype,
    /// Shape.
    shape: Vec<usize>,
}

/// Memory-mapped reader over the safetensors files of one checkpoint.
#[derive(Debug)]
pub struct SafetensorsLoader {
    /// Path to the model directory or file.
    path: PathBuf,
    /// Memory-mapped files.
    mmaps: Vec<(PathBuf, memmap2::Mmap)>,
    /// Tensor name to location, in sorted order.
    tensor_info: BTreeMap<String, TensorLocation>,
    /// Header metadata of the first file that carries any.
    metadata: Option<HashMap<String, String>>,
}

impl SafetensorsLoader {
    /// Index a model directory or a single `.safetensors` file.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let safetensor_files = weight_files(&path)?;

        info!(
            "Memory-mapping {} safetensors files from {:?}",
            safetensor_files.len(),
            path
        );

        let mut mmaps = Vec::with_capacity(safetensor_files.len());
        let mut tensor_info = BTreeMap::new();
        let mut metadata = None;

        for (idx, file_path) in safetensor_files.into_iter().enumerate() {
            debug!("Memory-mapping {:?}", file_path);

            let file = std::fs::File::open(&file_path)?;
            // SAFETY: The file is opened read-only and the mmap lives as long as
            // this loader.
            #[allow(unsafe_code)]
            let mmap = unsafe { memmap2::Mmap::map(&file)? };

            let (_, header) = SafeTensors::read_metadata(&mmap)?;
            if metadata.is_none() {
                metadata = header.metadata().clone();
            }

            let tensors = SafeTensors::deserialize(&mmap)?;
            let base_ptr = mmap.as_ptr() as usize;

            for (name, tensor) in tensors.tensors() {
                let data = tensor.data();
                let location = TensorLocation {
                    file_idx: idx,
                    offset: data.as_ptr() as usize - base_ptr,
                    len: data.len(),
                    dtype: tensor.dtype(),
                    shape: tensor.shape().to_vec(),
                };

                if tensor_info.insert(name.clone(), location).is_some() {
                    return Err(MergeError::ModelLoad(format!(
                        "tensor {} appears in more than one file under {:?}",
                        name, path
                    )));
                }
            }

            mmaps.push((file_path, mmap));
        }

        info!("Indexed {} tensors", tensor_info.len());

        Ok(Self {
            path,
            mmaps,
            tensor_info,
            metadata,
        })
    }

    /// Get the model path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of all tensors, sorted.
    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensor_info.keys().map(String::as_str)
    }

    /// Number of indexed tensors.
    pub fn len(&self) -> usize {
        self.tensor_info.len()
    }

    /// Whether the checkpoint holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensor_info.is_empty()
    }

    /// Shape of a tensor without loading it.
    pub fn tensor_shape(&self, name: &str) -> Option<&[usize]> {
        self.tensor_info.get(name).map(|loc| loc.shape.as_slice())
    }

    /// Stored dtype of a tensor.
    pub fn tensor_dtype(&self, name: &str) -> Option<Dtype> {
        self.tensor_info.get(name).map(|loc| loc.dtype)
    }

    /// Safetensors header metadata (e.g. `{"format": "pt"}`).
    pub fn metadata(&self) -> Option<&HashMap<String, String>> {
        self.metadata.as_ref()
    }

    /// Realize a tensor as `f32` on `device`.
    pub fn load_tensor(&self, name: &str, device: &candle_core::Device) -> Result<Tensor> {
        let loc = self.tensor_info.get(name).ok_or_else(|| {
            MergeError::ModelLoad(format!("tensor {} not found in {:?}", name, self.path))
        })?;

        let (_, mmap) = &self.mmaps[loc.file_idx];
        let data = &mmap[loc.offset..loc.offset + loc.len];
        let floats = realize_f32(name, loc.dtype, data)?;

        Tensor::from_vec(floats, loc.shape.as_slice(), device).map_err(|source| {
            MergeError::Placement {
                name: name.to_string(),
                device: format!("{:?}", device.location()),
                source,
            }
        })
    }
}

/// Convert raw little-endian tensor bytes to `f32` values.
///
/// The copy through `pod_collect_to_vec` tolerates unaligned tensor data.
fn realize_f32(name: &str, dtype: Dtype, data: &[u8]) -> Result<Vec<f32>> {
    let floats = match dtype {
        Dtype::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(data),
        Dtype::F16 => bytemuck::pod_collect_to_vec::<u8, half::f16>(data)
            .iter()
            .map(|h| h.to_f32())
            .collect(),
        Dtype::BF16 => bytemuck::pod_collect_to_vec::<u8, half::bf16>(data)
            .iter()
            .map(|h| h.to_f32())
            .collect(),
        Dtype::F64 => bytemuck::pod_collect_to_vec::<u8, f64>(data)
            .iter()
            .map(|&v| v as f32)
            .collect(),
        dtype => {
            return Err(MergeError::UnsupportedDtype {
                name: name.to_string(),
                dtype: format!("{:?}", dtype),
            });
        }
    };

    Ok(floats)
}

// =============================================================================
// Checkpoints
// =============================================================================

/// A fully realized model: parameters plus the metadata it carries.
#[derive(Debug)]
pub struct Checkpoint {
    /// Resolved local directory (or file) the checkpoint was read from.
    pub location: PathBuf,
    /// Contents of `config.json`, if present.
    pub config: Option<serde_json::Value>,
    /// Contents of `generation_config.json`, if present.
    pub generation_config: Option<serde_json::Value>,
    /// Safetensors header metadata.
    pub metadata: Option<HashMap<String, String>>,
    /// Realized parameters.
    pub params: ParameterMapping,
}

impl Checkpoint {
    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.params.values().map(Tensor::elem_count).sum()
    }

    /// The first `n` keys in iteration order.
    pub fn first_keys(&self, n: usize) -> Vec<&str> {
        self.params.keys().take(n).map(String::as_str).collect()
    }
}

fn read_json_if_exists(path: &Path) -> Result<Option<serde_json::Value>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Resolve `source` and realize every tensor as `f32` on `device`.
pub fn load_checkpoint(
    source: &ModelSource,
    device: &candle_core::Device,
    token: Option<&SecretString>,
) -> Result<Checkpoint> {
    let location = source.resolve(token)?;
    load_checkpoint_from(&location, device)
}

/// Realize a checkpoint already present at a local path.
pub fn load_checkpoint_from(location: &Path, device: &candle_core::Device) -> Result<Checkpoint> {
    let loader = SafetensorsLoader::new(location)?;

    let mut params = ParameterMapping::new();
    for name in loader.tensor_names() {
        let tensor = loader.load_tensor(name, device)?;
        params.insert(name.to_string(), tensor);
    }

    let dir = model_dir(location);
    let config = read_json_if_exists(&dir.join("config.json"))?;
    let generation_config = read_json_if_exists(&dir.join("generation_config.json"))?;

    let checkpoint = Checkpoint {
        location: location.to_path_buf(),
        config,
        generation_config,
        metadata: loader.metadata().cloned(),
        params,
    };

    info!(
        "Loaded {} tensors ({} parameters) from {:?}",
        checkpoint.params.len(),
        checkpoint.num_parameters(),
        location
    );

    Ok(checkpoint)
}
