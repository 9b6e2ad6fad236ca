//! Model and tokenizer downloading from HuggingFace Hub.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use taskdiff_core::{CoreError, Result, SecretString};

/// Index file listing the shards of a sharded safetensors checkpoint.
pub const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";

/// Build API with optional token authentication.
fn build_api(token: Option<&SecretString>) -> Result<Api> {
    let mut builder = ApiBuilder::new();

    if let Some(secret) = token {
        builder = builder.with_token(Some(secret.expose_secret().to_string()));
    }

    builder.build().map_err(|e| CoreError::Hub(e.to_string()))
}

fn open_repo(api: &Api, model_id: &str, revision: Option<&str>) -> ApiRepo {
    match revision {
        Some(rev) => api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            rev.to_string(),
        )),
        None => api.model(model_id.to_string()),
    }
}

/// Fetch a file that may legitimately be absent from the repository.
fn get_optional(repo: &ApiRepo, filename: &str) -> Option<PathBuf> {
    match repo.get(filename) {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::debug!("{} not fetched: {}", filename, e);
            None
        }
    }
}

/// Download a model's weights and configuration from HuggingFace Hub.
///
/// Fetches `config.json` and `generation_config.json` when present, then every
/// safetensors file of the checkpoint. Returns the local snapshot directory
/// holding them.
///
/// # Arguments
/// * `model_id` - Model identifier (e.g., "Qwen/Qwen3-14B")
/// * `revision` - Optional revision/branch (e.g., "main")
/// * `token` - Optional authentication token
pub fn download_model(
    model_id: &str,
    revision: Option<&str>,
    token: Option<&SecretString>,
) -> Result<PathBuf> {
    let api = build_api(token)?;
    let repo = open_repo(&api, model_id, revision);

    get_optional(&repo, "config.json");
    get_optional(&repo, "generation_config.json");

    tracing::info!("Downloading weights for {}...", model_id);
    let weights = download_safetensors(&repo, model_id)?;

    snapshot_dir(&weights[0])
}

/// Download all safetensors files of a checkpoint.
///
/// Single-file checkpoints are tried first; otherwise the shard index is
/// fetched and every shard it references is downloaded.
fn download_safetensors(repo: &ApiRepo, model_id: &str) -> Result<Vec<PathBuf>> {
    if let Some(path) = get_optional(repo, "model.safetensors") {
        return Ok(vec![path]);
    }

    let index_path = repo.get(SAFETENSORS_INDEX).map_err(|e| {
        CoreError::Hub(format!(
            "{} has neither model.safetensors nor {}: {}",
            model_id, SAFETENSORS_INDEX, e
        ))
    })?;

    let index_content = std::fs::read_to_string(&index_path)?;
    let index: serde_json::Value = serde_json::from_str(&index_content)
        .map_err(|e| CoreError::Serialization(e.to_string()))?;

    let shards = shard_filenames(&index);
    if shards.is_empty() {
        return Err(CoreError::Hub(format!(
            "{} in {} lists no shards",
            SAFETENSORS_INDEX, model_id
        )));
    }

    let mut paths = Vec::with_capacity(shards.len());
    for filename in shards {
        tracing::debug!("Downloading shard {}", filename);
        let path = repo
            .get(&filename)
            .map_err(|e| CoreError::Hub(format!("{}: {}", filename, e)))?;
        paths.push(path);
    }

    Ok(paths)
}

/// Download tokenizer assets from a model repository, best-effort.
///
/// Each name in `filenames` is fetched independently and missing files are
/// skipped. Returns the snapshot directory when at least one file was fetched,
/// `None` otherwise.
pub fn download_tokenizer_files(
    model_id: &str,
    revision: Option<&str>,
    token: Option<&SecretString>,
    filenames: &[&str],
) -> Result<Option<PathBuf>> {
    let api = build_api(token)?;
    let repo = open_repo(&api, model_id, revision);

    let fetched: Vec<PathBuf> = filenames
        .iter()
        .filter_map(|name| get_optional(&repo, name))
        .collect();

    match fetched.first() {
        Some(first) => Ok(Some(snapshot_dir(first)?)),
        None => Ok(None),
    }
}

/// Collect the distinct shard filenames referenced by a safetensors index.
///
/// The result is sorted so shards are downloaded in a stable order.
pub fn shard_filenames(index: &serde_json::Value) -> Vec<String> {
    let Some(weight_map) = index.get("weight_map").and_then(|v| v.as_object()) else {
        return Vec::new();
    };

    weight_map
        .values()
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn snapshot_dir(file: &Path) -> Result<PathBuf> {
    file.parent().map(Path::to_path_buf).ok_or_else(|| {
        CoreError::Hub(format!("downloaded file {:?} has no parent directory", file))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_filenames_dedup_and_sort() {
        let index = serde_json::json!({
            "metadata": { "total_size": 1024 },
            "weight_map": {
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors"
            }
        });

        assert_eq!(
            shard_filenames(&index),
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string(),
            ]
        );
    }

    #[test]
    fn test_shard_filenames_without_weight_map() {
        let index = serde_json::json!({ "metadata": {} });
        assert!(shard_filenames(&index).is_empty());
    }

    #[test]
    fn test_snapshot_dir_is_parent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("model.safetensors");
        assert_eq!(snapshot_dir(&file).unwrap(), dir.path());
    }
}
