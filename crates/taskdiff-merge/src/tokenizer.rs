//! Tokenizer asset copying.
//!
//! The merged model reuses the source model's tokenizer. Copying is
//! best-effort at the pipeline level: callers log failures and carry on.

use std::path::{Path, PathBuf};

use taskdiff_core::SecretString;
use tracing::debug;

use crate::{MergeError, ModelSource, Result};

/// Files that make up a HuggingFace tokenizer.
pub const TOKENIZER_FILES: &[&str] = &[
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "tokenizer.model",
    "vocab.json",
    "merges.txt",
    "vocab.txt",
    "added_tokens.json",
    "chat_template.jinja",
];

/// Copy tokenizer assets found in `from_dir` into `to_dir`.
///
/// A `tokenizer.json` must parse with the `tokenizers` crate before anything
/// is copied. Returns the destination paths.
pub fn copy_tokenizer_assets(from_dir: &Path, to_dir: &Path) -> Result<Vec<PathBuf>> {
    let present: Vec<&str> = TOKENIZER_FILES
        .iter()
        .copied()
        .filter(|name| from_dir.join(name).is_file())
        .collect();

    if present.is_empty() {
        return Err(MergeError::Tokenizer(format!(
            "no tokenizer files found in {:?}",
            from_dir
        )));
    }

    let tokenizer_json = from_dir.join("tokenizer.json");
    if tokenizer_json.is_file() {
        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_json)
            .map_err(|e| MergeError::Tokenizer(format!("{:?}: {}", tokenizer_json, e)))?;
        debug!(
            "Validated tokenizer with {} tokens",
            tokenizer.get_vocab_size(true)
        );
    }

    std::fs::create_dir_all(to_dir)?;
    let same_dir = match (from_dir.canonicalize(), to_dir.canonicalize()) {
        (Ok(from), Ok(to)) => from == to,
        _ => false,
    };

    let mut copied = Vec::with_capacity(present.len());
    for name in present {
        let dest = to_dir.join(name);
        if !same_dir {
            std::fs::copy(from_dir.join(name), &dest)?;
        }
        debug!("Copied {}", name);
        copied.push(dest);
    }

    Ok(copied)
}

/// Fetch the tokenizer of `source` and copy it into `output_path`.
pub fn copy_tokenizer(
    source: &ModelSource,
    output_path: &Path,
    token: Option<&SecretString>,
) -> Result<Vec<PathBuf>> {
    let from_dir = source
        .tokenizer_dir(token, TOKENIZER_FILES)?
        .ok_or_else(|| {
            MergeError::Tokenizer(format!("no tokenizer files found for {}", source))
        })?;

    copy_tokenizer_assets(&from_dir, output_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORD_LEVEL_TOKENIZER: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": null,
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": { "[UNK]": 0, "hello": 1, "world": 2 },
    "unk_token": "[UNK]"
  }
}"#;

    #[test]
    fn test_copies_present_files() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();
        std::fs::write(from.path().join("tokenizer.json"), WORD_LEVEL_TOKENIZER).unwrap();
        std::fs::write(from.path().join("tokenizer_config.json"), "{}").unwrap();

        let copied = copy_tokenizer_assets(from.path(), to.path()).unwrap();

        assert_eq!(copied.len(), 2);
        assert!(to.path().join("tokenizer.json").is_file());
        assert!(to.path().join("tokenizer_config.json").is_file());
        assert!(!to.path().join("vocab.json").exists());
    }

    #[test]
    fn test_no_assets_is_tokenizer_error() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();

        let err = copy_tokenizer_assets(from.path(), to.path()).unwrap_err();
        assert!(matches!(err, MergeError::Tokenizer(_)));
    }

    #[test]
    fn test_malformed_tokenizer_json_is_rejected() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();
        std::fs::write(from.path().join("tokenizer.json"), "{ not json").unwrap();
        std::fs::write(from.path().join("tokenizer_config.json"), "{}").unwrap();

        let err = copy_tokenizer_assets(from.path(), to.path()).unwrap_err();
        assert!(matches!(err, MergeError::Tokenizer(_)));
        assert!(!to.path().join("tokenizer_config.json").exists());
    }

    #[test]
    fn test_copy_into_same_directory_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vocab.txt"), "[UNK]\nhello\n").unwrap();

        let copied = copy_tokenizer_assets(dir.path(), dir.path()).unwrap();
        assert_eq!(copied.len(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("vocab.txt")).unwrap(),
            "[UNK]\nhello\n"
        );
    }
}
