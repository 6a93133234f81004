//! Discovery of the files that make up a pretrained model directory

use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::types::ModelError;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";
const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Paths of every artifact needed to load the rewriting model
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub root: PathBuf,
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub generation_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

impl ModelArtifacts {
    /// Collect artifacts from a local model directory.
    ///
    /// # Errors
    ///
    /// Fails when the directory, its config, its tokenizer, or every weight
    /// shard is missing.
    pub fn discover(root: impl AsRef<Path>) -> Result<Self, ModelError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(ModelError::ArtifactNotFound {
                path: root.display().to_string(),
            });
        }

        let config = require(&root, CONFIG_FILE)?;
        let tokenizer = require(&root, TOKENIZER_FILE)?;
        let generation_config = Some(root.join(GENERATION_CONFIG_FILE)).filter(|p| p.exists());
        let weights = weight_files(&root)?;

        debug!(
            root = %root.display(),
            shards = weights.len(),
            "Discovered model artifacts"
        );

        Ok(Self {
            root,
            config,
            tokenizer,
            generation_config,
            weights,
        })
    }

    /// Download a model repository from the Hugging Face hub into the local cache.
    #[cfg(feature = "hub")]
    pub fn fetch(repo_id: &str) -> Result<Self, ModelError> {
        use hf_hub::api::sync::Api;

        let hub_error = |e: hf_hub::api::sync::ApiError| ModelError::HubDownload {
            repo: repo_id.to_string(),
            reason: e.to_string(),
        };

        let api = Api::new().map_err(hub_error)?;
        let repo = api.model(repo_id.to_string());

        let config = repo.get(CONFIG_FILE).map_err(hub_error)?;
        let tokenizer = repo.get(TOKENIZER_FILE).map_err(hub_error)?;
        // Templates and generation settings are optional in older uploads
        for optional in ["tokenizer_config.json", "chat_template.json"] {
            let _ = repo.get(optional);
        }
        let generation_config = repo.get(GENERATION_CONFIG_FILE).ok();

        let weights = match repo.get(SAFETENSORS_INDEX_FILE) {
            Ok(index) => shard_names(&index)?
                .iter()
                .map(|name| repo.get(name).map_err(hub_error))
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => vec![repo.get("model.safetensors").map_err(hub_error)?],
        };

        let root = config
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            root,
            config,
            tokenizer,
            generation_config,
            weights,
        })
    }

    /// Resolve a local directory, or a hub repository id when `hub` is enabled.
    pub fn resolve(source: impl AsRef<Path>) -> Result<Self, ModelError> {
        let source = source.as_ref();
        #[cfg(feature = "hub")]
        {
            if !source.exists() {
                if let Some(repo_id) = source.to_str() {
                    return Self::fetch(repo_id);
                }
            }
        }
        Self::discover(source)
    }

    /// EOS token ids declared in `generation_config.json`, if any
    pub fn eos_token_ids(&self) -> Result<Vec<u32>, ModelError> {
        let Some(path) = &self.generation_config else {
            return Ok(Vec::new());
        };
        let value = read_json(path)?;
        let ids: Vec<u64> = match value.get("eos_token_id") {
            Some(Value::Number(n)) => n.as_u64().into_iter().collect(),
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_u64).collect(),
            _ => Vec::new(),
        };
        Ok(ids.into_iter().map(|id| id as u32).collect())
    }
}

fn require(root: &Path, name: &str) -> Result<PathBuf, ModelError> {
    let path = root.join(name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(ModelError::ArtifactNotFound {
            path: path.display().to_string(),
        })
    }
}

/// Shards named by the safetensors index, or every `*.safetensors` file.
fn weight_files(root: &Path) -> Result<Vec<PathBuf>, ModelError> {
    let index = root.join(SAFETENSORS_INDEX_FILE);
    let files: Vec<PathBuf> = if index.is_file() {
        shard_names(&index)?
            .into_iter()
            .map(|name| root.join(name))
            .collect()
    } else {
        let entries = std::fs::read_dir(root).map_err(|e| ModelError::InvalidArtifact {
            path: root.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        files.sort();
        files
    };

    if files.is_empty() {
        return Err(ModelError::ArtifactNotFound {
            path: root.join("*.safetensors").display().to_string(),
        });
    }
    if let Some(missing) = files.iter().find(|p| !p.is_file()) {
        return Err(ModelError::ArtifactNotFound {
            path: missing.display().to_string(),
        });
    }
    Ok(files)
}

fn shard_names(index: &Path) -> Result<BTreeSet<String>, ModelError> {
    let value = read_json(index)?;
    let weight_map = value
        .get("weight_map")
        .and_then(Value::as_object)
        .ok_or_else(|| ModelError::InvalidArtifact {
            path: index.display().to_string(),
            reason: "missing weight_map".to_string(),
        })?;
    Ok(weight_map
        .values()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect())
}

pub(crate) fn read_json(path: &Path) -> Result<Value, ModelError> {
    let content = std::fs::read_to_string(path).map_err(|e| ModelError::InvalidArtifact {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| ModelError::InvalidArtifact {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
