//! Qwen2 text decoder used for rewriting
//!
//! Qwen2.5-VL checkpoints store their language model under the same
//! `model.*` / `lm_head` names as Qwen2. For text-only input the multimodal
//! rotary sections collapse to ordinary 1-D positions, so the plain Qwen2
//! decoder from `candle-transformers` runs these weights unchanged.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::qwen2::{Config as QwenConfig, ModelForCausalLM};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

use super::artifacts::read_json;
use crate::reprompt::generation::GenerationParams;
use crate::types::ModelError;

/// Loaded decoder weights on one device
pub struct QwenModel {
    inner: ModelForCausalLM,
    device: Device,
    dtype: DType,
}

impl QwenModel {
    pub fn new(config: &QwenConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let device = vb.device().clone();
        let dtype = vb.dtype();
        let inner = ModelForCausalLM::new(config, vb)?;
        Ok(Self {
            inner,
            device,
            dtype,
        })
    }

    /// Memory-map safetensors shards straight onto `device`.
    pub fn from_safetensors(
        config: &QwenConfig,
        weights: &[PathBuf],
        dtype: DType,
        device: &Device,
    ) -> Result<Self, ModelError> {
        // SAFETY: weight files must not be modified while they are mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights, dtype, device)? };
        Ok(Self::new(config, vb)?)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Continue one `(1, seq_len)` prompt, returning prompt plus new tokens.
    ///
    /// Stops after `max_new_tokens` or right after an EOS token, which is
    /// kept in the output like any other generated id.
    pub fn generate_row(
        &mut self,
        prompt: &Tensor,
        params: &GenerationParams,
        eos_token_ids: &[u32],
    ) -> candle_core::Result<Vec<u32>> {
        self.inner.clear_kv_cache();
        let mut processor = LogitsProcessor::from_sampling(params.seed, sampling(params));
        let mut tokens: Vec<u32> = prompt.squeeze(0)?.to_vec1()?;

        let mut input = prompt.clone();
        let mut offset = 0;
        for _ in 0..params.max_new_tokens {
            let seq_len = input.dim(1)?;
            let logits = self.inner.forward(&input, offset)?;
            let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;
            let next = processor.sample(&logits)?;

            offset += seq_len;
            tokens.push(next);
            if eos_token_ids.contains(&next) {
                break;
            }
            input = Tensor::new(&[next], prompt.device())?.unsqueeze(0)?;
        }

        self.inner.clear_kv_cache();
        Ok(tokens)
    }
}

/// Greedy unless sampling is switched on with a positive temperature
pub fn sampling(params: &GenerationParams) -> Sampling {
    if !params.do_sample || params.temperature <= 0.0 {
        Sampling::ArgMax
    } else {
        Sampling::TopKThenTopP {
            k: params.top_k,
            p: params.top_p,
            temperature: params.temperature,
        }
    }
}

/// Read the text-decoder configuration from `config.json`.
///
/// Newer VL exports nest decoder fields under `text_config`; keys Qwen2.5-VL
/// leaves implicit are filled with its defaults.
pub fn load_text_config(path: &Path) -> Result<QwenConfig, ModelError> {
    let value = read_json(path)?;
    let invalid = |reason: String| ModelError::InvalidArtifact {
        path: path.display().to_string(),
        reason,
    };

    let root = value
        .as_object()
        .ok_or_else(|| invalid("config is not a JSON object".to_string()))?;
    let mut fields: Map<String, Value> = match root.get("text_config").and_then(Value::as_object) {
        Some(text) if !root.contains_key("hidden_size") => text.clone(),
        _ => root.clone(),
    };

    let max_positions = fields
        .get("max_position_embeddings")
        .cloned()
        .unwrap_or(json!(32768));
    let layers = fields.get("num_hidden_layers").cloned().unwrap_or(json!(0));
    let defaults = [
        ("sliding_window", max_positions),
        ("max_window_layers", layers),
        ("use_sliding_window", json!(false)),
        ("tie_word_embeddings", json!(false)),
        ("rope_theta", json!(1_000_000.0)),
        ("rms_norm_eps", json!(1e-6)),
        ("hidden_act", json!("silu")),
    ];
    for (key, default) in defaults {
        match fields.get(key) {
            Some(existing) if !existing.is_null() => {}
            _ => {
                fields.insert(key.to_string(), default);
            }
        }
    }

    serde_json::from_value(Value::Object(fields)).map_err(|e| invalid(e.to_string()))
}
