//! Model lifecycle: loading, residency selection and device transfer
//!
//! A [`ModelHandle`] owns the tokenizer, chat template and decoder weights of
//! the rewriting model. Its weights live in exactly one [`Residency`]: pinned
//! to a device, or held on the host by an [`OffloadSession`] that moves them
//! to the accelerator only for the duration of a call.

use candle_core::{DType, Tensor};
use candle_transformers::models::qwen2::Config as QwenConfig;
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::info;

use super::artifacts::ModelArtifacts;
use super::offload::OffloadSession;
use super::qwen::{load_text_config, QwenModel};
use super::template::ChatTemplate;
use crate::config::ModelConfig;
use crate::reprompt::generation::{
    ConversationMessage, EncodedInputs, GenerationParams, PromptModel, VisionInputs,
};
use crate::types::{DeviceMapping, DeviceSpec, ModelError, StageError};

/// Token strings that end a Qwen chat turn
const FALLBACK_EOS_TOKENS: [&str; 2] = ["<|im_end|>", "<|endoftext|>"];

/// Where weights should live, decided before anything is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidencyPlan {
    Mapped {
        mapping: DeviceMapping,
        device: DeviceSpec,
    },
    Offloaded {
        execution_device: DeviceSpec,
    },
}

impl ResidencyPlan {
    /// Offloading overrides any requested mapping.
    pub fn resolve(device_map: DeviceMapping, enable_offloading: bool) -> Self {
        if enable_offloading {
            ResidencyPlan::Offloaded {
                execution_device: DeviceSpec::best_available(),
            }
        } else {
            ResidencyPlan::Mapped {
                mapping: device_map,
                device: device_map.resolve(),
            }
        }
    }

    /// The mapping in force; unset when an offload session owns residency
    pub fn effective_device_map(&self) -> Option<DeviceMapping> {
        match self {
            ResidencyPlan::Mapped { mapping, .. } => Some(*mapping),
            ResidencyPlan::Offloaded { .. } => None,
        }
    }
}

/// Current home of the decoder weights
pub enum Residency {
    Mapped { device: DeviceSpec, model: QwenModel },
    Offloaded(OffloadSession),
}

/// A loaded rewriting model
pub struct ModelHandle {
    artifacts: ModelArtifacts,
    config: QwenConfig,
    tokenizer: Tokenizer,
    template: ChatTemplate,
    eos_token_ids: Vec<u32>,
    dtype_override: Option<DType>,
    device_map: Option<DeviceMapping>,
    residency: Residency,
}

impl ModelHandle {
    /// Load model and processor artifacts eagerly.
    ///
    /// # Errors
    ///
    /// Any missing or incompatible artifact is fatal.
    pub fn load(
        model_path: impl AsRef<Path>,
        device_map: DeviceMapping,
        enable_offloading: bool,
    ) -> Result<Self, ModelError> {
        Self::load_with_dtype(model_path, device_map, enable_offloading, None)
    }

    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        Self::load_with_dtype(
            &config.model_path,
            config.device_map,
            config.enable_offloading,
            config.dtype(),
        )
    }

    pub fn load_with_dtype(
        model_path: impl AsRef<Path>,
        device_map: DeviceMapping,
        enable_offloading: bool,
        dtype_override: Option<DType>,
    ) -> Result<Self, ModelError> {
        let artifacts = ModelArtifacts::resolve(model_path)?;
        let config = load_text_config(&artifacts.config)?;
        let tokenizer =
            Tokenizer::from_file(&artifacts.tokenizer).map_err(|e| ModelError::Tokenizer {
                reason: e.to_string(),
            })?;
        let template = ChatTemplate::discover(&artifacts.root)?;
        let eos_token_ids = resolve_eos_ids(&artifacts, &tokenizer)?;

        let plan = ResidencyPlan::resolve(device_map, enable_offloading);
        let residency = match plan {
            ResidencyPlan::Mapped { device, .. } => {
                let dtype = dtype_override.unwrap_or_else(|| device.default_dtype());
                let model =
                    QwenModel::from_safetensors(&config, &artifacts.weights, dtype, &device.open()?)?;
                Residency::Mapped { device, model }
            }
            ResidencyPlan::Offloaded { execution_device } => {
                let dtype = dtype_override.unwrap_or_else(|| execution_device.default_dtype());
                Residency::Offloaded(OffloadSession::load(
                    config.clone(),
                    &artifacts.weights,
                    execution_device,
                    dtype,
                )?)
            }
        };

        info!(
            model = %artifacts.root.display(),
            offloading = enable_offloading,
            device = %residency_device(&residency),
            "Rewriting model loaded"
        );

        Ok(Self {
            artifacts,
            config,
            tokenizer,
            template,
            eos_token_ids,
            dtype_override,
            device_map: plan.effective_device_map(),
            residency,
        })
    }

    /// Mapping in force; `None` while offloading
    pub fn effective_device_map(&self) -> Option<DeviceMapping> {
        self.device_map
    }

    pub fn offload_session(&self) -> Option<&OffloadSession> {
        match &self.residency {
            Residency::Offloaded(session) => Some(session),
            Residency::Mapped { .. } => None,
        }
    }

    pub fn is_offloaded(&self) -> bool {
        self.offload_session().is_some()
    }

    /// Device the decoder computes on
    pub fn device(&self) -> DeviceSpec {
        residency_device(&self.residency)
    }

    pub fn config(&self) -> &QwenConfig {
        &self.config
    }

    pub fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    /// Eagerly relocate the whole model and return the same handle.
    pub fn to(&mut self, device: DeviceSpec) -> Result<&mut Self, ModelError> {
        let dtype = self
            .dtype_override
            .unwrap_or_else(|| device.default_dtype());

        match &mut self.residency {
            Residency::Mapped {
                device: current,
                model,
            } => {
                if *current != device || model.dtype() != dtype {
                    *model = QwenModel::from_safetensors(
                        &self.config,
                        &self.artifacts.weights,
                        dtype,
                        &device.open()?,
                    )?;
                    *current = device;
                    self.device_map = Some(DeviceMapping::Device(device));
                }
            }
            Residency::Offloaded(session) => session.retarget(device, dtype),
        }

        info!(device = %device, "Rewriting model moved");
        Ok(self)
    }
}

impl PromptModel for ModelHandle {
    fn apply_chat_template(
        &self,
        messages: &[ConversationMessage],
        add_generation_prompt: bool,
    ) -> Result<String, StageError> {
        self.template.render(messages, add_generation_prompt)
    }

    fn encode(
        &self,
        text: &str,
        vision: &VisionInputs,
        device: &DeviceSpec,
    ) -> Result<EncodedInputs, StageError> {
        if !vision.is_empty() {
            return Err(StageError::pack(
                "visual inputs are not supported by the text decoder",
            ));
        }

        let encoding = self.tokenizer.encode(text, false).map_err(StageError::pack)?;
        let ids = encoding.get_ids();
        if ids.is_empty() {
            return Err(StageError::pack("rendered prompt produced no tokens"));
        }

        let device = device.open().map_err(StageError::pack)?;
        let input_ids = Tensor::new(ids, &device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(StageError::pack)?;
        Ok(EncodedInputs { input_ids })
    }

    fn generate(
        &mut self,
        inputs: &EncodedInputs,
        params: &GenerationParams,
    ) -> Result<Vec<Vec<u32>>, StageError> {
        let batch = inputs.input_ids.dim(0).map_err(StageError::generate)?;
        let eos = &self.eos_token_ids;

        let mut sequences = Vec::with_capacity(batch);
        for row in 0..batch {
            let prompt = inputs
                .input_ids
                .narrow(0, row, 1)
                .map_err(StageError::generate)?;

            let sequence = match &mut self.residency {
                Residency::Mapped { model, .. } => model
                    .generate_row(&prompt, params, eos)
                    .map_err(StageError::generate)?,
                Residency::Offloaded(session) => session.with_resident(|model| {
                    // Inputs follow the weights onto the execution device
                    let prompt = prompt
                        .to_device(model.device())
                        .map_err(StageError::generate)?;
                    model
                        .generate_row(&prompt, params, eos)
                        .map_err(StageError::generate)
                })?,
            };
            sequences.push(sequence);
        }
        Ok(sequences)
    }

    fn batch_decode(&self, sequences: &[Vec<u32>]) -> Result<Vec<String>, StageError> {
        sequences
            .iter()
            .map(|ids| {
                self.tokenizer
                    .decode(ids, true)
                    .map_err(|e| StageError::Decode {
                        reason: e.to_string(),
                    })
            })
            .collect()
    }

    fn move_to(&mut self, device: &DeviceSpec) -> Result<(), ModelError> {
        self.to(*device).map(|_| ())
    }
}

fn residency_device(residency: &Residency) -> DeviceSpec {
    match residency {
        Residency::Mapped { device, .. } => *device,
        Residency::Offloaded(session) => session.execution_device(),
    }
}

/// EOS ids from the generation config, else the chat end-of-turn tokens.
fn resolve_eos_ids(artifacts: &ModelArtifacts, tokenizer: &Tokenizer) -> Result<Vec<u32>, ModelError> {
    let declared = artifacts.eos_token_ids()?;
    if !declared.is_empty() {
        return Ok(declared);
    }
    Ok(FALLBACK_EOS_TOKENS
        .iter()
        .filter_map(|token| tokenizer.token_to_id(token))
        .collect())
}
