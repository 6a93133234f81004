//! Generation invocation protocol
//!
//! [`GenerationInvoker`] drives a [`PromptModel`] through its stages: chat
//! template rendering, input packing, token generation and decoding. Each
//! stage reports failure through [`StageError`] so the guard can decide how
//! to degrade.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{DeviceSpec, ModelError, StageError};

/// Instruction prepended to every prompt unless the caller overrides it
pub const DEFAULT_SYSTEM_PROMPT: &str = "请根据用户的输入，生成思考过程的思维链并改写提示词：";

/// Upper bound on tokens produced per call
pub const DEFAULT_MAX_NEW_TOKENS: usize = 2048;

/// Role of a conversation participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One piece of message content, in the shape multimodal chat templates expect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image { image: String },
    Video { video: String },
}

/// A role-tagged conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: Vec<ContentPart>,
}

impl ConversationMessage {
    /// The single user turn sent for a rewrite: instruction, newline, prompt
    pub fn user_turn(system_instruction: &str, prompt: &str) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentPart::Text {
                text: format!("{}\n{}", system_instruction, prompt),
            }],
        }
    }

    /// Concatenated text of all text parts
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Visual inputs referenced by a conversation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisionInputs {
    pub images: Vec<String>,
    pub videos: Vec<String>,
}

impl VisionInputs {
    pub fn from_messages(messages: &[ConversationMessage]) -> Self {
        let mut inputs = Self::default();
        for part in messages.iter().flat_map(|m| m.content.iter()) {
            match part {
                ContentPart::Image { image } => inputs.images.push(image.clone()),
                ContentPart::Video { video } => inputs.videos.push(video.clone()),
                ContentPart::Text { .. } => {}
            }
        }
        inputs
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.videos.is_empty()
    }
}

/// A single rewrite request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_instruction: String,
    pub temperature: f64,
    pub device: DeviceSpec,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_instruction: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: 0.0,
            device: DeviceSpec::default(),
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn on_device(mut self, device: DeviceSpec) -> Self {
        self.device = device;
        self
    }
}

/// Decoding parameters handed to the model
///
/// With `do_sample` disabled decoding is greedy and `temperature`, `top_k`
/// and `top_p` have no effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            do_sample: false,
            temperature: 0.0,
            top_k: 5,
            top_p: 0.9,
            seed: 299_792_458,
        }
    }
}

/// Token ids ready for the model, already placed on the request device
#[derive(Debug, Clone)]
pub struct EncodedInputs {
    /// `(batch, seq_len)` u32 tensor
    pub input_ids: Tensor,
}

impl EncodedInputs {
    /// Prompt length of each batch row
    pub fn sequence_lengths(&self) -> Result<Vec<usize>, StageError> {
        let (batch, seq_len) = self.input_ids.dims2().map_err(StageError::pack)?;
        Ok(vec![seq_len; batch])
    }
}

/// Stage interface of a prompt-rewriting model
pub trait PromptModel {
    /// Render messages to text without tokenizing
    fn apply_chat_template(
        &self,
        messages: &[ConversationMessage],
        add_generation_prompt: bool,
    ) -> Result<String, StageError>;

    /// Tokenize rendered text and place it on `device`
    fn encode(
        &self,
        text: &str,
        vision: &VisionInputs,
        device: &DeviceSpec,
    ) -> Result<EncodedInputs, StageError>;

    /// Full sequences per batch row: prompt tokens followed by new tokens
    fn generate(
        &mut self,
        inputs: &EncodedInputs,
        params: &GenerationParams,
    ) -> Result<Vec<Vec<u32>>, StageError>;

    /// Decode token sequences, skipping special tokens
    fn batch_decode(&self, sequences: &[Vec<u32>]) -> Result<Vec<String>, StageError>;

    /// Relocate the whole model
    fn move_to(&mut self, device: &DeviceSpec) -> Result<(), ModelError>;
}

/// Runs one request through the stages of a [`PromptModel`]
#[derive(Debug, Clone, Default)]
pub struct GenerationInvoker {
    params: GenerationParams,
}

impl GenerationInvoker {
    pub fn new(params: GenerationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// Produce the raw decoded continuation for `request`.
    pub fn invoke<M: PromptModel + ?Sized>(
        &self,
        model: &mut M,
        request: &GenerationRequest,
    ) -> Result<String, StageError> {
        let messages = [ConversationMessage::user_turn(
            &request.system_instruction,
            &request.prompt,
        )];

        let text = model.apply_chat_template(&messages, true)?;
        let vision = VisionInputs::from_messages(&messages);
        let inputs = model.encode(&text, &vision, &request.device)?;
        debug!(device = %request.device, "Encoded rewrite request");

        let params = GenerationParams {
            temperature: request.temperature,
            ..self.params.clone()
        };
        let generated = model.generate(&inputs, &params)?;
        let trimmed = trim_prompt_prefix(&inputs.sequence_lengths()?, generated);

        let decoded = model.batch_decode(&trimmed)?;
        decoded.into_iter().next().ok_or_else(|| StageError::Decode {
            reason: "model returned no sequences".to_string(),
        })
    }
}

/// Drop each row's prompt tokens, keeping only newly generated ones.
pub fn trim_prompt_prefix(prompt_lengths: &[usize], generated: Vec<Vec<u32>>) -> Vec<Vec<u32>> {
    generated
        .into_iter()
        .zip(prompt_lengths)
        .map(|(mut row, &len)| row.split_off(len.min(row.len())))
        .collect()
}
