//! Chat template rendering with minijinja
//!
//! Hugging Face processors ship a Jinja chat template. Qwen-VL templates
//! iterate over typed content parts and count images and videos through
//! `namespace`, all of which minijinja handles once the few Python-style
//! method calls are rewritten as tests.

use minijinja::{context, Environment, Error as JinjaError, ErrorKind};
use serde_json::Value;
use std::path::Path;

use super::artifacts::read_json;
use crate::reprompt::generation::ConversationMessage;
use crate::types::{ModelError, StageError};

/// A compiled-on-demand chat template plus the special tokens it may reference
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    source: String,
    bos_token: Option<String>,
    eos_token: Option<String>,
}

impl ChatTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            bos_token: None,
            eos_token: None,
        }
    }

    pub fn with_special_tokens(mut self, bos: Option<String>, eos: Option<String>) -> Self {
        self.bos_token = bos;
        self.eos_token = eos;
        self
    }

    /// Locate the template in a model root.
    ///
    /// `chat_template.json` wins over the `chat_template` field of
    /// `tokenizer_config.json`, matching how multimodal processors are saved.
    pub fn discover(root: &Path) -> Result<Self, ModelError> {
        let tokenizer_config = read_json_if_exists(&root.join("tokenizer_config.json"))?;
        let processor_template = read_json_if_exists(&root.join("chat_template.json"))?;

        let source = processor_template
            .as_ref()
            .and_then(|v| v.get("chat_template"))
            .and_then(Value::as_str)
            .or_else(|| {
                tokenizer_config
                    .as_ref()
                    .and_then(|v| v.get("chat_template"))
                    .and_then(Value::as_str)
            })
            .ok_or_else(|| ModelError::MissingTemplate {
                path: root.display().to_string(),
            })?;

        let special = |key: &str| {
            tokenizer_config
                .as_ref()
                .and_then(|v| v.get(key))
                .and_then(special_token_content)
        };

        Ok(Self::new(source).with_special_tokens(special("bos_token"), special("eos_token")))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render `messages` as model input text.
    pub fn render(
        &self,
        messages: &[ConversationMessage],
        add_generation_prompt: bool,
    ) -> Result<String, StageError> {
        let source = rewrite_python_calls(&self.source);
        let env = template_environment();
        let template = env
            .template_from_str(&source)
            .map_err(|e| StageError::Template {
                reason: format!("template compilation failed: {}", e),
            })?;

        template
            .render(context! {
                messages => messages,
                add_generation_prompt => add_generation_prompt,
                bos_token => self.bos_token.as_deref().unwrap_or(""),
                eos_token => self.eos_token.as_deref().unwrap_or(""),
            })
            .map_err(|e| StageError::Template {
                reason: e.to_string(),
            })
    }
}

fn template_environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.add_test("startswith", |value: &str, prefix: &str| value.starts_with(prefix));
    env.add_test("endswith", |value: &str, suffix: &str| value.ends_with(suffix));
    env.add_function("raise_exception", raise_exception);
    env
}

fn raise_exception(message: String) -> Result<String, JinjaError> {
    Err(JinjaError::new(ErrorKind::InvalidOperation, message))
}

/// `x.startswith(y)` is Python; minijinja spells it `x is startswith(y)`.
fn rewrite_python_calls(source: &str) -> String {
    source
        .replace(".startswith(", " is startswith(")
        .replace(".endswith(", " is endswith(")
}

/// Special tokens appear either as plain strings or as `{"content": ...}` objects.
fn special_token_content(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("content").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn read_json_if_exists(path: &Path) -> Result<Option<Value>, ModelError> {
    if path.exists() {
        read_json(path).map(Some)
    } else {
        Ok(None)
    }
}
