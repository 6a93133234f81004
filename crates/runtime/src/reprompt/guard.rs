//! The failure guard around prompt rewriting
//!
//! [`RePrompt`] always hands back a usable prompt. Every stage error becomes
//! a [`RewriteOutcome::Fallback`] carrying the original prompt, and a single
//! diagnostic line is written through the configured [`FallbackReporter`].

use std::time::Instant;
use tracing::{debug, info};

use super::generation::{GenerationInvoker, GenerationParams, GenerationRequest, PromptModel};
use super::sanitize::sanitize;
use crate::models::ModelHandle;
use crate::types::{DeviceSpec, ModelError, StageError};

/// Line emitted whenever the original prompt is returned
pub const FALLBACK_MESSAGE: &str = "✗ Re-prompting failed, so we are using the original prompt";

/// Side channel for the fallback diagnostic
pub trait FallbackReporter: Send {
    fn report(&self, line: &str);
}

/// Writes the diagnostic to standard error
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrReporter;

impl FallbackReporter for StderrReporter {
    fn report(&self, line: &str) {
        eprintln!("{}", line);
    }
}

/// Result of one rewrite attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RewriteOutcome {
    Rewritten(String),
    Fallback { prompt: String, error: StageError },
}

impl RewriteOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, RewriteOutcome::Fallback { .. })
    }

    pub fn error(&self) -> Option<&StageError> {
        match self {
            RewriteOutcome::Rewritten(_) => None,
            RewriteOutcome::Fallback { error, .. } => Some(error),
        }
    }

    /// The prompt to hand downstream
    pub fn into_text(self) -> String {
        match self {
            RewriteOutcome::Rewritten(text) => text,
            RewriteOutcome::Fallback { prompt, .. } => prompt,
        }
    }
}

/// Prompt rewriter with a guaranteed fallback
pub struct RePrompt<M = ModelHandle> {
    model: M,
    invoker: GenerationInvoker,
    reporter: Box<dyn FallbackReporter>,
}

impl RePrompt<ModelHandle> {
    /// Load the rewriting model and wrap it.
    ///
    /// # Errors
    ///
    /// Load failures are fatal and returned unchanged.
    pub fn load(
        model_path: impl AsRef<std::path::Path>,
        device_map: crate::types::DeviceMapping,
        enable_offloading: bool,
    ) -> Result<Self, ModelError> {
        let model = ModelHandle::load(model_path, device_map, enable_offloading)?;
        Ok(Self::new(model))
    }
}

impl<M: PromptModel> RePrompt<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            invoker: GenerationInvoker::default(),
            reporter: Box::new(StderrReporter),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.invoker = GenerationInvoker::new(params);
        self
    }

    pub fn with_reporter(mut self, reporter: impl FallbackReporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Rewrite `prompt`, returning it unchanged on any failure.
    pub fn predict(
        &mut self,
        prompt: &str,
        system_instruction: &str,
        temperature: f64,
        device: DeviceSpec,
    ) -> String {
        let request = GenerationRequest::new(prompt)
            .with_system_instruction(system_instruction)
            .with_temperature(temperature)
            .on_device(device);
        self.rewrite(&request).into_text()
    }

    /// Rewrite with the full outcome exposed.
    pub fn rewrite(&mut self, request: &GenerationRequest) -> RewriteOutcome {
        let started = Instant::now();
        let result = self
            .invoker
            .invoke(&mut self.model, request)
            .and_then(|raw| sanitize(&raw));

        match result {
            Ok(text) => {
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Prompt rewritten"
                );
                RewriteOutcome::Rewritten(text)
            }
            Err(error) => {
                debug!(
                    stage = error.stage(),
                    kind = ?error.kind(),
                    %error,
                    "Rewrite stage failed"
                );
                self.reporter.report(FALLBACK_MESSAGE);
                RewriteOutcome::Fallback {
                    prompt: request.prompt.clone(),
                    error,
                }
            }
        }
    }

    /// Relocate the model and return the rewriter for chaining.
    pub fn to(&mut self, device: DeviceSpec) -> Result<&mut Self, ModelError> {
        self.model.move_to(&device)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reprompt::generation::{ConversationMessage, EncodedInputs, VisionInputs};
    use crate::types::FailureKind;
    use candle_core::{Device, Tensor};
    use std::sync::{Arc, Mutex};

    /// Records every diagnostic line
    #[derive(Clone, Default)]
    struct RecordingReporter(Arc<Mutex<Vec<String>>>);

    impl RecordingReporter {
        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl FallbackReporter for RecordingReporter {
        fn report(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    /// Stage at which the scripted model fails
    #[derive(Clone, Copy, PartialEq)]
    enum FailAt {
        Nowhere,
        Template,
        Pack,
        Generate,
        Decode,
    }

    /// Model whose decoded continuation is scripted
    struct ScriptedModel {
        reply: String,
        fail_at: FailAt,
        device: DeviceSpec,
        seen_params: Option<GenerationParams>,
    }

    impl ScriptedModel {
        fn replying(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                fail_at: FailAt::Nowhere,
                device: DeviceSpec::Cpu,
                seen_params: None,
            }
        }

        fn failing_at(fail_at: FailAt) -> Self {
            Self {
                fail_at,
                ..Self::replying("<think>x</think>\nrewritten")
            }
        }
    }

    impl PromptModel for ScriptedModel {
        fn apply_chat_template(
            &self,
            messages: &[ConversationMessage],
            add_generation_prompt: bool,
        ) -> Result<String, StageError> {
            if self.fail_at == FailAt::Template {
                return Err(StageError::Template {
                    reason: "undefined variable".into(),
                });
            }
            let mut text = format!("<user>{}</user>", messages[0].text());
            if add_generation_prompt {
                text.push_str("<assistant>");
            }
            Ok(text)
        }

        fn encode(
            &self,
            text: &str,
            vision: &VisionInputs,
            device: &DeviceSpec,
        ) -> Result<EncodedInputs, StageError> {
            assert!(vision.is_empty());
            if self.fail_at == FailAt::Pack || *device != self.device {
                return Err(StageError::pack("device mismatch"));
            }
            let ids: Vec<u32> = (0..text.len() as u32).collect();
            let input_ids = Tensor::new(ids.as_slice(), &Device::Cpu)
                .and_then(|t| t.unsqueeze(0))
                .map_err(StageError::pack)?;
            Ok(EncodedInputs { input_ids })
        }

        fn generate(
            &mut self,
            inputs: &EncodedInputs,
            params: &GenerationParams,
        ) -> Result<Vec<Vec<u32>>, StageError> {
            self.seen_params = Some(params.clone());
            if self.fail_at == FailAt::Generate {
                return Err(StageError::generate("CUDA out of memory"));
            }
            let prompt_len = inputs.sequence_lengths()?[0];
            // Continuation tokens encode the reply as byte offsets past the prompt
            let mut row: Vec<u32> = (0..prompt_len as u32).collect();
            row.extend(self.reply.bytes().map(|b| 1000 + b as u32));
            Ok(vec![row])
        }

        fn batch_decode(&self, sequences: &[Vec<u32>]) -> Result<Vec<String>, StageError> {
            if self.fail_at == FailAt::Decode {
                return Err(StageError::Decode {
                    reason: "invalid token id".into(),
                });
            }
            sequences
                .iter()
                .map(|row| {
                    let bytes: Vec<u8> = row.iter().map(|id| (id - 1000) as u8).collect();
                    String::from_utf8(bytes).map_err(|e| StageError::Decode {
                        reason: e.to_string(),
                    })
                })
                .collect()
        }

        fn move_to(&mut self, device: &DeviceSpec) -> Result<(), ModelError> {
            self.device = *device;
            Ok(())
        }
    }

    fn rewriter(model: ScriptedModel) -> (RePrompt<ScriptedModel>, RecordingReporter) {
        let reporter = RecordingReporter::default();
        let reprompt = RePrompt::new(model).with_reporter(reporter.clone());
        (reprompt, reporter)
    }

    #[test]
    fn test_well_formed_reply_is_sanitized() {
        let (mut reprompt, reporter) =
            rewriter(ScriptedModel::replying("<think>reasoning</think>\nA 'red' hat"));
        let result = reprompt.predict("a hat", "Rewrite:", 0.0, DeviceSpec::Cpu);
        assert_eq!(result, "A \"red\" hat");
        assert!(reporter.lines().is_empty());
    }

    #[test]
    fn test_single_marker_returns_original_prompt() {
        let (mut reprompt, reporter) =
            rewriter(ScriptedModel::replying("<think>reasoning never closed"));
        let result = reprompt.predict("a penguin", "Rewrite:", 0.0, DeviceSpec::Cpu);
        assert_eq!(result, "a penguin");
        assert_eq!(reporter.lines(), vec![FALLBACK_MESSAGE.to_string()]);
    }

    #[test]
    fn test_malformed_outcome_is_inspectable() {
        let (mut reprompt, _) = rewriter(ScriptedModel::replying("no markers"));
        let request = GenerationRequest::new("a penguin").on_device(DeviceSpec::Cpu);
        let outcome = reprompt.rewrite(&request);
        assert!(outcome.is_fallback());
        assert_eq!(
            outcome.error().map(StageError::kind),
            Some(FailureKind::MalformedOutput)
        );
        assert_eq!(outcome.into_text(), "a penguin");
    }

    #[test]
    fn test_every_stage_failure_falls_back_once() {
        for fail_at in [FailAt::Template, FailAt::Pack, FailAt::Generate, FailAt::Decode] {
            let (mut reprompt, reporter) = rewriter(ScriptedModel::failing_at(fail_at));
            let request = GenerationRequest::new("original prompt").on_device(DeviceSpec::Cpu);
            let outcome = reprompt.rewrite(&request);

            assert_eq!(outcome.error().map(StageError::kind), Some(FailureKind::Runtime));
            assert_eq!(outcome.into_text(), "original prompt");
            assert_eq!(reporter.lines().len(), 1);
        }
    }

    #[test]
    fn test_device_mismatch_falls_back_and_move_fixes_it() {
        let mut model = ScriptedModel::replying("<think>a</think>\nfixed");
        model.device = DeviceSpec::Cuda(0);
        let (mut reprompt, reporter) = rewriter(model);

        assert_eq!(
            reprompt.predict("raw", "Rewrite:", 0.0, DeviceSpec::Cpu),
            "raw"
        );
        assert_eq!(reporter.lines().len(), 1);

        let result = reprompt
            .to(DeviceSpec::Cpu)
            .unwrap()
            .predict("raw", "Rewrite:", 0.0, DeviceSpec::Cpu);
        assert_eq!(result, "fixed");
        assert_eq!(reporter.lines().len(), 1);
    }

    #[test]
    fn test_temperature_is_threaded_but_decoding_stays_greedy() {
        let (mut reprompt, _) = rewriter(ScriptedModel::replying("<think>a</think>b"));
        reprompt.predict("p", "s", 0.7, DeviceSpec::Cpu);

        let params = reprompt.model().seen_params.clone().unwrap();
        assert!((params.temperature - 0.7).abs() < f64::EPSILON);
        assert!(!params.do_sample);
        assert_eq!(params.max_new_tokens, 2048);
    }

    #[test]
    fn test_template_sees_instruction_and_prompt() {
        struct CapturingModel(ScriptedModel);

        impl PromptModel for CapturingModel {
            fn apply_chat_template(
                &self,
                messages: &[ConversationMessage],
                add_generation_prompt: bool,
            ) -> Result<String, StageError> {
                assert!(add_generation_prompt);
                assert_eq!(messages.len(), 1);
                self.0.apply_chat_template(messages, add_generation_prompt)
            }
            fn encode(
                &self,
                text: &str,
                vision: &VisionInputs,
                device: &DeviceSpec,
            ) -> Result<EncodedInputs, StageError> {
                assert_eq!(text, "<user>Rewrite:\na fox</user><assistant>");
                self.0.encode(text, vision, device)
            }
            fn generate(
                &mut self,
                inputs: &EncodedInputs,
                params: &GenerationParams,
            ) -> Result<Vec<Vec<u32>>, StageError> {
                self.0.generate(inputs, params)
            }
            fn batch_decode(&self, sequences: &[Vec<u32>]) -> Result<Vec<String>, StageError> {
                self.0.batch_decode(sequences)
            }
            fn move_to(&mut self, device: &DeviceSpec) -> Result<(), ModelError> {
                self.0.move_to(device)
            }
        }

        let model = CapturingModel(ScriptedModel::replying("<think>a</think>\na sly fox"));
        let mut reprompt = RePrompt::new(model).with_reporter(RecordingReporter::default());
        assert_eq!(
            reprompt.predict("a fox", "Rewrite:", 0.0, DeviceSpec::Cpu),
            "a sly fox"
        );
    }
}
