//! Prompt rewriting
//!
//! A request flows through [`GenerationInvoker`] (template, pack, generate,
//! trim, decode), then [`sanitize`] (marker extraction and quote
//! normalization). [`RePrompt`] wraps both and never fails: any stage error
//! yields the caller's original prompt.

pub mod generation;
pub mod guard;
pub mod sanitize;

pub use generation::{
    ContentPart, ConversationMessage, EncodedInputs, GenerationInvoker, GenerationParams,
    GenerationRequest, MessageRole, PromptModel, VisionInputs, DEFAULT_MAX_NEW_TOKENS,
    DEFAULT_SYSTEM_PROMPT,
};
pub use guard::{FallbackReporter, RePrompt, RewriteOutcome, StderrReporter, FALLBACK_MESSAGE};
pub use sanitize::{normalize_quotes, sanitize, BOUNDARY_MARKER};
