//! Prompt rewriting runtime for text-to-image pipelines
//!
//! A vision-language model rewrites a short user prompt into a richer one
//! before it reaches the diffusion model. The rewrite is best effort:
//! [`RePrompt::predict`] always returns usable text, falling back to the
//! caller's prompt when any stage fails.
//!
//! ```no_run
//! use reprompt_runtime::{DeviceMapping, DeviceSpec, RePrompt, DEFAULT_SYSTEM_PROMPT};
//!
//! let mut reprompt = RePrompt::load("ckpts/reprompt", DeviceMapping::Auto, true)?;
//! let rewritten = reprompt.predict("a cat on a sofa", DEFAULT_SYSTEM_PROMPT, 0.0, DeviceSpec::Cuda(0));
//! println!("{rewritten}");
//! # Ok::<(), reprompt_runtime::ModelError>(())
//! ```

pub mod config;
pub mod models;
pub mod reprompt;
pub mod topology;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigError, LogFormat};
pub use models::{ModelArtifacts, ModelHandle, OffloadSession};
pub use reprompt::{
    FallbackReporter, GenerationParams, GenerationRequest, PromptModel, RePrompt,
    RewriteOutcome, DEFAULT_SYSTEM_PROMPT, FALLBACK_MESSAGE,
};
pub use topology::{PipelineComponent, PipelineTopology, Placement, TopologyError, TopologyTarget};
pub use types::*;
