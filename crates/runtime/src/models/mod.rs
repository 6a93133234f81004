//! Loading and running the rewriting model
//!
//! - [`ModelArtifacts`]: locates config, tokenizer and weight shards
//! - [`ChatTemplate`]: renders conversations with the model's Jinja template
//! - [`ModelHandle`]: owns the loaded model and implements
//!   [`PromptModel`](crate::reprompt::PromptModel)
//! - [`OffloadSession`]: keeps weights on the host between calls

pub mod artifacts;
pub mod lifecycle;
pub mod offload;
pub mod qwen;
pub mod template;

pub use artifacts::ModelArtifacts;
pub use lifecycle::{ModelHandle, Residency, ResidencyPlan};
pub use offload::OffloadSession;
pub use qwen::{load_text_config, QwenModel};
pub use template::ChatTemplate;
