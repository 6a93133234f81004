//! Configuration management for the prompt rewriter
//!
//! Settings come from a TOML file or from environment variables layered over
//! defaults, and are checked by [`Config::validate`] before a model is loaded.

use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use thiserror::Error;

use crate::reprompt::{GenerationParams, GenerationRequest, DEFAULT_SYSTEM_PROMPT};
use crate::topology::PipelineTopology;
use crate::types::{DeviceMapping, DeviceSpec};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Environment variable error: {message}")]
    EnvError { message: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Rewriting model location and residency
    pub model: ModelConfig,
    /// Per-request defaults and decoding parameters
    pub generation: GenerationConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Device placement for pipeline components (optional)
    pub topology: Option<PipelineTopology>,
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Local directory, or hub repository id with the `hub` feature
    pub model_path: PathBuf,
    /// `auto`, `none`, or an explicit device
    pub device_map: DeviceMapping,
    /// Keep weights on the host and move them in per call
    pub enable_offloading: bool,
    /// Weight dtype override (`f32`, `f16`, `bf16`)
    pub dtype: Option<String>,
}

impl ModelConfig {
    /// Parsed dtype override; `None` when unset or invalid.
    pub fn dtype(&self) -> Option<DType> {
        self.dtype.as_deref().and_then(|d| parse_dtype(d).ok())
    }
}

/// Generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Instruction prepended to every prompt
    pub system_prompt: String,
    /// Device the inputs are packed onto
    pub device: DeviceSpec,
    #[serde(flatten)]
    pub params: GenerationParams,
}

impl GenerationConfig {
    /// A request for `prompt` carrying the configured defaults
    pub fn request(&self, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest::new(prompt)
            .with_system_instruction(self.system_prompt.clone())
            .with_temperature(self.params.temperature)
            .on_device(self.device)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("./ckpts/reprompt"),
            device_map: DeviceMapping::Auto,
            enable_offloading: true,
            dtype: None,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            device: DeviceSpec::default(),
            params: GenerationParams::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from environment variables and defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = env::var("REPROMPT_MODEL_PATH") {
            config.model.model_path = PathBuf::from(path);
        }

        if let Ok(device_map) = env::var("REPROMPT_DEVICE_MAP") {
            config.model.device_map =
                device_map.parse().map_err(|e| ConfigError::InvalidValue {
                    key: "REPROMPT_DEVICE_MAP".to_string(),
                    reason: format!("{}", e),
                })?;
        }

        if let Ok(flag) = env::var("REPROMPT_ENABLE_OFFLOADING") {
            config.model.enable_offloading = parse_flag("REPROMPT_ENABLE_OFFLOADING", &flag)?;
        }

        if let Ok(dtype) = env::var("REPROMPT_DTYPE") {
            config.model.dtype = Some(dtype);
        }

        if let Ok(device) = env::var("REPROMPT_DEVICE") {
            config.generation.device = device.parse().map_err(|e| ConfigError::InvalidValue {
                key: "REPROMPT_DEVICE".to_string(),
                reason: format!("{}", e),
            })?;
        }

        if let Ok(prompt) = env::var("REPROMPT_SYSTEM_PROMPT") {
            config.generation.system_prompt = prompt;
        }

        if let Ok(tokens) = env::var("REPROMPT_MAX_NEW_TOKENS") {
            config.generation.params.max_new_tokens =
                tokens.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "REPROMPT_MAX_NEW_TOKENS".to_string(),
                    reason: "Must be a positive integer".to_string(),
                })?;
        }

        if let Ok(log_level) = env::var("LOG_LEVEL") {
            config.logging.level = log_level;
        }

        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.model_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "model.model_path".to_string(),
            });
        }

        if let Some(dtype) = &self.model.dtype {
            parse_dtype(dtype)?;
        }

        let params = &self.generation.params;
        if params.max_new_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                key: "generation.max_new_tokens".to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        if params.temperature.is_nan() || params.temperature < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "generation.temperature".to_string(),
                reason: "Must be >= 0".to_string(),
            });
        }

        if params.top_p.is_nan() || params.top_p <= 0.0 || params.top_p > 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "generation.top_p".to_string(),
                reason: "Must be in (0, 1]".to_string(),
            });
        }

        if params.top_k == 0 {
            return Err(ConfigError::InvalidValue {
                key: "generation.top_k".to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        // Validate log level
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "logging.level".to_string(),
                reason: format!("Must be one of: {}", valid_levels.join(", ")),
            });
        }

        Ok(())
    }
}

/// Parse a weight dtype name.
pub fn parse_dtype(name: &str) -> Result<DType, ConfigError> {
    match name.to_ascii_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => Err(ConfigError::InvalidValue {
            key: "model.dtype".to_string(),
            reason: format!("Unsupported dtype '{}'; expected f32, f16 or bf16", other),
        }),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("Expected a boolean, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::PipelineComponent;
    use serial_test::serial;
    use std::env;
    use tempfile::NamedTempFile;

    const ENV_KEYS: [&str; 8] = [
        "REPROMPT_MODEL_PATH",
        "REPROMPT_DEVICE_MAP",
        "REPROMPT_ENABLE_OFFLOADING",
        "REPROMPT_DTYPE",
        "REPROMPT_DEVICE",
        "REPROMPT_SYSTEM_PROMPT",
        "REPROMPT_MAX_NEW_TOKENS",
        "LOG_LEVEL",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.model.enable_offloading);
        assert_eq!(config.model.device_map, DeviceMapping::Auto);
        assert_eq!(config.generation.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(config.generation.params.max_new_tokens, 2048);
        assert!(!config.generation.params.do_sample);
        assert!(config.topology.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        clear_env();
        env::set_var("REPROMPT_MODEL_PATH", "/models/reprompt");
        env::set_var("REPROMPT_DEVICE_MAP", "cuda:1");
        env::set_var("REPROMPT_ENABLE_OFFLOADING", "false");
        env::set_var("REPROMPT_DEVICE", "cpu");
        env::set_var("REPROMPT_MAX_NEW_TOKENS", "256");
        env::set_var("LOG_LEVEL", "debug");

        let config = Config::from_env().unwrap();
        assert_eq!(config.model.model_path, PathBuf::from("/models/reprompt"));
        assert_eq!(
            config.model.device_map,
            DeviceMapping::Device(DeviceSpec::Cuda(1))
        );
        assert!(!config.model.enable_offloading);
        assert_eq!(config.generation.device, DeviceSpec::Cpu);
        assert_eq!(config.generation.params.max_new_tokens, 256);
        assert_eq!(config.logging.level, "debug");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_from_env_invalid_flag() {
        clear_env();
        env::set_var("REPROMPT_ENABLE_OFFLOADING", "sometimes");

        let result = Config::from_env();
        if let Err(ConfigError::InvalidValue { key, .. }) = result {
            assert_eq!(key, "REPROMPT_ENABLE_OFFLOADING");
        } else {
            panic!("Expected InvalidValue error");
        }

        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_from_env_invalid_device() {
        clear_env();
        env::set_var("REPROMPT_DEVICE", "tpu:0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue { .. })
        ));
        clear_env();
    }

    #[test]
    fn test_config_from_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"
            [model]
            model_path = "ckpts/reprompt"
            device_map = "none"
            enable_offloading = false
            dtype = "bf16"

            [generation]
            device = "cuda:0"
            max_new_tokens = 512
            temperature = 0.7

            [logging]
            level = "warn"
            format = "json"

            [topology]
            text_encoder = "cuda:0"
            text_encoder_2 = "cuda:0"
            vae = "cuda:1"
            "#,
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.model.device_map, DeviceMapping::None);
        assert_eq!(config.model.dtype(), Some(DType::BF16));
        assert_eq!(config.generation.params.max_new_tokens, 512);
        assert_eq!(config.generation.params.top_k, 5);
        assert_eq!(config.generation.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(config.logging.format, LogFormat::Json);

        assert!(config.validate().is_ok());

        let topology = config.topology.as_ref().unwrap();
        assert_eq!(
            topology.device_for(PipelineComponent::Vae),
            Some(DeviceSpec::Cuda(1))
        );
        assert_eq!(
            topology.device_for(PipelineComponent::TextEncoder2),
            Some(DeviceSpec::Cuda(0))
        );
    }

    #[test]
    fn test_config_from_missing_file() {
        assert!(matches!(
            Config::from_file("/nonexistent/reprompt.toml"),
            Err(ConfigError::IoError { .. })
        ));
    }

    #[test]
    fn test_invalid_dtype() {
        let mut config = Config::default();
        config.model.dtype = Some("int4".to_string());
        assert!(config.model.dtype().is_none());
        if let Err(ConfigError::InvalidValue { key, .. }) = config.validate() {
            assert_eq!(key, "model.dtype");
        } else {
            panic!("Expected InvalidValue error");
        }
    }

    #[test]
    fn test_invalid_generation_params() {
        let mut config = Config::default();
        config.generation.params.max_new_tokens = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.generation.params.top_p = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.generation.params.temperature = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_device_matches_load_placement() {
        let config = Config::default();
        assert_eq!(config.generation.device, DeviceMapping::Auto.resolve());
        assert_eq!(config.generation.device, DeviceSpec::best_available());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_request_carries_defaults() {
        let mut config = GenerationConfig::default();
        config.device = DeviceSpec::Cpu;
        config.params.temperature = 0.3;

        let request = config.request("a cat");
        assert_eq!(request.prompt, "a cat");
        assert_eq!(request.system_instruction, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(request.temperature, 0.3);
        assert_eq!(request.device, DeviceSpec::Cpu);
    }
}
