//! Model endpoint configuration.

use serde::{Deserialize, Serialize};

/// Connection settings for an OpenAI-compatible model endpoint.
///
/// Endpoint and key are never stored directly; they are read from the named
/// environment variables when the client is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier sent with every request
    pub model_name: String,

    /// Environment variable holding the API base URL
    pub api_base_env: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

impl ModelConfig {
    /// Creates a config with the default timeout.
    pub fn new(model_name: &str, api_base_env: &str, api_key_env: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            api_base_env: api_base_env.to_string(),
            api_key_env: api_key_env.to_string(),
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Model name made safe for use as a single path component.
    ///
    /// `google/gemini-2.5-flash` becomes `gemini-2.5-flash`,
    /// `qwen3-vl:8b` becomes `qwen3-vl-8b`.
    pub fn path_safe_name(&self) -> String {
        self.model_name
            .rsplit('/')
            .next()
            .unwrap_or(&self.model_name)
            .replace(':', "-")
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelPreset::QwenVlFlash.config()
    }
}

/// Known model endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPreset {
    QwenVlFlash,
    GeminiFlash,
    GeminiFlashLite,
    Gpt4oMini,
    Gemma,
    Qwen8b,
    Qwen32b,
}

impl ModelPreset {
    /// Returns all presets.
    pub fn all() -> Vec<ModelPreset> {
        vec![
            ModelPreset::QwenVlFlash,
            ModelPreset::GeminiFlash,
            ModelPreset::GeminiFlashLite,
            ModelPreset::Gpt4oMini,
            ModelPreset::Gemma,
            ModelPreset::Qwen8b,
            ModelPreset::Qwen32b,
        ]
    }

    /// Returns the preset's short name.
    pub fn name(&self) -> &'static str {
        match self {
            ModelPreset::QwenVlFlash => "qwen",
            ModelPreset::GeminiFlash => "gemini",
            ModelPreset::GeminiFlashLite => "gemini_lite",
            ModelPreset::Gpt4oMini => "gpt",
            ModelPreset::Gemma => "gemma",
            ModelPreset::Qwen8b => "qwen8b",
            ModelPreset::Qwen32b => "qwen32b",
        }
    }

    /// Returns the endpoint configuration.
    pub fn config(&self) -> ModelConfig {
        match self {
            ModelPreset::QwenVlFlash => {
                ModelConfig::new("qwen3-vl-flash", "DASHSCOPE_API_BASE", "DASHSCOPE_API_KEY")
            }
            ModelPreset::GeminiFlash => {
                ModelConfig::new("google/gemini-2.5-flash", "OPENROUTER_API_BASE", "OPENROUTER_API_KEY")
            }
            ModelPreset::GeminiFlashLite => ModelConfig::new(
                "google/gemini-2.5-flash-lite",
                "OPENROUTER_API_BASE",
                "OPENROUTER_API_KEY",
            ),
            ModelPreset::Gpt4oMini => {
                ModelConfig::new("openai/gpt-4o-mini", "OPENROUTER_API_BASE", "OPENROUTER_API_KEY")
            }
            ModelPreset::Gemma => ModelConfig::new("gemma3:latest", "OLLAMA_API_BASE", "OLLAMA_API_KEY"),
            ModelPreset::Qwen8b => ModelConfig::new("qwen3-vl:8b", "OLLAMA_API_BASE", "OLLAMA_API_KEY"),
            ModelPreset::Qwen32b => {
                ModelConfig::new("qwen3-vl:32b-thinking", "OLLAMA_API_BASE", "OLLAMA_API_KEY")
            }
        }
    }
}

impl std::fmt::Display for ModelPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ModelPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qwen" | "qwen-flash" => Ok(ModelPreset::QwenVlFlash),
            "gemini" => Ok(ModelPreset::GeminiFlash),
            "gemini_lite" | "gemini-lite" => Ok(ModelPreset::GeminiFlashLite),
            "gpt" | "gpt-4o-mini" => Ok(ModelPreset::Gpt4oMini),
            "gemma" => Ok(ModelPreset::Gemma),
            "qwen8b" => Ok(ModelPreset::Qwen8b),
            "qwen32b" => Ok(ModelPreset::Qwen32b),
            _ => Err(format!("Unknown model preset: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_safe_name() {
        assert_eq!(ModelPreset::GeminiFlash.config().path_safe_name(), "gemini-2.5-flash");
        assert_eq!(ModelPreset::Qwen8b.config().path_safe_name(), "qwen3-vl-8b");
        assert_eq!(ModelPreset::QwenVlFlash.config().path_safe_name(), "qwen3-vl-flash");
    }

    #[test]
    fn test_preset_names_parse_back() {
        for preset in ModelPreset::all() {
            assert_eq!(preset.name().parse::<ModelPreset>(), Ok(preset));
        }
        assert!("llama".parse::<ModelPreset>().is_err());
    }

    #[test]
    fn test_timeout_defaults_when_missing() {
        let json = r#"{"model_name":"m","api_base_env":"B","api_key_env":"K"}"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.timeout_secs, 120);
    }
}
