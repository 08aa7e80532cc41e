//! Production implementation of VisionLanguageModel over an OpenAI-compatible API.

use crate::config::ModelConfig;
use crate::error::EnvError;
use crate::types::{ChatRole, ChatTurn, TokenUsage, VlmRequest, VlmResponse};
use crate::VisionLanguageModel;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Chat completion client for any `/chat/completions` endpoint.
///
/// Images are inlined as base64 data URLs, which every compatible provider
/// accepts.
pub struct OpenAiVlm {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiVlm {
    /// Creates a client for an explicit endpoint.
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EnvError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnvError::transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
        })
    }

    /// Creates a client from a model config, reading endpoint and key from
    /// the environment.
    pub fn from_config(config: &ModelConfig) -> Result<Self, EnvError> {
        let api_base = std::env::var(&config.api_base_env)
            .map_err(|_| EnvError::AuthError(format!("{} is not set", config.api_base_env)))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| EnvError::AuthError(format!("{} is not set", config.api_key_env)))?;

        Self::new(
            api_base,
            api_key,
            config.model_name.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    /// Builds the JSON request body.
    fn request_body(&self, request: &VlmRequest) -> Result<Value, EnvError> {
        let mut messages = vec![json!({
            "role": "system",
            "content": request.system_prompt,
        })];

        for turn in &request.turns {
            messages.push(encode_turn(turn)?);
        }

        Ok(json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
        }))
    }
}

fn encode_turn(turn: &ChatTurn) -> Result<Value, EnvError> {
    let role = match turn.role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    };

    let Some(image) = &turn.image else {
        return Ok(json!({ "role": role, "content": turn.text }));
    };

    Ok(json!({
        "role": role,
        "content": [
            { "type": "text", "text": turn.text },
            { "type": "image_url", "image_url": { "url": image_data_url(image)? } },
        ],
    }))
}

fn image_data_url(path: &Path) -> Result<String, EnvError> {
    let bytes = std::fs::read(path)
        .map_err(|e| EnvError::IoError(format!("{}: {e}", path.display())))?;
    let mime = match path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()) {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        _ => "image/png",
    };
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

/// Maps a non-success HTTP status to a transient or permanent error.
fn classify_status(status: StatusCode, body: &str) -> EnvError {
    let msg = format!("{status}: {}", body.chars().take(200).collect::<String>());
    match status.as_u16() {
        401 | 403 => EnvError::AuthError(msg),
        408 | 429 => EnvError::TransportError(msg),
        s if s >= 500 => EnvError::TransportError(msg),
        _ => EnvError::ProtocolError(msg),
    }
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

fn parse_completion(body: &str) -> Result<VlmResponse, EnvError> {
    let parsed: CompletionBody = serde_json::from_str(body)
        .map_err(|e| EnvError::protocol(format!("undecodable completion: {e}")))?;

    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| EnvError::protocol("completion has no message content"))?;

    Ok(VlmResponse {
        content,
        usage: parsed.usage.unwrap_or_default(),
    })
}

#[async_trait]
impl VisionLanguageModel for OpenAiVlm {
    async fn complete(&self, request: &VlmRequest) -> Result<VlmResponse, EnvError> {
        let body = self.request_body(request)?;
        debug!("POST {} ({} turns)", self.endpoint(), request.turns.len());

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EnvError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    EnvError::transport(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| EnvError::transport(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        parse_completion(&text)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn client() -> OpenAiVlm {
        OpenAiVlm::new("http://localhost:11434/v1/", "key", "qwen3-vl:8b", Duration::from_secs(5))
            .unwrap()
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        assert_eq!(client().endpoint(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn test_request_body_layout() {
        let mut file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        file.write_all(b"not really a png").unwrap();

        let request = VlmRequest::new(
            "you are a camera operator",
            vec![
                ChatTurn::user_with_image("view 0", file.path()),
                ChatTurn::assistant("forward-movement+1"),
            ],
        );
        let body = client().request_body(&request).unwrap();

        assert_eq!(body["model"], "qwen3-vl:8b");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"][0]["text"], "view 0");
        let url = body["messages"][1]["content"][1]["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
        assert_eq!(body["messages"][2]["role"], "assistant");
        assert_eq!(body["messages"][2]["content"], "forward-movement+1");
    }

    #[test]
    fn test_missing_image_is_io_error() {
        let request = VlmRequest::new("s", vec![ChatTurn::user_with_image("x", "/no/such/frame.png")]);
        let err = client().request_body(&request).unwrap_err();
        assert!(matches!(err, EnvError::IoError(_)));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(StatusCode::UNAUTHORIZED, ""), EnvError::AuthError(_)));
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_retryable());
    }

    #[test]
    fn test_parse_completion() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "done+[chair]"}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 4, "total_tokens": 104}
        }"#;
        let response = parse_completion(body).unwrap();

        assert_eq!(response.content, "done+[chair]");
        assert_eq!(response.usage.total_tokens, 104);
    }

    #[test]
    fn test_parse_completion_without_content() {
        let body = r#"{"choices": []}"#;
        assert!(matches!(parse_completion(body), Err(EnvError::ProtocolError(_))));
    }
}
