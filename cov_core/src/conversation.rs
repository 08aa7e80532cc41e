//! Multi-turn VLM conversation with timeouts, retries and usage accounting.

use crate::answer::strip_thinking;
use cov_env::{ChatTurn, EnvError, TokenUsage, VisionLanguageModel, VlmRequest, VlmResponse};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout and retry settings for model calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    /// Upper bound on a single call
    pub timeout: Duration,

    /// Total attempts for transient failures (at least 1)
    pub max_attempts: u32,

    /// Sleep before retry `n` is `backoff * n`
    pub backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// A conversation with one model: system prompt, opening context, and every
/// exchange so far.
///
/// Assistant replies are kept verbatim (reasoning included) so the model sees
/// its own prior actions; callers get the reply with the reasoning removed.
pub struct Conversation<V: VisionLanguageModel> {
    vlm: Arc<V>,
    system_prompt: String,
    turns: Vec<ChatTurn>,
    usage: TokenUsage,
    policy: CallPolicy,
}

impl<V: VisionLanguageModel> Conversation<V> {
    pub fn new(vlm: Arc<V>, system_prompt: impl Into<String>, policy: CallPolicy) -> Self {
        Self {
            vlm,
            system_prompt: system_prompt.into(),
            turns: Vec::new(),
            usage: TokenUsage::default(),
            policy,
        }
    }

    /// Appends a context turn that is sent with the next call.
    pub fn push_context(&mut self, turn: ChatTurn) {
        self.turns.push(turn);
    }

    /// Sends `turn` and returns the reply with any reasoning trace removed.
    ///
    /// On failure the conversation is left as it was before the call.
    pub async fn send(&mut self, turn: ChatTurn) -> Result<String, EnvError> {
        self.turns.push(turn);
        let request = VlmRequest::new(self.system_prompt.clone(), self.turns.clone());

        let response = match self.complete_with_retry(&request).await {
            Ok(response) => response,
            Err(err) => {
                self.turns.pop();
                return Err(err);
            }
        };

        self.usage += response.usage;
        debug!(
            "{} replied ({} tokens so far): {}",
            self.vlm.model_name(),
            self.usage.total_tokens,
            response.content
        );

        let reply = strip_thinking(&response.content).to_string();
        self.turns.push(ChatTurn::assistant(response.content));
        Ok(reply)
    }

    async fn complete_with_retry(&self, request: &VlmRequest) -> Result<VlmResponse, EnvError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = match tokio::time::timeout(self.policy.timeout, self.vlm.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(EnvError::Timeout(self.policy.timeout.as_millis() as u64)),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!("VLM call attempt {}/{} failed: {}", attempt, max_attempts, err);
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Accumulated token usage of all successful calls.
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cov_env::ChatRole;
    use std::sync::Mutex;

    struct FlakyVlm {
        failures: Mutex<Vec<EnvError>>,
        calls: Mutex<u32>,
        reply: String,
    }

    impl FlakyVlm {
        fn new(failures: Vec<EnvError>, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures),
                calls: Mutex::new(0),
                reply: reply.to_string(),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl VisionLanguageModel for FlakyVlm {
        async fn complete(&self, _request: &VlmRequest) -> Result<VlmResponse, EnvError> {
            *self.calls.lock().unwrap() += 1;
            if let Some(err) = self.failures.lock().unwrap().pop() {
                return Err(err);
            }
            Ok(VlmResponse {
                content: self.reply.clone(),
                usage: TokenUsage { prompt_tokens: 10, completion_tokens: 2, total_tokens: 12 },
            })
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    fn fast_policy() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_send_strips_thinking_and_keeps_history() {
        let vlm = FlakyVlm::new(vec![], "<think>look left</think>left-rotation+30");
        let mut conversation = Conversation::new(vlm, "system", fast_policy());
        conversation.push_context(ChatTurn::user("context"));

        let reply = conversation.send(ChatTurn::user("step 1")).await.unwrap();

        assert_eq!(reply, "left-rotation+30");
        assert_eq!(conversation.turns().len(), 3);
        assert_eq!(conversation.turns()[2].role, ChatRole::Assistant);
        assert!(conversation.turns()[2].text.contains("<think>"));
    }

    #[tokio::test]
    async fn test_usage_accumulates() {
        let vlm = FlakyVlm::new(vec![], "done+[x]");
        let mut conversation = Conversation::new(vlm, "system", fast_policy());

        conversation.send(ChatTurn::user("a")).await.unwrap();
        conversation.send(ChatTurn::user("b")).await.unwrap();

        assert_eq!(conversation.usage().total_tokens, 24);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let vlm = FlakyVlm::new(
            vec![EnvError::transport("reset"), EnvError::Timeout(10)],
            "forward-movement+1",
        );
        let mut conversation = Conversation::new(vlm.clone(), "system", fast_policy());

        assert!(conversation.send(ChatTurn::user("a")).await.is_ok());
        assert_eq!(vlm.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let vlm = FlakyVlm::new(vec![EnvError::AuthError("bad key".into())], "x");
        let mut conversation = Conversation::new(vlm.clone(), "system", fast_policy());

        let err = conversation.send(ChatTurn::user("a")).await.unwrap_err();

        assert!(matches!(err, EnvError::AuthError(_)));
        assert_eq!(vlm.calls(), 1);
        assert!(conversation.turns().is_empty());
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let failures = (0..5).map(|_| EnvError::transport("down")).collect();
        let vlm = FlakyVlm::new(failures, "x");
        let mut conversation = Conversation::new(vlm.clone(), "system", fast_policy());

        assert!(conversation.send(ChatTurn::user("a")).await.is_err());
        assert_eq!(vlm.calls(), 3);
    }
}
