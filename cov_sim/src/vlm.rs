//! Scripted vision-language model for deterministic dialogue tests.

use async_trait::async_trait;
use cov_core::prompts::SELECTION_QUERY;
use cov_env::{EnvError, TokenUsage, VisionLanguageModel, VlmRequest, VlmResponse};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Token usage reported for every scripted reply.
pub const SCRIPTED_USAGE: TokenUsage = TokenUsage {
    prompt_tokens: 100,
    completion_tokens: 10,
    total_tokens: 110,
};

#[derive(Debug, Default)]
struct ScriptState {
    replies: VecDeque<String>,
    last_reply: Option<String>,
    cycle: Vec<String>,
    cycle_pos: usize,
    failures: VecDeque<EnvError>,
    requests: Vec<VlmRequest>,
    calls: u64,
}

/// A `VisionLanguageModel` that plays back a script.
///
/// Dialogue replies are consumed in order; once the script runs out the
/// last reply repeats, or the cycle (if set) plays round-robin. The view
/// selection request is answered separately. Injected failures are returned
/// before any reply.
#[derive(Debug)]
pub struct ScriptedVlm {
    selection_reply: String,
    state: Mutex<ScriptState>,
}

impl ScriptedVlm {
    /// Creates a VLM replying with `replies` in order.
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            selection_reply: "Selected views: [0]".to_string(),
            state: Mutex::new(ScriptState {
                replies: replies.into_iter().map(Into::into).collect(),
                ..Default::default()
            }),
        }
    }

    /// Creates a VLM replying round-robin from `replies` forever.
    pub fn cycling<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        let vlm = Self::new(Vec::<String>::new());
        vlm.state.lock().unwrap().cycle = replies.into_iter().map(Into::into).collect();
        vlm
    }

    /// Reply to the view selection request.
    pub fn with_selection(mut self, reply: impl Into<String>) -> Self {
        self.selection_reply = reply.into();
        self
    }

    /// Fails the next calls with the given errors, in order.
    pub fn with_failures(self, failures: Vec<EnvError>) -> Self {
        self.state.lock().unwrap().failures = failures.into();
        self
    }

    /// Every call so far, selection and failed calls included.
    pub fn calls(&self) -> u64 {
        self.state.lock().unwrap().calls
    }

    /// Requests that received a reply.
    pub fn requests(&self) -> Vec<VlmRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Dialogue requests only (view selection excluded).
    pub fn dialogue_requests(&self) -> Vec<VlmRequest> {
        self.requests()
            .into_iter()
            .filter(|r| !is_selection(r))
            .collect()
    }

    /// Final user prompt of every dialogue request.
    pub fn dialogue_prompts(&self) -> Vec<String> {
        self.dialogue_requests()
            .iter()
            .filter_map(|r| r.last_user_text().map(str::to_string))
            .collect()
    }

    fn next_reply(state: &mut ScriptState) -> String {
        if let Some(reply) = state.replies.pop_front() {
            state.last_reply = Some(reply.clone());
            return reply;
        }
        if !state.cycle.is_empty() {
            let reply = state.cycle[state.cycle_pos % state.cycle.len()].clone();
            state.cycle_pos += 1;
            return reply;
        }
        state.last_reply.clone().unwrap_or_default()
    }
}

fn is_selection(request: &VlmRequest) -> bool {
    request.last_user_text() == Some(SELECTION_QUERY)
}

#[async_trait]
impl VisionLanguageModel for ScriptedVlm {
    async fn complete(&self, request: &VlmRequest) -> Result<VlmResponse, EnvError> {
        // Suspend like a remote call so concurrent drivers interleave
        tokio::task::yield_now().await;

        let mut state = self.state.lock().unwrap();
        state.calls += 1;

        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        let content = if is_selection(request) {
            self.selection_reply.clone()
        } else {
            Self::next_reply(&mut state)
        };
        state.requests.push(request.clone());

        Ok(VlmResponse {
            content,
            usage: SCRIPTED_USAGE,
        })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
