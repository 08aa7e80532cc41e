//! Vision-language model abstraction.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{VlmRequest, VlmResponse};

/// A chat completion endpoint that accepts interleaved text and images.
///
/// # Implementations
///
/// - **Production**: `OpenAiVlm` - any OpenAI-compatible `/chat/completions` API
/// - **Simulation**: `cov_sim::ScriptedVlm` - replays a fixed script
///
/// Calls are plain request/response: no streaming and no partial results.
/// The caller owns timeouts and retries.
#[async_trait]
pub trait VisionLanguageModel: Send + Sync + 'static {
    /// Sends the whole conversation and returns the model's reply.
    ///
    /// # Returns
    /// * `Ok(response)` - Raw content (thinking segment included) and usage
    /// * `Err(e)` with `e.is_retryable()` - Transient failure, retry with backoff
    /// * `Err(e)` otherwise - Permanent failure, give up on the question
    async fn complete(&self, request: &VlmRequest) -> Result<VlmResponse, EnvError>;
    
    /// Returns the model identifier (for logging and output paths).
    fn model_name(&self) -> &str;
}
