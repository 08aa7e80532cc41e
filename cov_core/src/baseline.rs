//! Baseline agent: every recorded view at once, one question, one answer.

use crate::answer::extract_answer;
use crate::conversation::Conversation;
use crate::prompts;
use crate::session::{Question, QuestionResult, SessionConfig, SessionError};
use crate::viewpoint::ViewpointStore;
use cov_env::{ChatTurn, VisionLanguageModel};
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

/// Answers `question` from all viewpoint images without moving a camera.
///
/// The result always reports zero action steps.
pub async fn run_baseline<V: VisionLanguageModel>(
    vlm: Arc<V>,
    question: &Question,
    viewpoints: &ViewpointStore,
    config: &SessionConfig,
) -> Result<QuestionResult, SessionError> {
    let span = info_span!("baseline", question_id = %question.id);
    async move {
        let mut conversation = Conversation::new(
            vlm,
            prompts::baseline_system_prompt(&question.text),
            config.call_policy(),
        );
        for viewpoint in viewpoints.iter() {
            conversation.push_context(ChatTurn::user_with_image(
                prompts::selection_label(viewpoint.index),
                viewpoint.image.clone(),
            ));
        }

        let reply = conversation.send(ChatTurn::user(prompts::BASELINE_QUERY)).await?;
        let answer = extract_answer(&reply);
        info!("✓ Baseline answer from {} views: {}", viewpoints.len(), answer);

        Ok(QuestionResult {
            question_id: question.id.clone(),
            answer,
            action_steps: 0,
            token_consumption: conversation.usage(),
        })
    }
    .instrument(span)
    .await
}
