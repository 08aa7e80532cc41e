//! Dialogue Session - the bounded VLM interaction loop for one question.
//!
//! # State machine
//!
//! ```text
//!                     ┌────────────── frame is blank ───────────────┐
//!                     │                                             ▼
//!   prepare ──► ┌──────────┐  reply repeated N times   ┌──────────────────────┐
//!               │  Active  │ ────────────────────────► │  BreakingRepetition  │
//!               └──────────┘ ◄──────── next turn ───── └──────────────────────┘
//!                 │   │   ▲                             ┌──────────────────────┐
//!                 │   │   └────────── next turn ─────── │ RecoveringFromBlank  │
//!                 │   │                                 └──────────────────────┘
//!     reply has   │   │ turn budget spent
//!     "done"      ▼   ▼
//!        Answered(text)   Exhausted(reason)
//! ```
//!
//! Each turn is one frame capture and one history entry. A turn that breaks
//! a repetition makes a second VLM call with the corrective prompt, and that
//! reply becomes the turn's action. After `Answered` the renderer is not
//! touched again.

use crate::answer::{extract_answer, is_terminal, parse_selected_views, requests_overview};
use crate::blank::is_blank_file;
use crate::camera::{ApplyReport, CameraController, CameraError};
use crate::conversation::{CallPolicy, Conversation};
use crate::instruction::parse;
use crate::prompts;
use crate::viewpoint::ViewpointStore;
use cov_env::{ChatTurn, EnvError, SceneRenderer, TokenUsage, VisionLanguageModel};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Substring that exempts a reply from repetition counting.
const SWITCH_KEYWORD: &str = "switch";

/// Session tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hard cap on VLM round-trips per question
    pub max_turns: u32,

    /// Actions the model is asked to take before answering
    pub min_action_step: u32,

    /// Views the model may select up front
    pub max_views: usize,

    /// Identical replies in a row that trigger the corrective prompt
    pub repetition_limit: u32,

    /// Blank pixel fraction at which a frame is blank
    pub blank_threshold: f64,

    /// Per-call VLM timeout in seconds
    pub vlm_timeout_secs: u64,

    /// Attempts per VLM call for transient failures
    pub max_vlm_attempts: u32,

    /// Linear retry backoff unit in milliseconds
    pub retry_backoff_ms: u64,

    /// Attempts per frame when the renderer drops frames
    pub render_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: 65,
            min_action_step: 3,
            max_views: 5,
            repetition_limit: 10,
            blank_threshold: crate::blank::BLANK_THRESHOLD,
            vlm_timeout_secs: 120,
            max_vlm_attempts: 3,
            retry_backoff_ms: 500,
            render_attempts: 3,
        }
    }
}

impl SessionConfig {
    /// Timeout and retry policy for VLM calls.
    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(self.vlm_timeout_secs),
            max_attempts: self.max_vlm_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// Unique identifier for a dialogue session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a new random SessionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic SessionId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A question to answer about one scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
}

impl Question {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { id: id.into(), text: text.into() }
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SessionState {
    Active,
    /// This turn's frame was blank; the camera went back to the last viewpoint
    RecoveringFromBlank,
    /// This turn sends the corrective prompt instead of the step prompt
    BreakingRepetition,
    Answered(String),
    Exhausted(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Answered(_) | SessionState::Exhausted(_))
    }
}

/// Which prompt a turn sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Step,
    BlankRecovery,
    RepetitionBreak,
}

/// One entry of the append-only dialogue history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueTurn {
    /// 1-based turn number
    pub turn_index: u32,

    /// Frame sent with the prompt
    pub image: PathBuf,

    pub prompt: PromptKind,

    /// Reply with the reasoning trace removed
    pub action: String,

    /// True if the reply changed the camera or requested the overview
    pub applied: bool,
}

/// Result record for an answered question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question_id: String,
    pub answer: String,
    pub action_steps: u32,
    pub token_consumption: TokenUsage,
}

/// Reasons a question ends without an answer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Exceeded the turn budget of {turns} without an answer")]
    TurnBudgetExhausted { turns: u32 },

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("VLM error: {0}")]
    Vlm(#[from] EnvError),

    #[error("Cannot read frame {path}: {source}")]
    Frame {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl SessionError {
    /// Returns true if re-running the question could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Vlm(err) => err.is_retryable(),
            SessionError::Camera(CameraError::Renderer(err)) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Drives one question through view selection and the turn loop.
///
/// Owns the camera (and through it the renderer) for its whole lifetime;
/// dropping the session releases the renderer whether or not the question
/// was answered.
pub struct DialogueSession<R, V>
where
    R: SceneRenderer,
    V: VisionLanguageModel,
{
    id: SessionId,
    question: Question,
    camera: CameraController<R>,
    vlm: Arc<V>,
    config: SessionConfig,
    shots_dir: PathBuf,

    state: SessionState,
    turn: u32,
    repeat_count: u32,
    prev_action: Option<String>,
    overview_requested: bool,
    pending_notice: Option<String>,

    selected_views: Vec<usize>,
    overview_image: Option<PathBuf>,
    selection_usage: TokenUsage,
    chat_usage: TokenUsage,
    history: Vec<DialogueTurn>,
}

impl<R, V> DialogueSession<R, V>
where
    R: SceneRenderer,
    V: VisionLanguageModel,
{
    /// Creates a session; frames rendered during the dialogue go to `shots_dir`.
    pub fn new(
        question: Question,
        renderer: R,
        viewpoints: ViewpointStore,
        vlm: Arc<V>,
        config: SessionConfig,
        shots_dir: impl Into<PathBuf>,
    ) -> Self {
        let camera = CameraController::new(renderer, viewpoints).with_render_attempts(config.render_attempts);
        Self {
            id: SessionId::new(),
            question,
            camera,
            vlm,
            config,
            shots_dir: shots_dir.into(),
            state: SessionState::Active,
            turn: 0,
            repeat_count: 0,
            prev_action: None,
            overview_requested: false,
            pending_notice: None,
            selected_views: Vec::new(),
            overview_image: None,
            selection_usage: TokenUsage::default(),
            chat_usage: TokenUsage::default(),
            history: Vec::new(),
        }
    }

    /// Overrides the random session id.
    pub fn with_id(mut self, id: SessionId) -> Self {
        self.id = id;
        self
    }

    /// Runs the question to an answer or a failure.
    pub async fn run(&mut self) -> Result<QuestionResult, SessionError> {
        let span = info_span!("session", question_id = %self.question.id, session = %self.id);
        let outcome = self.drive().instrument(span).await;
        if let Err(err) = &outcome {
            self.state = SessionState::Exhausted(err.to_string());
        }
        outcome
    }

    async fn drive(&mut self) -> Result<QuestionResult, SessionError> {
        let mut chat = self.prepare().await?;

        for turn in 1..=self.config.max_turns {
            self.turn = turn;
            if let Some(answer) = self.play_turn(&mut chat).await? {
                let result = QuestionResult {
                    question_id: self.question.id.clone(),
                    answer: answer.clone(),
                    action_steps: turn,
                    token_consumption: self.token_usage(),
                };
                info!("✓ Answered after {} turns: {}", turn, answer);
                info!("Token usage: {:?}", result.token_consumption);
                self.state = SessionState::Answered(answer);
                return Ok(result);
            }
        }

        warn!("✗ No answer within {} turns", self.config.max_turns);
        Err(SessionError::TurnBudgetExhausted { turns: self.config.max_turns })
    }

    /// View selection, overview frame, start pose and the chat's opening context.
    async fn prepare(&mut self) -> Result<Conversation<V>, SessionError> {
        if self.camera.viewpoints().is_empty() {
            return Err(CameraError::EmptyStore.into());
        }

        self.selected_views = self.select_views().await?;

        let overview = self.camera.capture_overview(&self.shots_dir)?;
        let start = self.selected_views.first().copied().unwrap_or(0);
        self.camera.jump_to_viewpoint(start)?;

        let view_count = self.camera.viewpoints().len();
        let system_prompt = prompts::chat_system_prompt(
            &self.question.text,
            view_count,
            self.config.max_views,
            self.config.min_action_step,
        );
        let mut chat = Conversation::new(self.vlm.clone(), system_prompt, self.config.call_policy());
        for &view in &self.selected_views {
            if let Some(viewpoint) = self.camera.viewpoints().get(view) {
                chat.push_context(ChatTurn::user_with_image(
                    prompts::best_view_label(view),
                    viewpoint.image.clone(),
                ));
            }
        }
        chat.push_context(ChatTurn::user_with_image(prompts::OVERVIEW_LABEL, overview.clone()));

        self.overview_image = Some(overview);
        self.state = SessionState::Active;
        info!("Starting at viewpoint {} with {} selected views", start, self.selected_views.len());
        Ok(chat)
    }

    /// Asks the model for the most relevant recorded views.
    async fn select_views(&mut self) -> Result<Vec<usize>, SessionError> {
        let view_count = self.camera.viewpoints().len();
        let system_prompt =
            prompts::selection_system_prompt(&self.question.text, view_count, self.config.max_views);
        let mut selection = Conversation::new(self.vlm.clone(), system_prompt, self.config.call_policy());
        for viewpoint in self.camera.viewpoints().iter() {
            selection.push_context(ChatTurn::user_with_image(
                prompts::selection_label(viewpoint.index),
                viewpoint.image.clone(),
            ));
        }

        let reply = selection.send(ChatTurn::user(prompts::SELECTION_QUERY)).await?;
        self.selection_usage = selection.usage();

        let selected = parse_selected_views(&reply, self.config.max_views, view_count);
        if selected.is_empty() {
            warn!("Malformed view selection reply: {}", reply);
        } else {
            info!("Selected views: {:?}", selected);
        }
        Ok(selected)
    }

    /// One round-trip. Returns the answer if the reply was terminal.
    async fn play_turn(&mut self, chat: &mut Conversation<V>) -> Result<Option<String>, SessionError> {
        let (image, prompt) = self.observe()?;
        let text = self.prompt_text(prompt);

        let mut prompt = prompt;
        let mut reply = chat.send(ChatTurn::user_with_image(text, image.clone())).await?;
        self.chat_usage = chat.usage();
        info!("Turn {}: {}", self.turn, reply.trim());

        if !is_terminal(&reply) && self.track_repetition(&reply) {
            self.state = SessionState::BreakingRepetition;
            warn!("Action repeated {} times, sending corrective prompt", self.repeat_count);
            prompt = PromptKind::RepetitionBreak;
            reply = chat
                .send(ChatTurn::user_with_image(prompts::REPETITION_PROMPT, image.clone()))
                .await?;
            self.chat_usage = chat.usage();
            info!("Turn {} (corrective): {}", self.turn, reply.trim());
            self.repeat_count = 0;
            self.prev_action = Some(reply.clone());
        }

        if is_terminal(&reply) {
            self.record(image, prompt, &reply, false);
            return Ok(Some(extract_answer(&reply)));
        }

        let applied = self.act(&reply)?;
        self.record(image, prompt, &reply, applied);
        Ok(None)
    }

    /// Captures this turn's frame and decides which prompt goes with it.
    fn observe(&mut self) -> Result<(PathBuf, PromptKind), SessionError> {
        let frame = match (std::mem::take(&mut self.overview_requested), &self.overview_image) {
            (true, Some(overview)) => overview.clone(),
            _ => self.camera.capture_frame(&self.shots_dir, None)?,
        };

        if self.frame_is_blank(&frame)? {
            self.state = SessionState::RecoveringFromBlank;
            warn!("Blank view at turn {}, switching back to the last viewpoint", self.turn);
            self.camera.restore_last_viewpoint()?;
            let frame = self.camera.capture_frame(&self.shots_dir, None)?;
            return Ok((frame, PromptKind::BlankRecovery));
        }

        self.state = SessionState::Active;
        Ok((frame, PromptKind::Step))
    }

    fn frame_is_blank(&self, frame: &Path) -> Result<bool, SessionError> {
        is_blank_file(frame, self.config.blank_threshold).map_err(|source| SessionError::Frame {
            path: frame.to_path_buf(),
            source,
        })
    }

    fn prompt_text(&mut self, prompt: PromptKind) -> String {
        let body = match prompt {
            PromptKind::Step => prompts::step_prompt(self.turn, self.config.min_action_step),
            PromptKind::BlankRecovery => prompts::BLANK_VIEW_PROMPT.to_string(),
            PromptKind::RepetitionBreak => prompts::REPETITION_PROMPT.to_string(),
        };
        match self.pending_notice.take() {
            Some(notice) => format!("{notice} {body}"),
            None => body,
        }
    }

    /// Tracks the run of identical non-switch replies, counting its first
    /// reply. Returns true once the run reaches the repetition limit.
    fn track_repetition(&mut self, reply: &str) -> bool {
        self.repeat_count = if reply.contains(SWITCH_KEYWORD) {
            0
        } else if self.prev_action.as_deref() == Some(reply) {
            self.repeat_count + 1
        } else {
            1
        };
        self.prev_action = Some(reply.to_string());
        self.repeat_count >= self.config.repetition_limit
    }

    /// Applies a non-terminal reply. Returns true if it did anything.
    fn act(&mut self, reply: &str) -> Result<bool, SessionError> {
        if requests_overview(reply) {
            info!("Overview requested for next turn");
            self.overview_requested = true;
            return Ok(true);
        }

        let instructions = parse(reply);
        if instructions.is_empty() {
            warn!("Malformed response at turn {}: no instructions found", self.turn);
            return Ok(false);
        }

        let report = self.camera.apply(&instructions)?;
        self.queue_notice(&report);
        Ok(report.applied > 0)
    }

    fn queue_notice(&mut self, report: &ApplyReport) {
        let mut notices = Vec::new();
        if !report.rejected_targets.is_empty() {
            notices.push(prompts::invalid_view_notice(
                &report.rejected_targets,
                self.camera.viewpoints().len(),
            ));
        }
        if report.restore_skipped {
            notices.push(prompts::NO_VIEW_TO_RESTORE_NOTICE.to_string());
        }
        if !notices.is_empty() {
            self.pending_notice = Some(notices.join(" "));
        }
    }

    fn record(&mut self, image: PathBuf, prompt: PromptKind, reply: &str, applied: bool) {
        self.history.push(DialogueTurn {
            turn_index: self.turn,
            image,
            prompt,
            action: reply.to_string(),
            applied,
        });
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn question(&self) -> &Question {
        &self.question
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Turns played so far.
    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn history(&self) -> &[DialogueTurn] {
        &self.history
    }

    pub fn selected_views(&self) -> &[usize] {
        &self.selected_views
    }

    pub fn overview_image(&self) -> Option<&Path> {
        self.overview_image.as_deref()
    }

    pub fn camera(&self) -> &CameraController<R> {
        &self.camera
    }

    /// Selection plus dialogue token usage.
    pub fn token_usage(&self) -> TokenUsage {
        let mut usage = self.selection_usage;
        usage += self.chat_usage;
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.max_turns, 65);
        assert_eq!(config.repetition_limit, 10);
        assert_eq!(config.call_policy().timeout, Duration::from_secs(120));
        assert_eq!(config.call_policy().backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_config_fills_missing_fields() {
        let config: SessionConfig = serde_json::from_str(r#"{"min_action_step": 5}"#).unwrap();
        assert_eq!(config.min_action_step, 5);
        assert_eq!(config.max_views, 5);
    }

    #[test]
    fn test_session_id_from_seed_is_stable() {
        assert_eq!(SessionId::from_seed(7), SessionId::from_seed(7));
        assert_ne!(SessionId::from_seed(7), SessionId::from_seed(8));
    }

    #[test]
    fn test_error_retryability() {
        assert!(SessionError::Vlm(EnvError::Timeout(100)).is_retryable());
        assert!(!SessionError::Vlm(EnvError::AuthError("no".into())).is_retryable());
        assert!(!SessionError::TurnBudgetExhausted { turns: 65 }.is_retryable());
        assert!(SessionError::Camera(CameraError::Renderer(EnvError::FrameDropped("x".into()))).is_retryable());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&SessionState::Answered("chair".into())).unwrap();
        assert_eq!(json, r#"{"state":"answered","detail":"chair"}"#);
        assert!(SessionState::Exhausted("x".into()).is_terminal());
        assert!(!SessionState::RecoveringFromBlank.is_terminal());
    }
}
