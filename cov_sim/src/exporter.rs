//! JSON exporter for dialogue histories.
//!
//! Writes one `history.json` per question for the external report viewer.

use cov_core::{DialogueSession, DialogueTurn, QuestionResult, SessionError, SessionState};
use cov_env::{SceneRenderer, TokenUsage, VisionLanguageModel};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Everything the report viewer needs about one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryExport {
    pub question_id: String,
    pub question: String,
    pub session_id: String,

    /// Reference answer, when the question file has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ground_truth: Option<String>,

    pub selected_views: Vec<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub overview: Option<PathBuf>,

    pub turns: Vec<DialogueTurn>,

    /// Final session state
    pub state: SessionState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    pub token_usage: TokenUsage,
}

impl HistoryExport {
    /// Captures a finished session and its outcome.
    pub fn from_session<R, V>(
        session: &DialogueSession<R, V>,
        outcome: &Result<QuestionResult, SessionError>,
    ) -> Self
    where
        R: SceneRenderer,
        V: VisionLanguageModel,
    {
        let (answer, failure_reason) = match outcome {
            Ok(result) => (Some(result.answer.clone()), None),
            Err(err) => (None, Some(err.to_string())),
        };

        Self {
            question_id: session.question().id.clone(),
            question: session.question().text.clone(),
            session_id: session.id().to_string(),
            ground_truth: None,
            selected_views: session.selected_views().to_vec(),
            overview: session.overview_image().map(Path::to_path_buf),
            turns: session.history().to_vec(),
            state: session.state().clone(),
            answer,
            failure_reason,
            token_usage: session.token_usage(),
        }
    }

    pub fn with_ground_truth(mut self, answer: Option<String>) -> Self {
        self.ground_truth = answer;
        self
    }

    /// Writes to a JSON file, creating parent directories.
    pub fn write_to_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    /// Reads an export back.
    pub fn read_from_file(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
