//! Batch driver: runs a question file through the agent, one fresh renderer
//! per question, with resume and sharding.
//!
//! # Output layout
//!
//! ```text
//! <output>/<model>/<agent>[/<min_action_step>]/
//! ├── <agent>-results.json                     rewritten after every answer
//! ├── <agent>-results.shard<i>of<n>.json       same, one per shard when n > 1
//! └── <episode>/<question_id>/
//!     ├── shots/                               frames rendered during the dialogue
//!     └── history.json
//! ```
//!
//! The `min_action_step` level only exists for the `cov` agent. Shards of
//! one run share the directory but never a results file, so they can run
//! as concurrent processes.

use crate::exporter::HistoryExport;
use cov_core::{
    run_baseline, DatasetFamily, DialogueSession, Question, QuestionResult, SessionConfig, SessionError,
    ViewpointError, ViewpointStore,
};
use cov_env::{EnvError, ModelConfig, ModelPreset, SceneLoader, VisionLanguageModel};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors that stop a batch, or a single question within it.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown model preset: {0}")]
    UnknownModel(String),

    #[error("Shard {index} out of range for {count} shards")]
    InvalidShard { index: usize, count: usize },

    #[error("Viewpoint error: {0}")]
    Viewpoints(#[from] ViewpointError),

    #[error("Scene error: {0}")]
    Scene(#[from] EnvError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Agent variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// View selection plus the camera dialogue
    #[default]
    Cov,
    /// All views at once, no camera
    Baseline,
}

impl AgentKind {
    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::Cov => "cov",
            AgentKind::Baseline => "baseline",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cov" => Ok(AgentKind::Cov),
            "baseline" => Ok(AgentKind::Baseline),
            _ => Err(format!("Unknown agent: {}", s)),
        }
    }
}

/// Experiment settings, loadable from a JSON file with every field optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// JSON array of questions
    pub question_file: PathBuf,

    /// Root holding the episode directories
    pub dataset_dir: PathBuf,

    pub output_dir: PathBuf,

    pub agent: AgentKind,

    /// Model preset name (`qwen`, `gemini`, ...)
    pub model: String,

    pub session: SessionConfig,

    /// This process handles questions with `index % shard_count == shard_index`
    pub shard_index: usize,
    pub shard_count: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            question_file: PathBuf::from("data/open-eqa-v0.json"),
            dataset_dir: PathBuf::from("data/frames"),
            output_dir: PathBuf::from("output"),
            agent: AgentKind::Cov,
            model: ModelPreset::QwenVlFlash.name().to_string(),
            session: SessionConfig::default(),
            shard_index: 0,
            shard_count: 1,
        }
    }
}

impl ExperimentConfig {
    /// Loads a config file.
    pub fn load(path: &Path) -> Result<Self, BatchError> {
        read_json(path)
    }

    /// Resolves the model preset.
    pub fn model_config(&self) -> Result<ModelConfig, BatchError> {
        self.model
            .parse::<ModelPreset>()
            .map(|preset| preset.config())
            .map_err(|_| BatchError::UnknownModel(self.model.clone()))
    }

    /// Checks the shard settings.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.shard_count == 0 || self.shard_index >= self.shard_count {
            return Err(BatchError::InvalidShard {
                index: self.shard_index,
                count: self.shard_count,
            });
        }
        Ok(())
    }
}

/// Files of one recorded episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodePaths {
    pub scene_file: PathBuf,
    pub pose_dir: PathBuf,
    pub image_dir: PathBuf,
    pub family: DatasetFamily,
}

impl EpisodePaths {
    /// Maps an episode id such as `hm3d-v0/000-hm3d-BFRyYbPCCPE` to its files.
    ///
    /// HM3D episodes keep poses in `pose/` and frames in `comp_color/`;
    /// ScanNet episodes keep both next to the `_vh_clean` mesh.
    pub fn resolve(dataset_dir: &Path, episode_history: &str) -> Self {
        let episode_dir = dataset_dir.join(episode_history);
        let scene = episode_history.rsplit('-').next().unwrap_or(episode_history);
        let family = DatasetFamily::from_scene_path(Path::new(episode_history));

        match family {
            DatasetFamily::Hm3d => Self {
                scene_file: episode_dir.join(format!("{scene}.glb")),
                pose_dir: episode_dir.join("pose"),
                image_dir: episode_dir.join("comp_color"),
                family,
            },
            DatasetFamily::ScanNet => Self {
                scene_file: episode_dir.join(format!("{scene}_vh_clean.glb")),
                pose_dir: episode_dir.clone(),
                image_dir: episode_dir,
                family,
            },
        }
    }
}

/// Where a run writes its results and per-question artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
    agent: AgentKind,
    /// `(index, count)` when the run is split into several shards
    shard: Option<(usize, usize)>,
}

impl OutputLayout {
    pub fn new(output_dir: &Path, model: &ModelConfig, agent: AgentKind, min_action_step: u32) -> Self {
        let mut root = output_dir.join(model.path_safe_name()).join(agent.name());
        if agent == AgentKind::Cov {
            root = root.join(min_action_step.to_string());
        }
        Self { root, agent, shard: None }
    }

    /// Gives the layout a per-shard results file. A single shard keeps the
    /// plain file name.
    pub fn with_shard(mut self, index: usize, count: usize) -> Self {
        self.shard = (count > 1).then_some((index, count));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Results file this layout writes.
    pub fn results_file(&self) -> PathBuf {
        match self.shard {
            Some((index, count)) => self.root.join(format!("{}-results.shard{index}of{count}.json", self.agent.name())),
            None => self.root.join(format!("{}-results.json", self.agent.name())),
        }
    }

    /// Every results file of this agent under the root, shards included,
    /// sorted by name.
    pub fn all_results_files(&self) -> Result<Vec<PathBuf>, BatchError> {
        let prefix = format!("{}-results", self.agent.name());
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(BatchError::Io { path: self.root.clone(), source }),
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".json"))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Results of every shard merged, first occurrence of a question wins.
    pub fn collect_results(&self) -> Result<Vec<QuestionResult>, BatchError> {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for file in self.all_results_files()? {
            let results: Vec<QuestionResult> = read_json(&file)?;
            merged.extend(results.into_iter().filter(|r| seen.insert(r.question_id.clone())));
        }
        Ok(merged)
    }

    pub fn question_dir(&self, episode_history: &str, question_id: &str) -> PathBuf {
        self.root.join(episode_history).join(question_id)
    }

    pub fn shots_dir(&self, episode_history: &str, question_id: &str) -> PathBuf {
        self.question_dir(episode_history, question_id).join("shots")
    }

    pub fn history_file(&self, episode_history: &str, question_id: &str) -> PathBuf {
        self.question_dir(episode_history, question_id).join("history.json")
    }
}

/// One entry of the question file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionItem {
    pub question_id: String,
    pub episode_history: String,
    pub question: String,

    /// Reference answer, carried into the history export
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

/// Outcome counts of a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Answered in this run
    pub processed: usize,
    /// Already present in the results file
    pub skipped: usize,
    /// Failed in this run
    pub failed: usize,
}

/// Runs every question of an experiment.
pub struct BatchDriver<L, V>
where
    L: SceneLoader,
    V: VisionLanguageModel,
{
    config: ExperimentConfig,
    layout: OutputLayout,
    loader: L,
    vlm: Arc<V>,
}

impl<L, V> BatchDriver<L, V>
where
    L: SceneLoader,
    V: VisionLanguageModel,
{
    /// Creates a driver; `model` only determines output paths.
    pub fn new(config: ExperimentConfig, model: &ModelConfig, loader: L, vlm: Arc<V>) -> Self {
        let layout = OutputLayout::new(&config.output_dir, model, config.agent, config.session.min_action_step)
            .with_shard(config.shard_index, config.shard_count);
        Self {
            config,
            layout,
            loader,
            vlm,
        }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Processes this shard's questions. A failing question is logged and
    /// counted; it never stops the batch.
    ///
    /// Resume reads only this shard's results file, which no other shard
    /// writes.
    pub async fn run(&self) -> Result<BatchSummary, BatchError> {
        self.config.validate()?;

        let questions: Vec<QuestionItem> = read_json(&self.config.question_file)?;
        info!("Loaded {} questions from {}", questions.len(), self.config.question_file.display());

        let results_file = self.layout.results_file();
        let mut results: Vec<QuestionResult> = if results_file.exists() {
            read_json(&results_file)?
        } else {
            Vec::new()
        };
        let processed_ids: HashSet<String> = results.iter().map(|r| r.question_id.clone()).collect();
        if !processed_ids.is_empty() {
            info!("Found {} already processed questions", processed_ids.len());
        }

        let mut summary = BatchSummary::default();
        for (idx, item) in questions.iter().enumerate() {
            if idx % self.config.shard_count != self.config.shard_index {
                continue;
            }
            if processed_ids.contains(&item.question_id) {
                info!("Skipping already processed question {}/{}: {}", idx + 1, questions.len(), item.question_id);
                summary.skipped += 1;
                continue;
            }

            info!("Processing question {}/{}: {}", idx + 1, questions.len(), item.question_id);
            match self.run_question(item).await {
                Ok(result) => {
                    results.push(result);
                    write_json(&results_file, &results)?;
                    summary.processed += 1;
                    info!("✓ Processed {}, total completed: {}", item.question_id, results.len());
                }
                Err(err) => {
                    error!("✗ Failed to process question {}: {}", item.question_id, err);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "All processing complete: {} processed, {} skipped, {} failed",
            summary.processed, summary.skipped, summary.failed
        );
        info!("Results saved to: {}", results_file.display());
        Ok(summary)
    }

    /// Runs one question. The renderer lives only inside this call.
    pub async fn run_question(&self, item: &QuestionItem) -> Result<QuestionResult, BatchError> {
        let paths = EpisodePaths::resolve(&self.config.dataset_dir, &item.episode_history);
        let viewpoints = ViewpointStore::load(&paths.pose_dir, &paths.image_dir, paths.family.stride())?;
        let question = Question::new(item.question_id.clone(), item.question.clone());

        match self.config.agent {
            AgentKind::Baseline => {
                Ok(run_baseline(self.vlm.clone(), &question, &viewpoints, &self.config.session).await?)
            }
            AgentKind::Cov => {
                let renderer = self.loader.load_scene(&paths.scene_file)?;
                let mut session = DialogueSession::new(
                    question,
                    renderer,
                    viewpoints,
                    self.vlm.clone(),
                    self.config.session.clone(),
                    self.layout.shots_dir(&item.episode_history, &item.question_id),
                );
                let outcome = session.run().await;

                let history = self.layout.history_file(&item.episode_history, &item.question_id);
                let export = HistoryExport::from_session(&session, &outcome).with_ground_truth(item.answer.clone());
                if let Err(err) = export.write_to_file(&history) {
                    warn!("Cannot write {}: {}", history.display(), err);
                }

                Ok(outcome?)
            }
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, BatchError> {
    let text = std::fs::read_to_string(path).map_err(|source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| BatchError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), BatchError> {
    let io_err = |source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|source| BatchError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, json).map_err(io_err)
}
