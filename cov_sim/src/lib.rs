//! CoV Simulation Harness and Batch Driver
//!
//! This crate runs the dialogue agent end to end without a GPU renderer or
//! a hosted model, and drives real experiments over a question file.
//!
//! # Simulation
//!
//! Every source of non-determinism is replaced by a seeded stand-in:
//! - **Scene**: `SimRenderer` tracks the pose exactly and draws procedural
//!   frames, white past the scene bounds
//! - **Episode**: `DatasetWriter` lays out poses and frames the way a real
//!   HM3D capture does
//! - **Model**: `ScriptedVlm` replays a fixed reply script
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    ScenarioRunner                      │
//! │   DatasetWriter ──► episode on disk ──► ViewpointStore │
//! │                                              │         │
//! │   SimRenderer ◄──── DialogueSession ◄────────┘         │
//! │   (probe)                │                             │
//! │                    ScriptedVlm                         │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cov_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let runner = ScenarioRunner::new(42, std::env::temp_dir().join("cov-sim"));
//! let result = runner.run(ScenarioId::BlankRecovery).await;
//! assert!(result.passed);
//! ```

pub mod batch;
mod dataset;
mod exporter;
mod renderer;
mod runner;
pub mod scenarios;
mod vlm;

pub use batch::{AgentKind, BatchDriver, BatchError, BatchSummary, EpisodePaths, ExperimentConfig, OutputLayout, QuestionItem};
pub use dataset::{default_bounds, DatasetWriter};
pub use exporter::HistoryExport;
pub use renderer::{ProbeCounts, RendererProbe, SimRenderer, SimSceneLoader, FRAME_HEIGHT, FRAME_WIDTH};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SIM_EPISODE};
pub use vlm::{ScriptedVlm, SCRIPTED_USAGE};
