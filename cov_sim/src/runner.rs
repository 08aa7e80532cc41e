//! Scenario runner - plays scripted dialogues against a simulated scene.

use crate::batch::EpisodePaths;
use crate::dataset::DatasetWriter;
use crate::exporter::HistoryExport;
use crate::renderer::{RendererProbe, SimSceneLoader};
use crate::scenarios::ScenarioId;
use crate::vlm::ScriptedVlm;

use anyhow::Context;
use cov_core::{
    CameraState, DialogueSession, DialogueTurn, PromptKind, Question, QuestionResult, SessionConfig, SessionError,
    SessionId, ViewpointStore,
};
use cov_env::{EnvError, PrimitiveAction, SceneLoader, TokenUsage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Episode id written for every scenario. The `hm3d` family keeps every
/// 10th frame.
pub const SIM_EPISODE: &str = "hm3d-v0/000-hm3d-Sim";

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Dialogue turns played
    pub turns: u32,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

impl ScenarioResult {
    fn setup_failure(scenario: ScenarioId, seed: u64, err: anyhow::Error) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            turns: 0,
            failure_reason: Some(format!("setup failed: {err:#}")),
            metrics: ScenarioMetrics::default(),
        }
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// VLM calls, selection and failed attempts included
    pub vlm_calls: u64,

    /// Frames actually rendered
    pub renders: u64,

    /// Primitive steps sent to the renderer
    pub primitives: u64,

    pub blank_recoveries: u64,

    pub repetition_breaks: u64,

    pub total_tokens: u64,
}

/// Everything observable after a session has been dropped.
struct Played {
    outcome: Result<QuestionResult, SessionError>,
    history: Vec<DialogueTurn>,
    selected_views: Vec<usize>,
    overview: Option<PathBuf>,
    camera: CameraState,
    usage: TokenUsage,
    probe: RendererProbe,
    vlm: Arc<ScriptedVlm>,
}

impl Played {
    fn prompts(&self, kind: PromptKind) -> u64 {
        self.history.iter().filter(|t| t.prompt == kind).count() as u64
    }

    fn metrics(&self) -> ScenarioMetrics {
        ScenarioMetrics {
            vlm_calls: self.vlm.calls(),
            renders: self.probe.renders(),
            primitives: self.probe.primitives().len() as u64,
            blank_recoveries: self.prompts(PromptKind::BlankRecovery),
            repetition_breaks: self.prompts(PromptKind::RepetitionBreak),
            total_tokens: self.usage.total_tokens,
        }
    }

    fn answer(&self) -> Option<&str> {
        self.outcome.as_ref().ok().map(|r| r.answer.as_str())
    }

    fn finish(self, scenario: ScenarioId, seed: u64, checks: Checks) -> ScenarioResult {
        let metrics = self.metrics();
        let failure_reason = checks.failure_reason();
        ScenarioResult {
            scenario,
            seed,
            passed: failure_reason.is_none(),
            turns: self.history.len() as u32,
            failure_reason,
            metrics,
        }
    }
}

/// Collected assertion failures.
#[derive(Debug, Default)]
struct Checks {
    failures: Vec<String>,
}

impl Checks {
    fn check(&mut self, condition: bool, message: impl Into<String>) {
        if !condition {
            self.failures.push(message.into());
        }
    }

    fn expect_answer(&mut self, played: &Played, expected: &str, steps: u32) {
        match &played.outcome {
            Ok(result) => {
                self.check(result.answer == expected, format!("answer {:?}, expected {:?}", result.answer, expected));
                self.check(
                    result.action_steps == steps,
                    format!("{} action steps, expected {}", result.action_steps, steps),
                );
            }
            Err(err) => self.failures.push(format!("no answer: {err}")),
        }
    }

    fn expect_released(&mut self, played: &Played) {
        let closes = played.probe.close_calls();
        self.check(closes == 1, format!("renderer closed {closes} times, expected once"));
    }

    fn failure_reason(&self) -> Option<String> {
        if self.failures.is_empty() {
            None
        } else {
            Some(self.failures.join("; "))
        }
    }
}

/// Runs dialogue scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Scratch space for synthetic episodes and rendered frames
    work_dir: PathBuf,

    /// Where dialogue histories are exported, if anywhere
    export_dir: Option<PathBuf>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            seed,
            work_dir: work_dir.into(),
            export_dir: None,
        }
    }

    /// Writes `<scenario>.json` histories into `dir`.
    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = Some(dir.into());
        self
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let outcome = match scenario {
            ScenarioId::QuickAnswer => self.run_quick_answer().await,
            ScenarioId::TurnExhaustion => self.run_turn_exhaustion().await,
            ScenarioId::RepetitionBreaker => self.run_repetition_breaker().await,
            ScenarioId::BlankRecovery => self.run_blank_recovery().await,
            ScenarioId::CompoundAction => self.run_compound_action().await,
            ScenarioId::InvalidView => self.run_invalid_view().await,
            ScenarioId::OverviewRequest => self.run_overview_request().await,
            ScenarioId::FlakyTransport => self.run_flaky_transport().await,
        };

        outcome.unwrap_or_else(|err| ScenarioResult::setup_failure(scenario, self.seed, err))
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            vlm_timeout_secs: 5,
            retry_backoff_ms: 1,
            ..SessionConfig::default()
        }
    }

    /// Writes a fresh episode for `scenario` and plays one question on it.
    async fn play(
        &self,
        scenario: ScenarioId,
        vlm: ScriptedVlm,
        config: SessionConfig,
        frame_drops: u32,
    ) -> anyhow::Result<Played> {
        let scenario_dir = self.work_dir.join(scenario.name()).join(format!("seed-{}", self.seed));
        clear_dir(&scenario_dir)?;

        let dataset_dir = scenario_dir.join("dataset");
        DatasetWriter::new(self.seed)
            .write_episode(&dataset_dir, SIM_EPISODE)
            .with_context(|| format!("writing episode under {}", dataset_dir.display()))?;

        let paths = EpisodePaths::resolve(&dataset_dir, SIM_EPISODE);
        let viewpoints = ViewpointStore::load(&paths.pose_dir, &paths.image_dir, paths.family.stride())?;
        debug!("Loaded {} viewpoints", viewpoints.len());

        let probe = RendererProbe::new();
        let renderer = SimSceneLoader::new()
            .with_probe(probe.clone())
            .with_frame_drops(frame_drops)
            .load_scene(&paths.scene_file)?;

        let vlm = Arc::new(vlm);
        let question = Question::new(scenario.name(), "What is next to the window?");
        let mut session = DialogueSession::new(
            question,
            renderer,
            viewpoints,
            vlm.clone(),
            config,
            scenario_dir.join("shots"),
        )
        .with_id(SessionId::from_seed(self.seed));

        let outcome = session.run().await;

        if let Some(export_dir) = &self.export_dir {
            let path = export_dir.join(format!("{}.json", scenario.name()));
            match HistoryExport::from_session(&session, &outcome).write_to_file(&path) {
                Ok(()) => info!("Exported history to {}", path.display()),
                Err(err) => warn!("Failed to write {}: {}", path.display(), err),
            }
        }

        let played = Played {
            history: session.history().to_vec(),
            selected_views: session.selected_views().to_vec(),
            overview: session.overview_image().map(Path::to_path_buf),
            camera: session.camera().state(),
            usage: session.token_usage(),
            outcome,
            probe,
            vlm,
        };
        drop(session);
        Ok(played)
    }

    /// SIM-001: QuickAnswer - move, rotate, answer.
    ///
    /// **Assertion**: answer extracted, one step per turn, selected views
    /// kept in order, renderer released exactly once.
    async fn run_quick_answer(&self) -> anyhow::Result<ScenarioResult> {
        info!("SIM-001: QuickAnswer - move, rotate, answer");

        let vlm = ScriptedVlm::new(["forward-movement+1", "left-rotation+20", "right-movement+1", "done+[chair]"])
            .with_selection("Selected views: [1, 2]");
        let played = self.play(ScenarioId::QuickAnswer, vlm, self.session_config(), 0).await?;

        let mut checks = Checks::default();
        checks.expect_answer(&played, "chair", 4);
        checks.check(
            played.selected_views == vec![1, 2],
            format!("selected views {:?}, expected [1, 2]", played.selected_views),
        );
        checks.expect_released(&played);

        info!("✓ QuickAnswer complete: answer={:?}, {} turns", played.answer(), played.history.len());
        Ok(played.finish(ScenarioId::QuickAnswer, self.seed, checks))
    }

    /// SIM-002: TurnExhaustion - the model never answers.
    ///
    /// **Assertion**: exactly `max_turns` dialogue calls, then failure.
    async fn run_turn_exhaustion(&self) -> anyhow::Result<ScenarioResult> {
        info!("SIM-002: TurnExhaustion - no answer within the budget");

        let config = self.session_config();
        let max_turns = config.max_turns;
        let vlm = ScriptedVlm::cycling(["left-rotation+10", "right-rotation+10"]);
        let played = self.play(ScenarioId::TurnExhaustion, vlm, config, 0).await?;

        let mut checks = Checks::default();
        checks.check(
            matches!(played.outcome, Err(SessionError::TurnBudgetExhausted { turns }) if turns == max_turns),
            format!("expected turn budget failure, got {:?}", played.outcome.as_ref().map(|r| &r.answer)),
        );
        let dialogue_calls = played.vlm.dialogue_requests().len();
        checks.check(
            dialogue_calls == max_turns as usize,
            format!("{dialogue_calls} dialogue calls, expected {max_turns}"),
        );
        checks.expect_released(&played);

        info!("✓ TurnExhaustion complete: {} dialogue calls", dialogue_calls);
        Ok(played.finish(ScenarioId::TurnExhaustion, self.seed, checks))
    }

    /// SIM-003: RepetitionBreaker - one instruction, over and over.
    ///
    /// **Assertion**: the tenth identical reply is answered with the
    /// corrective prompt in the same turn, and turn 11 is a normal step.
    async fn run_repetition_breaker(&self) -> anyhow::Result<ScenarioResult> {
        info!("SIM-003: RepetitionBreaker - repeated instruction");

        let mut script = vec!["left-rotation+10"; 11];
        script.push("done+[vase]");
        let played = self
            .play(ScenarioId::RepetitionBreaker, ScriptedVlm::new(script), self.session_config(), 0)
            .await?;

        let mut checks = Checks::default();
        checks.expect_answer(&played, "vase", 11);
        let breaks: Vec<u32> = played
            .history
            .iter()
            .filter(|t| t.prompt == PromptKind::RepetitionBreak)
            .map(|t| t.turn_index)
            .collect();
        checks.check(breaks == vec![10], format!("corrective prompts on turns {breaks:?}, expected [10]"));
        let last = played.history.last().map(|t| t.prompt);
        checks.check(last == Some(PromptKind::Step), format!("turn 11 prompt {last:?}, expected Step"));

        info!("✓ RepetitionBreaker complete: corrective prompt on turns {:?}", breaks);
        Ok(played.finish(ScenarioId::RepetitionBreaker, self.seed, checks))
    }

    /// SIM-004: BlankRecovery - walk out of the scene.
    ///
    /// **Assertion**: the blank frame is never sent; the next prompt is the
    /// recovery prompt with the last viewpoint's image.
    async fn run_blank_recovery(&self) -> anyhow::Result<ScenarioResult> {
        info!("SIM-004: BlankRecovery - leave the reconstructed scene");

        let vlm = ScriptedVlm::new(["forward-movement+200", "done+[sofa]"]);
        let played = self.play(ScenarioId::BlankRecovery, vlm, self.session_config(), 0).await?;

        let mut checks = Checks::default();
        checks.expect_answer(&played, "sofa", 2);
        let second = played.history.get(1);
        checks.check(
            second.map(|t| t.prompt) == Some(PromptKind::BlankRecovery),
            format!("turn 2 prompt {:?}, expected blank recovery", second.map(|t| t.prompt)),
        );
        checks.check(played.camera.on_recorded_trajectory, "camera not back on the recorded trajectory");

        info!("✓ BlankRecovery complete: {} recoveries", played.prompts(PromptKind::BlankRecovery));
        Ok(played.finish(ScenarioId::BlankRecovery, self.seed, checks))
    }

    /// SIM-005: CompoundAction - switch, rotate and move in one reply.
    ///
    /// **Assertion**: movement runs before rotation, the switch runs last,
    /// and the following frame comes from the recorded trajectory.
    async fn run_compound_action(&self) -> anyhow::Result<ScenarioResult> {
        info!("SIM-005: CompoundAction - grouped execution order");

        let vlm = ScriptedVlm::new([
            "switch to view 2 then right-rotation+25 and forward-movement+2",
            "done+[lamp]",
        ]);
        let played = self.play(ScenarioId::CompoundAction, vlm, self.session_config(), 0).await?;

        let mut checks = Checks::default();
        checks.expect_answer(&played, "lamp", 2);
        let expected = vec![
            PrimitiveAction::MoveForward,
            PrimitiveAction::MoveForward,
            PrimitiveAction::TurnRight,
            PrimitiveAction::TurnRight,
        ];
        let primitives = played.probe.primitives();
        checks.check(primitives == expected, format!("primitives {primitives:?}, expected {expected:?}"));
        checks.check(
            played.camera.current_viewpoint == Some(2),
            format!("camera at {:?}, expected viewpoint 2", played.camera.current_viewpoint),
        );
        let renders = played.probe.renders();
        checks.check(renders == 1, format!("{renders} renders, expected only the overview"));

        info!("✓ CompoundAction complete: {} primitives", primitives.len());
        Ok(played.finish(ScenarioId::CompoundAction, self.seed, checks))
    }

    /// SIM-006: InvalidView - switch past the last recorded view.
    ///
    /// **Assertion**: the session continues and the next prompt names the
    /// bad id.
    async fn run_invalid_view(&self) -> anyhow::Result<ScenarioResult> {
        info!("SIM-006: InvalidView - out-of-range switch");

        let vlm = ScriptedVlm::new(["switch to view 999", "done+[door]"]);
        let played = self.play(ScenarioId::InvalidView, vlm, self.session_config(), 0).await?;

        let mut checks = Checks::default();
        checks.expect_answer(&played, "door", 2);
        let prompts = played.vlm.dialogue_prompts();
        checks.check(
            prompts.get(1).is_some_and(|p| p.starts_with("View id 999 does not exist")),
            format!("turn 2 prompt {:?} does not report the bad id", prompts.get(1)),
        );
        checks.check(played.history.first().is_some_and(|t| !t.applied), "rejected switch marked as applied");

        info!("✓ InvalidView complete");
        Ok(played.finish(ScenarioId::InvalidView, self.seed, checks))
    }

    /// SIM-007: OverviewRequest - ask for the bird's-eye view.
    ///
    /// **Assertion**: the stored overview frame is sent back without a
    /// second render.
    async fn run_overview_request(&self) -> anyhow::Result<ScenarioResult> {
        info!("SIM-007: OverviewRequest - reuse the overview frame");

        let vlm = ScriptedVlm::new(["switch to bird-eye-view", "done+[table]"]);
        let played = self.play(ScenarioId::OverviewRequest, vlm, self.session_config(), 0).await?;

        let mut checks = Checks::default();
        checks.expect_answer(&played, "table", 2);
        let second_image = played.history.get(1).map(|t| t.image.clone());
        checks.check(
            second_image.is_some() && second_image == played.overview,
            format!("turn 2 image {:?}, expected overview {:?}", second_image, played.overview),
        );
        let renders = played.probe.renders();
        checks.check(renders == 1, format!("{renders} renders, expected 1"));

        info!("✓ OverviewRequest complete");
        Ok(played.finish(ScenarioId::OverviewRequest, self.seed, checks))
    }

    /// SIM-008: FlakyTransport - transient VLM and renderer failures.
    ///
    /// **Assertion**: retries absorb two transport errors and one dropped
    /// frame, and the question is still answered.
    async fn run_flaky_transport(&self) -> anyhow::Result<ScenarioResult> {
        info!("SIM-008: FlakyTransport - retries");

        let vlm = ScriptedVlm::new(["left-rotation+30", "done+[plant]"]).with_failures(vec![
            EnvError::transport("connection reset"),
            EnvError::transport("connection reset"),
        ]);
        let played = self.play(ScenarioId::FlakyTransport, vlm, self.session_config(), 1).await?;

        let mut checks = Checks::default();
        checks.expect_answer(&played, "plant", 2);
        let dropped = played.probe.snapshot().dropped_frames;
        checks.check(dropped == 1, format!("{dropped} dropped frames, expected 1"));
        let calls = played.vlm.calls();
        checks.check(calls == 5, format!("{calls} VLM calls, expected 5"));

        info!("✓ FlakyTransport complete: {} VLM calls", calls);
        Ok(played.finish(ScenarioId::FlakyTransport, self.seed, checks))
    }
}

fn clear_dir(dir: &Path) -> anyhow::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("clearing {}", dir.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(scenario: ScenarioId) -> ScenarioResult {
        let dir = tempfile::tempdir().unwrap();
        ScenarioRunner::new(42, dir.path()).run(scenario).await
    }

    #[tokio::test]
    async fn test_quick_answer_passes() {
        let result = run(ScenarioId::QuickAnswer).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.turns, 4);
        // Selection plus four dialogue calls
        assert_eq!(result.metrics.vlm_calls, 5);
        assert_eq!(result.metrics.total_tokens, 5 * 110);
    }

    #[tokio::test]
    async fn test_turn_exhaustion_passes() {
        let result = run(ScenarioId::TurnExhaustion).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.turns, 65);
    }

    #[tokio::test]
    async fn test_repetition_breaker_passes() {
        let result = run(ScenarioId::RepetitionBreaker).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.repetition_breaks, 1);
    }

    #[tokio::test]
    async fn test_blank_recovery_passes() {
        let result = run(ScenarioId::BlankRecovery).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.blank_recoveries, 1);
    }

    #[tokio::test]
    async fn test_remaining_scenarios_pass() {
        for scenario in [
            ScenarioId::CompoundAction,
            ScenarioId::InvalidView,
            ScenarioId::OverviewRequest,
            ScenarioId::FlakyTransport,
        ] {
            let result = run(scenario).await;
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
        }
    }

    #[tokio::test]
    async fn test_export_writes_history() {
        let dir = tempfile::tempdir().unwrap();
        let export_dir = dir.path().join("exports");
        let result = ScenarioRunner::new(7, dir.path().join("work"))
            .with_export_dir(&export_dir)
            .run(ScenarioId::InvalidView)
            .await;
        assert!(result.passed, "{:?}", result.failure_reason);

        let export = HistoryExport::read_from_file(&export_dir.join("invalid_view.json")).unwrap();
        assert_eq!(export.answer.as_deref(), Some("door"));
        assert_eq!(export.turns.len(), 2);
    }
}
