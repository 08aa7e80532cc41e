//! Camera controller: the recorded/free-motion state machine over a renderer.
//!
//! ```text
//!                 jump_to_viewpoint(i) / restore_last_viewpoint()
//!        ┌──────────────────────────────────────────────────────────┐
//!        ▼                                                          │
//! ┌──────────────┐    move / rotate / overview     ┌────────────────┴┐
//! │ ON TRAJECTORY│ ──────────────────────────────► │   FREE MOTION   │
//! │ frames come  │                                 │ frames are      │
//! │ from the     │ ◄────────────────────────────── │ rendered live   │
//! │ recorded set │            jump / restore       │                 │
//! └──────────────┘                                 └─────────────────┘
//! ```
//!
//! On the trajectory a capture returns the recorded image untouched: it is
//! clean, and a live re-render of the same pose may differ by sub-pixel
//! jitter.

use crate::instruction::{Instruction, MoveDirection};
use crate::viewpoint::ViewpointStore;
use cov_env::{EnvError, Pose, PrimitiveAction, SceneBounds, SceneRenderer, MOVE_STEP, TURN_STEP_DEGREES};
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Downward pitch of the overview camera (degrees).
pub const OVERVIEW_PITCH_DEGREES: f64 = 60.0;

/// File stem of the overview frame.
pub const OVERVIEW_FRAME_NAME: &str = "overview";

/// Errors raised by the camera controller.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("Viewpoint {index} does not exist (valid ids: 0..{len})")]
    InvalidViewpointIndex { index: usize, len: usize },

    #[error("No recorded viewpoint has been visited yet")]
    NoRecordedViewpoint,

    #[error("Viewpoint store is empty")]
    EmptyStore,

    #[error("Renderer error: {0}")]
    Renderer(#[from] EnvError),

    #[error("Cannot write frame {path}: {source}")]
    FrameWrite {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Cannot prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Observable controller state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraState {
    /// Last recorded viewpoint jumped to
    pub current_viewpoint: Option<usize>,

    /// True exactly while the live pose equals `current_viewpoint`'s pose
    pub on_recorded_trajectory: bool,

    /// Number of frame captures requested so far
    pub capture_count: u64,
}

/// Outcome of applying one batch of instructions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Instructions executed
    pub applied: usize,

    /// View switch targets that were out of range and skipped
    pub rejected_targets: Vec<usize>,

    /// A bare "switch back" arrived before any viewpoint was visited
    pub restore_skipped: bool,
}

impl ApplyReport {
    /// Returns true if anything was skipped.
    pub fn has_rejections(&self) -> bool {
        !self.rejected_targets.is_empty() || self.restore_skipped
    }
}

/// Owns the renderer for one session and translates instructions into
/// renderer primitives.
///
/// The renderer is closed when the controller is dropped, on success and
/// failure paths alike.
pub struct CameraController<R: SceneRenderer> {
    renderer: R,
    viewpoints: ViewpointStore,
    state: CameraState,
    render_attempts: u32,
    closed: bool,
}

impl<R: SceneRenderer> CameraController<R> {
    /// Takes ownership of a renderer and the scene's recorded viewpoints.
    pub fn new(renderer: R, viewpoints: ViewpointStore) -> Self {
        Self {
            renderer,
            viewpoints,
            state: CameraState::default(),
            render_attempts: 3,
            closed: false,
        }
    }

    /// Sets how many times a dropped frame is re-rendered before giving up.
    pub fn with_render_attempts(mut self, attempts: u32) -> Self {
        self.render_attempts = attempts.max(1);
        self
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn viewpoints(&self) -> &ViewpointStore {
        &self.viewpoints
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Moves the camera onto recorded viewpoint `index`.
    pub fn jump_to_viewpoint(&mut self, index: usize) -> Result<(), CameraError> {
        let viewpoint = self.viewpoints.get(index).ok_or(CameraError::InvalidViewpointIndex {
            index,
            len: self.viewpoints.len(),
        })?;

        self.renderer.set_pose(&viewpoint.pose)?;
        self.state.current_viewpoint = Some(index);
        self.state.on_recorded_trajectory = true;
        debug!("Jumped to viewpoint {}", index);
        Ok(())
    }

    /// Re-applies the pose of the last viewpoint jumped to.
    ///
    /// # Returns
    /// * `Err(CameraError::NoRecordedViewpoint)` - No jump has happened yet
    pub fn restore_last_viewpoint(&mut self) -> Result<(), CameraError> {
        let index = self.state.current_viewpoint.ok_or(CameraError::NoRecordedViewpoint)?;
        self.jump_to_viewpoint(index)
    }

    /// Issues `repeat` primitive moves. No bounds checking: leaving the
    /// geometry shows up downstream as a blank frame.
    ///
    /// One instruction never travels further than the scene diagonal.
    pub fn move_camera(&mut self, direction: MoveDirection, repeat: u32) -> Result<(), CameraError> {
        self.state.on_recorded_trajectory = false;
        let limit = self.max_move_steps()?;
        let steps = if repeat > limit {
            warn!("Clamping {} x {} to {} steps", direction.primitive(), repeat, limit);
            limit
        } else {
            repeat
        };

        let action = direction.primitive();
        for _ in 0..steps {
            self.renderer.step(action)?;
        }
        Ok(())
    }

    /// Primitive moves needed to cross the scene diagonal.
    fn max_move_steps(&self) -> Result<u32, CameraError> {
        let diagonal = self.renderer.scene_bounds()?.size().norm();
        Ok((diagonal / MOVE_STEP).ceil().clamp(1.0, u32::MAX as f64) as u32)
    }

    /// Rotates about the vertical axis; positive angles turn left.
    ///
    /// Whole `TURN_STEP_DEGREES` steps go through the renderer's turn
    /// primitive, the remainder is applied to the orientation directly.
    /// Full turns are dropped, so one call issues at most
    /// `360 / TURN_STEP_DEGREES` primitives.
    pub fn rotate(&mut self, degrees: f64) -> Result<(), CameraError> {
        self.state.on_recorded_trajectory = false;

        let mut magnitude = degrees.abs();
        if magnitude >= 360.0 {
            magnitude %= 360.0;
            warn!("Reducing rotation of {} degrees to {}", degrees, magnitude);
        }
        let action = if degrees > 0.0 {
            PrimitiveAction::TurnLeft
        } else {
            PrimitiveAction::TurnRight
        };

        let whole_steps = (magnitude / TURN_STEP_DEGREES).floor() as u64;
        for _ in 0..whole_steps {
            self.renderer.step(action)?;
        }

        let remainder = magnitude % TURN_STEP_DEGREES;
        if remainder > 0.0 {
            let signed = if degrees > 0.0 { remainder } else { -remainder };
            let delta = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), signed.to_radians());
            let pose = self.renderer.pose();
            self.renderer.set_pose(&Pose::new(pose.position, delta * pose.rotation))?;
        }
        Ok(())
    }

    /// Captures the current view and returns its image path.
    ///
    /// On the trajectory this is the recorded image and the renderer is not
    /// touched. Otherwise a frame is rendered and written to `output_dir` as
    /// `<name>.png`, or `<capture count>.png` without a name.
    pub fn capture_frame(&mut self, output_dir: &Path, name: Option<&str>) -> Result<PathBuf, CameraError> {
        self.state.capture_count += 1;

        if self.state.on_recorded_trajectory {
            let index = self.state.current_viewpoint.ok_or(CameraError::NoRecordedViewpoint)?;
            let viewpoint = self.viewpoints.get(index).ok_or(CameraError::InvalidViewpointIndex {
                index,
                len: self.viewpoints.len(),
            })?;
            return Ok(viewpoint.image.clone());
        }

        std::fs::create_dir_all(output_dir).map_err(|source| CameraError::OutputDir {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let frame = self.render_with_retry()?;
        let file_name = match name {
            Some(name) => format!("{name}.png"),
            None => format!("{}.png", self.state.capture_count),
        };
        let path = output_dir.join(file_name);
        frame.save(&path).map_err(|source| CameraError::FrameWrite {
            path: path.clone(),
            source,
        })?;

        Ok(std::fs::canonicalize(&path).unwrap_or(path))
    }

    fn render_with_retry(&mut self) -> Result<image::RgbImage, CameraError> {
        let mut attempt = 1;
        loop {
            match self.renderer.render() {
                Ok(frame) => return Ok(frame),
                Err(err) if err.is_retryable() && attempt < self.render_attempts => {
                    warn!("Render attempt {}/{} failed: {}", attempt, self.render_attempts, err);
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Frames the whole scene from an elevated, pitched vantage and captures it.
    pub fn capture_overview(&mut self, output_dir: &Path) -> Result<PathBuf, CameraError> {
        let bounds = self.renderer.scene_bounds()?;
        let pose = overview_pose(&bounds);
        self.renderer.set_pose(&pose)?;
        self.state.on_recorded_trajectory = false;
        info!("Overview camera at ({:.2}, {:.2}, {:.2})", pose.position.x, pose.position.y, pose.position.z);
        self.capture_frame(output_dir, Some(OVERVIEW_FRAME_NAME))
    }

    /// Executes all movements, then all rotations, then all view switches,
    /// each group in the given order.
    ///
    /// Out-of-range switches are skipped and reported rather than failing
    /// the batch, so the model can be told about its mistake.
    pub fn apply(&mut self, instructions: &[Instruction]) -> Result<ApplyReport, CameraError> {
        let mut report = ApplyReport::default();

        for instruction in instructions {
            if let Instruction::Movement { direction, steps } = instruction {
                self.move_camera(*direction, *steps)?;
                info!("Moving camera {} by {} steps", direction.name(), steps);
                report.applied += 1;
            }
        }

        for instruction in instructions {
            if let Some(degrees) = instruction.signed_degrees() {
                self.rotate(degrees)?;
                info!("Rotating camera by {} degrees", degrees);
                report.applied += 1;
            }
        }

        for instruction in instructions {
            let Instruction::ViewSwitch { target } = instruction else {
                continue;
            };
            let outcome = match target {
                Some(index) => self.jump_to_viewpoint(*index),
                None => self.restore_last_viewpoint(),
            };
            match outcome {
                Ok(()) => report.applied += 1,
                Err(CameraError::InvalidViewpointIndex { index, len }) => {
                    warn!("Skipping switch to viewpoint {} (valid ids: 0..{})", index, len);
                    report.rejected_targets.push(index);
                }
                Err(CameraError::NoRecordedViewpoint) => {
                    warn!("Skipping switch back: no viewpoint visited yet");
                    report.restore_skipped = true;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(report)
    }

    /// Closes the renderer; later calls are no-ops.
    pub fn release(&mut self) {
        if !self.closed {
            self.renderer.close();
            self.closed = true;
            debug!("Renderer released");
        }
    }
}

impl<R: SceneRenderer> Drop for CameraController<R> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Camera pose that frames the whole scene footprint.
///
/// The camera pitches down by `OVERVIEW_PITCH_DEGREES`, rises with the
/// horizontal extent of the scene, and backs off along +Z so the near edge
/// is not clipped.
pub fn overview_pose(bounds: &SceneBounds) -> Pose {
    let center = bounds.center();
    let size = bounds.size();

    let horizontal = size.x.max(size.z);
    let pitch = OVERVIEW_PITCH_DEGREES.to_radians();
    let view_distance = (horizontal / 2.0) / pitch.tan();

    let fitted_height = bounds.max.y + view_distance * 0.3;
    let min_height = center.y + horizontal * 0.6;
    let height = fitted_height.max(min_height);

    let position = Vector3::new(center.x, 1.5 * height, center.z + 0.6 * size.z);
    let rotation = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -pitch);
    Pose::new(position, rotation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::parse;
    use crate::viewpoint::Viewpoint;
    use approx::assert_relative_eq;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Renderer that records every call.
    struct RecordingRenderer {
        pose: Pose,
        log: Vec<String>,
        renders: usize,
        drops_left: usize,
        closes: Arc<AtomicUsize>,
    }

    impl RecordingRenderer {
        fn new(closes: Arc<AtomicUsize>) -> Self {
            Self { pose: Pose::identity(), log: Vec::new(), renders: 0, drops_left: 0, closes }
        }
    }

    impl SceneRenderer for RecordingRenderer {
        fn pose(&self) -> Pose {
            self.pose
        }

        fn set_pose(&mut self, pose: &Pose) -> Result<(), EnvError> {
            self.pose = *pose;
            self.log.push("set_pose".to_string());
            Ok(())
        }

        fn step(&mut self, action: PrimitiveAction) -> Result<(), EnvError> {
            if action.is_turn() {
                let sign = if action == PrimitiveAction::TurnLeft { 1.0 } else { -1.0 };
                let delta = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), (sign * TURN_STEP_DEGREES).to_radians());
                self.pose.rotation = delta * self.pose.rotation;
            }
            self.log.push(action.name().to_string());
            Ok(())
        }

        fn render(&mut self) -> Result<RgbImage, EnvError> {
            if self.drops_left > 0 {
                self.drops_left -= 1;
                return Err(EnvError::FrameDropped("busy".into()));
            }
            self.renders += 1;
            Ok(RgbImage::from_pixel(4, 4, Rgb([10, 20, 30])))
        }

        fn scene_bounds(&self) -> Result<SceneBounds, EnvError> {
            Ok(SceneBounds::new(Vector3::new(-5.0, 0.0, -4.0), Vector3::new(5.0, 3.0, 4.0)))
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn store(n: usize) -> ViewpointStore {
        ViewpointStore::from_viewpoints(
            (0..n)
                .map(|i| Viewpoint {
                    index: i,
                    pose: Pose::new(Vector3::new(i as f64, 1.0, 0.0), UnitQuaternion::identity()),
                    image: PathBuf::from(format!("/recorded/{i}.png")),
                })
                .collect(),
        )
    }

    fn controller(n: usize) -> (CameraController<RecordingRenderer>, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        (CameraController::new(RecordingRenderer::new(closes.clone()), store(n)), closes)
    }

    #[test]
    fn test_jump_out_of_range() {
        let (mut camera, _) = controller(3);
        let err = camera.jump_to_viewpoint(3).unwrap_err();
        assert!(matches!(err, CameraError::InvalidViewpointIndex { index: 3, len: 3 }));
        assert_eq!(camera.state(), CameraState::default());
    }

    #[test]
    fn test_capture_on_trajectory_skips_renderer() {
        let dir = tempfile::tempdir().unwrap();
        let (mut camera, _) = controller(3);

        camera.jump_to_viewpoint(2).unwrap();
        let path = camera.capture_frame(dir.path(), None).unwrap();

        assert_eq!(path, PathBuf::from("/recorded/2.png"));
        assert_eq!(camera.renderer().renders, 0);
        assert_eq!(camera.state().capture_count, 1);
    }

    #[test]
    fn test_capture_after_motion_renders() {
        let dir = tempfile::tempdir().unwrap();
        let (mut camera, _) = controller(3);

        camera.jump_to_viewpoint(1).unwrap();
        camera.move_camera(MoveDirection::Forward, 2).unwrap();
        let moved = camera.capture_frame(dir.path(), None).unwrap();

        camera.jump_to_viewpoint(1).unwrap();
        camera.rotate(15.0).unwrap();
        let named = camera.capture_frame(dir.path(), Some("custom")).unwrap();

        assert_eq!(camera.renderer().renders, 2);
        assert!(moved.ends_with("1.png"));
        assert!(moved.exists());
        assert!(named.ends_with("custom.png"));
    }

    #[test]
    fn test_restore_requires_prior_jump() {
        let (mut camera, _) = controller(2);
        assert!(matches!(camera.restore_last_viewpoint(), Err(CameraError::NoRecordedViewpoint)));

        camera.jump_to_viewpoint(1).unwrap();
        camera.move_camera(MoveDirection::Upward, 1).unwrap();
        camera.restore_last_viewpoint().unwrap();

        assert!(camera.state().on_recorded_trajectory);
        assert_relative_eq!(camera.renderer().pose().position, Vector3::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn test_rotation_decomposition() {
        let (mut camera, _) = controller(1);
        camera.rotate(-25.0).unwrap();

        let log = &camera.renderer().log;
        assert_eq!(log, &vec!["turn_right", "turn_right", "set_pose"]);
        let expected = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), (-25.0f64).to_radians());
        assert!(camera.renderer().pose().rotation.angle_to(&expected) < 1e-9);
    }

    #[test]
    fn test_whole_step_rotation_has_no_residual() {
        let (mut camera, _) = controller(1);
        camera.rotate(30.0).unwrap();
        assert_eq!(camera.renderer().log, vec!["turn_left"; 3]);
    }

    #[test]
    fn test_huge_move_is_clamped_to_scene_diagonal() {
        let (mut camera, _) = controller(1);
        camera.move_camera(MoveDirection::Forward, 4_000_000_000).unwrap();

        // Diagonal of the 10 x 3 x 8 test scene is ~13.15 m, 33 steps of 0.4
        assert_eq!(camera.renderer().log, vec!["move_forward"; 33]);
    }

    #[test]
    fn test_short_move_is_not_clamped() {
        let (mut camera, _) = controller(1);
        camera.move_camera(MoveDirection::Left, 5).unwrap();
        assert_eq!(camera.renderer().log.len(), 5);
    }

    #[test]
    fn test_full_turns_are_dropped() {
        let (mut camera, _) = controller(1);
        camera.rotate(-(u32::MAX as f64)).unwrap();

        // 4294967295 % 360 = 255: 25 whole steps plus a 5 degree residual
        let log = &camera.renderer().log;
        assert_eq!(log.len(), 26);
        assert!(log[..25].iter().all(|a| a == "turn_right"));
        assert_eq!(log[25], "set_pose");
        let expected = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), (-255.0f64).to_radians());
        assert!(camera.renderer().pose().rotation.angle_to(&expected) < 1e-9);
    }

    #[test]
    fn test_apply_groups_by_type() {
        let (mut camera, _) = controller(5);
        let report = camera
            .apply(&parse("switch to view 4, left-rotation+10, upward-movement+2"))
            .unwrap();

        assert_eq!(report.applied, 3);
        assert_eq!(camera.renderer().log, vec!["move_up", "move_up", "turn_left", "set_pose"]);
        assert_eq!(camera.state().current_viewpoint, Some(4));
        assert!(camera.state().on_recorded_trajectory);
    }

    #[test]
    fn test_apply_skips_invalid_switch() {
        let (mut camera, _) = controller(2);
        let report = camera.apply(&parse("switch to view 9 and forward-movement+1")).unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.rejected_targets, vec![9]);
        assert!(report.has_rejections());
    }

    #[test]
    fn test_apply_skips_restore_without_history() {
        let (mut camera, _) = controller(2);
        let report = camera.apply(&parse("switch back")).unwrap();
        assert!(report.restore_skipped);
        assert_eq!(report.applied, 0);
    }

    #[test]
    fn test_dropped_frames_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (mut camera, _) = controller(1);
        camera.renderer.drops_left = 2;

        assert!(camera.capture_frame(dir.path(), None).is_ok());

        let (camera, _) = controller(1);
        let mut camera = camera.with_render_attempts(2);
        camera.renderer.drops_left = 2;
        assert!(matches!(
            camera.capture_frame(dir.path(), None),
            Err(CameraError::Renderer(EnvError::FrameDropped(_)))
        ));
    }

    #[test]
    fn test_renderer_closed_once_on_drop() {
        let (mut camera, closes) = controller(1);
        camera.release();
        drop(camera);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_overview_pose_frames_scene() {
        let bounds = SceneBounds::new(Vector3::new(-5.0, 0.0, -4.0), Vector3::new(5.0, 3.0, 4.0));
        let pose = overview_pose(&bounds);

        // min height 1.5 + 10 * 0.6 = 7.5 beats the fitted 3.87
        assert_relative_eq!(pose.position, Vector3::new(0.0, 11.25, 4.8), epsilon = 1e-9);
        let forward = pose.forward();
        assert!(forward.y < -0.8);
        assert!(forward.z < 0.0);
    }

    #[test]
    fn test_capture_overview_leaves_trajectory() {
        let dir = tempfile::tempdir().unwrap();
        let (mut camera, _) = controller(2);
        camera.jump_to_viewpoint(0).unwrap();

        let path = camera.capture_overview(dir.path()).unwrap();

        assert!(path.ends_with("overview.png"));
        assert!(!camera.state().on_recorded_trajectory);
        assert_eq!(camera.renderer().renders, 1);
    }
}
