//! Simulated renderer implementing SceneRenderer for deterministic testing.

use cov_env::{EnvError, Pose, PrimitiveAction, SceneBounds, SceneLoader, SceneRenderer, MOVE_STEP, TURN_STEP_DEGREES};
use image::{Rgb, RgbImage};
use nalgebra::{UnitQuaternion, Vector3};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Default frame size of simulated renders.
pub const FRAME_WIDTH: u32 = 64;
pub const FRAME_HEIGHT: u32 = 48;

/// Counters shared between a `SimRenderer` and the test that owns it.
#[derive(Debug, Clone, Default)]
pub struct ProbeCounts {
    pub renders: u64,
    pub set_pose_calls: u64,
    pub primitives: Vec<PrimitiveAction>,
    pub dropped_frames: u64,
    pub close_calls: u64,
}

/// Observation handle onto a renderer that has been moved into a session.
#[derive(Debug, Clone, Default)]
pub struct RendererProbe {
    counts: Arc<Mutex<ProbeCounts>>,
}

impl RendererProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> ProbeCounts {
        self.counts.lock().unwrap().clone()
    }

    pub fn renders(&self) -> u64 {
        self.counts.lock().unwrap().renders
    }

    pub fn set_pose_calls(&self) -> u64 {
        self.counts.lock().unwrap().set_pose_calls
    }

    pub fn primitives(&self) -> Vec<PrimitiveAction> {
        self.counts.lock().unwrap().primitives.clone()
    }

    /// Total renderer calls of any kind, closing excluded.
    pub fn interactions(&self) -> u64 {
        let counts = self.counts.lock().unwrap();
        counts.renders + counts.set_pose_calls + counts.primitives.len() as u64 + counts.dropped_frames
    }

    pub fn is_closed(&self) -> bool {
        self.counts.lock().unwrap().close_calls > 0
    }

    pub fn close_calls(&self) -> u64 {
        self.counts.lock().unwrap().close_calls
    }

    fn update(&self, f: impl FnOnce(&mut ProbeCounts)) {
        f(&mut self.counts.lock().unwrap());
    }
}

/// In-memory renderer: exact pose bookkeeping and procedural frames.
///
/// Frames are pure white whenever the camera is outside the scene bounds
/// and facing away from it, which is what a mesh renderer shows past the
/// reconstructed geometry.
pub struct SimRenderer {
    pose: Pose,
    bounds: SceneBounds,
    width: u32,
    height: u32,
    frames_to_drop: u32,
    probe: RendererProbe,
}

impl SimRenderer {
    /// Creates a renderer for a scene with the given bounds.
    pub fn new(bounds: SceneBounds) -> Self {
        Self {
            pose: Pose::identity(),
            bounds,
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            frames_to_drop: 0,
            probe: RendererProbe::new(),
        }
    }

    /// Reports calls to the given probe.
    pub fn with_probe(mut self, probe: RendererProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Fails the next `count` renders with `FrameDropped`.
    pub fn with_frame_drops(mut self, count: u32) -> Self {
        self.frames_to_drop = count;
        self
    }

    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn probe(&self) -> RendererProbe {
        self.probe.clone()
    }

    /// Renders the frame seen from `pose` without touching any state.
    pub fn frame_at(&self, pose: &Pose) -> RgbImage {
        let forward = pose.forward();
        let facing_scene = forward.dot(&(self.bounds.center() - pose.position)) > 0.0;
        if !self.bounds.contains(&pose.position) && !facing_scene {
            return RgbImage::from_pixel(self.width, self.height, Rgb([255, 255, 255]));
        }

        let yaw = forward.x.atan2(-forward.z).to_degrees().rem_euclid(360.0);
        let base = [
            (pose.position.x * 40.0).rem_euclid(160.0) as u32,
            (pose.position.z * 40.0).rem_euclid(160.0) as u32,
            (yaw / 360.0 * 160.0) as u32,
        ];

        // Gradients keep every channel below 230, so no pixel is ever blank
        RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([
                (base[0] + x).min(229) as u8,
                (base[1] + y).min(229) as u8,
                (base[2] + (x + y) / 2).min(229) as u8,
            ])
        })
    }
}

impl SceneRenderer for SimRenderer {
    fn pose(&self) -> Pose {
        self.pose
    }

    fn set_pose(&mut self, pose: &Pose) -> Result<(), EnvError> {
        self.pose = *pose;
        self.probe.update(|c| c.set_pose_calls += 1);
        Ok(())
    }

    fn step(&mut self, action: PrimitiveAction) -> Result<(), EnvError> {
        let rotation = self.pose.rotation;
        let forward = rotation * Vector3::new(0.0, 0.0, -1.0);
        let right = rotation * Vector3::new(1.0, 0.0, 0.0);
        let up = Vector3::y();

        match action {
            PrimitiveAction::MoveForward => self.pose.position += forward * MOVE_STEP,
            PrimitiveAction::MoveBackward => self.pose.position -= forward * MOVE_STEP,
            PrimitiveAction::MoveLeft => self.pose.position -= right * MOVE_STEP,
            PrimitiveAction::MoveRight => self.pose.position += right * MOVE_STEP,
            PrimitiveAction::MoveUp => self.pose.position += up * MOVE_STEP,
            PrimitiveAction::MoveDown => self.pose.position -= up * MOVE_STEP,
            PrimitiveAction::TurnLeft | PrimitiveAction::TurnRight => {
                let sign = if action == PrimitiveAction::TurnLeft { 1.0 } else { -1.0 };
                let delta = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), (sign * TURN_STEP_DEGREES).to_radians());
                self.pose.rotation = delta * rotation;
            }
        }

        self.probe.update(|c| c.primitives.push(action));
        Ok(())
    }

    fn render(&mut self) -> Result<RgbImage, EnvError> {
        if self.frames_to_drop > 0 {
            self.frames_to_drop -= 1;
            self.probe.update(|c| c.dropped_frames += 1);
            return Err(EnvError::FrameDropped("simulated frame drop".to_string()));
        }

        self.probe.update(|c| c.renders += 1);
        Ok(self.frame_at(&self.pose))
    }

    fn scene_bounds(&self) -> Result<SceneBounds, EnvError> {
        Ok(self.bounds)
    }

    fn close(&mut self) {
        self.probe.update(|c| c.close_calls += 1);
    }
}

/// Loads simulated scenes: the scene file holds the bounds as JSON.
#[derive(Debug, Clone, Default)]
pub struct SimSceneLoader {
    probe: Option<RendererProbe>,
    frame_drops: u32,
}

impl SimSceneLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every loaded renderer reports to `probe`.
    pub fn with_probe(mut self, probe: RendererProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_frame_drops(mut self, count: u32) -> Self {
        self.frame_drops = count;
        self
    }
}

impl SceneLoader for SimSceneLoader {
    type Renderer = SimRenderer;

    fn load_scene(&self, scene_file: &Path) -> Result<SimRenderer, EnvError> {
        let text = std::fs::read_to_string(scene_file)
            .map_err(|e| EnvError::scene(format!("{}: {e}", scene_file.display())))?;
        let bounds: SceneBounds = serde_json::from_str(&text)
            .map_err(|e| EnvError::scene(format!("{}: {e}", scene_file.display())))?;

        let mut renderer = SimRenderer::new(bounds).with_frame_drops(self.frame_drops);
        if let Some(probe) = &self.probe {
            renderer = renderer.with_probe(probe.clone());
        }
        Ok(renderer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cov_core::blank::blank_ratio;
    use cov_core::overview_pose;
    use image::DynamicImage;

    fn room() -> SceneBounds {
        SceneBounds::new(Vector3::new(-4.0, 0.0, -3.0), Vector3::new(4.0, 3.0, 3.0))
    }

    #[test]
    fn test_forward_moves_along_minus_z() {
        let mut renderer = SimRenderer::new(room());
        renderer.step(PrimitiveAction::MoveForward).unwrap();
        assert!((renderer.pose().position.z + MOVE_STEP).abs() < 1e-12);
    }

    #[test]
    fn test_turns_are_camera_relative() {
        let mut renderer = SimRenderer::new(room());
        for _ in 0..9 {
            renderer.step(PrimitiveAction::TurnRight).unwrap();
        }
        renderer.step(PrimitiveAction::MoveForward).unwrap();

        // Facing +X after a 90 degree right turn
        let p = renderer.pose().position;
        assert!((p.x - MOVE_STEP).abs() < 1e-9);
        assert!(p.z.abs() < 1e-9);
    }

    #[test]
    fn test_frames_inside_are_never_blank() {
        let renderer = SimRenderer::new(room());
        let pose = Pose::new(Vector3::new(3.9, 1.0, 2.9), UnitQuaternion::identity());
        let frame = DynamicImage::ImageRgb8(renderer.frame_at(&pose));
        assert_eq!(blank_ratio(&frame), 0.0);
    }

    #[test]
    fn test_frames_outside_are_blank() {
        let renderer = SimRenderer::new(room());
        let pose = Pose::new(Vector3::new(0.0, 1.0, -50.0), UnitQuaternion::identity());
        let frame = DynamicImage::ImageRgb8(renderer.frame_at(&pose));
        assert_eq!(blank_ratio(&frame), 1.0);
    }

    #[test]
    fn test_overview_sees_the_scene() {
        let renderer = SimRenderer::new(room());
        let frame = DynamicImage::ImageRgb8(renderer.frame_at(&overview_pose(&room())));
        assert_eq!(blank_ratio(&frame), 0.0);
    }

    #[test]
    fn test_probe_counts_calls() {
        let probe = RendererProbe::new();
        let mut renderer = SimRenderer::new(room()).with_probe(probe.clone()).with_frame_drops(1);

        assert!(renderer.render().is_err());
        renderer.render().unwrap();
        renderer.set_pose(&Pose::identity()).unwrap();
        renderer.step(PrimitiveAction::TurnLeft).unwrap();
        renderer.close();

        let counts = probe.snapshot();
        assert_eq!(counts.renders, 1);
        assert_eq!(counts.dropped_frames, 1);
        assert_eq!(counts.set_pose_calls, 1);
        assert_eq!(counts.primitives, vec![PrimitiveAction::TurnLeft]);
        assert!(probe.is_closed());
    }

    #[test]
    fn test_loader_reads_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let scene = dir.path().join("room.glb");
        std::fs::write(&scene, serde_json::to_string(&room()).unwrap()).unwrap();

        let renderer = SimSceneLoader::new().load_scene(&scene).unwrap();
        assert_eq!(renderer.scene_bounds().unwrap(), room());

        let missing = SimSceneLoader::new().load_scene(&dir.path().join("nope.glb"));
        assert!(matches!(missing, Err(EnvError::SceneError(_))));
    }
}
