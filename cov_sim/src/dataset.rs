//! Synthetic episode writer.
//!
//! Lays out an episode exactly like a real HM3D capture, so the same path
//! resolution and viewpoint loading code runs against it:
//!
//! ```text
//! <dataset>/<episode>/<scene>.glb        scene bounds (JSON, read by SimSceneLoader)
//! <dataset>/<episode>/pose/<n>.txt       4x4 camera-to-world matrix
//! <dataset>/<episode>/comp_color/<n>.png frame rendered at that pose
//! ```

use crate::renderer::SimRenderer;
use cov_env::{Pose, SceneBounds};
use nalgebra::{UnitQuaternion, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default simulated room.
pub fn default_bounds() -> SceneBounds {
    SceneBounds::new(Vector3::new(-4.0, 0.0, -3.0), Vector3::new(4.0, 3.0, 3.0))
}

/// Writes seeded synthetic episodes.
#[derive(Debug, Clone)]
pub struct DatasetWriter {
    seed: u64,
    frames: usize,
    bounds: SceneBounds,
}

impl DatasetWriter {
    /// Creates a writer producing 60 frames in the default room.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            frames: 60,
            bounds: default_bounds(),
        }
    }

    /// Number of recorded frames before sub-sampling.
    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_bounds(mut self, bounds: SceneBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn bounds(&self) -> SceneBounds {
        self.bounds
    }

    /// Generates the recorded trajectory: camera height jitters around
    /// 1.5 m, positions keep a margin from the walls, yaw is uniform.
    pub fn poses(&self) -> Vec<Pose> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let margin = 0.5;
        let (min, max) = (self.bounds.min, self.bounds.max);

        (0..self.frames)
            .map(|_| {
                let x = rng.gen_range(min.x + margin..max.x - margin);
                let z = rng.gen_range(min.z + margin..max.z - margin);
                let jitter: f64 = rng.sample(StandardNormal);
                let y = (1.5 + 0.05 * jitter).clamp(min.y + 0.1, max.y - 0.1);
                let yaw = rng.gen_range(0.0..std::f64::consts::TAU);
                Pose::new(
                    Vector3::new(x, y, z),
                    UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw),
                )
            })
            .collect()
    }

    /// Writes one episode under `dataset_dir` and returns its directory.
    pub fn write_episode(&self, dataset_dir: &Path, episode_history: &str) -> std::io::Result<PathBuf> {
        let episode_dir = dataset_dir.join(episode_history);
        let pose_dir = episode_dir.join("pose");
        let image_dir = episode_dir.join("comp_color");
        std::fs::create_dir_all(&pose_dir)?;
        std::fs::create_dir_all(&image_dir)?;

        let scene = episode_history.rsplit('-').next().unwrap_or(episode_history);
        let bounds_json = serde_json::to_string_pretty(&self.bounds)?;
        std::fs::write(episode_dir.join(format!("{scene}.glb")), bounds_json)?;

        let renderer = SimRenderer::new(self.bounds);
        for (i, pose) in self.poses().iter().enumerate() {
            std::fs::write(pose_dir.join(format!("{i}.txt")), format_matrix(pose))?;
            renderer
                .frame_at(pose)
                .save(image_dir.join(format!("{i}.png")))
                .map_err(std::io::Error::other)?;
        }

        debug!("Wrote {} frames to {}", self.frames, episode_dir.display());
        Ok(episode_dir)
    }
}

fn format_matrix(pose: &Pose) -> String {
    let m = pose.to_matrix();
    (0..4)
        .map(|r| {
            (0..4)
                .map(|c| format!("{:.9}", m[(r, c)]))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cov_core::viewpoint::{DatasetFamily, ViewpointStore};

    #[test]
    fn test_poses_are_seeded() {
        assert_eq!(DatasetWriter::new(3).poses(), DatasetWriter::new(3).poses());
        assert_ne!(DatasetWriter::new(3).poses(), DatasetWriter::new(4).poses());
    }

    #[test]
    fn test_poses_stay_inside() {
        let writer = DatasetWriter::new(11).with_frames(200);
        assert!(writer.poses().iter().all(|p| writer.bounds().contains(&p.position)));
    }

    #[test]
    fn test_written_episode_loads() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DatasetWriter::new(5).with_frames(30);
        let episode = writer.write_episode(dir.path(), "hm3d-v0/000-hm3d-Sim").unwrap();

        assert!(episode.join("Sim.glb").exists());
        let stride = DatasetFamily::from_scene_path(&episode).stride();
        let store = ViewpointStore::load(&episode.join("pose"), &episode.join("comp_color"), stride).unwrap();

        assert_eq!(store.len(), 3);
        let expected = writer.poses()[10].position;
        assert!((store.get(1).unwrap().pose.position - expected).norm() < 1e-6);
    }
}
