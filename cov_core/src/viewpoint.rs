//! Recorded viewpoints: camera poses from the exploration trajectory paired
//! with their pre-rendered images.
//!
//! A dataset provides one pose file (plain-text 4x4 matrix) and one image per
//! recorded frame. Both lists are sorted in natural filename order, zipped,
//! and sub-sampled at a fixed stride.

use cov_env::Pose;
use nalgebra::Matrix4;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Errors loading a viewpoint store.
#[derive(Debug, Error)]
pub enum ViewpointError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed pose file {path}: {reason}")]
    MalformedPose { path: PathBuf, reason: String },

    #[error("Found {poses} pose files but {images} images")]
    CountMismatch { poses: usize, images: usize },

    #[error("Sub-sampling stride must be at least 1")]
    InvalidStride,
}

/// Dataset families with their sub-sampling strides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFamily {
    /// HM3D: sparse trajectories, keep every 10th frame
    Hm3d,
    /// ScanNet: dense video, keep every 60th frame
    ScanNet,
}

impl DatasetFamily {
    /// Infers the family from a scene or episode path.
    pub fn from_scene_path(path: &Path) -> Self {
        if path.to_string_lossy().contains("hm3d") {
            DatasetFamily::Hm3d
        } else {
            DatasetFamily::ScanNet
        }
    }

    /// Sub-sampling stride for this family.
    pub fn stride(&self) -> usize {
        match self {
            DatasetFamily::Hm3d => 10,
            DatasetFamily::ScanNet => 60,
        }
    }
}

/// A recorded camera pose and its image.
#[derive(Debug, Clone, PartialEq)]
pub struct Viewpoint {
    /// Position in the sub-sampled store (what the model calls "view id")
    pub index: usize,
    pub pose: Pose,
    pub image: PathBuf,
}

/// Ordered, immutable collection of viewpoints.
#[derive(Debug, Clone, Default)]
pub struct ViewpointStore {
    viewpoints: Vec<Viewpoint>,
}

impl ViewpointStore {
    /// Loads `*.txt` poses and `*.png` images and keeps every `stride`-th pair.
    ///
    /// Pose and image directories may be the same directory.
    pub fn load(pose_dir: &Path, image_dir: &Path, stride: usize) -> Result<Self, ViewpointError> {
        if stride == 0 {
            return Err(ViewpointError::InvalidStride);
        }

        let pose_files = list_files(pose_dir, "txt")?;
        let image_files = list_files(image_dir, "png")?;
        if pose_files.len() != image_files.len() {
            return Err(ViewpointError::CountMismatch {
                poses: pose_files.len(),
                images: image_files.len(),
            });
        }

        let mut viewpoints = Vec::new();
        for (index, (pose_file, image)) in pose_files
            .into_iter()
            .zip(image_files)
            .step_by(stride)
            .enumerate()
        {
            let pose = read_pose_file(&pose_file)?;
            viewpoints.push(Viewpoint { index, pose, image });
        }

        info!(
            "Loaded {} viewpoints from {} (stride {})",
            viewpoints.len(),
            pose_dir.display(),
            stride
        );

        Ok(Self { viewpoints })
    }

    /// Builds a store from in-memory viewpoints, renumbering them in order.
    pub fn from_viewpoints(viewpoints: Vec<Viewpoint>) -> Self {
        let viewpoints = viewpoints
            .into_iter()
            .enumerate()
            .map(|(index, v)| Viewpoint { index, ..v })
            .collect();
        Self { viewpoints }
    }

    pub fn get(&self, index: usize) -> Option<&Viewpoint> {
        self.viewpoints.get(index)
    }

    pub fn len(&self) -> usize {
        self.viewpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Viewpoint> {
        self.viewpoints.iter()
    }

    /// Image paths in view-id order.
    pub fn image_paths(&self) -> Vec<PathBuf> {
        self.viewpoints.iter().map(|v| v.image.clone()).collect()
    }
}

/// Reads a plain-text 4x4 pose matrix (row-major, whitespace or comma separated).
pub fn read_pose_file(path: &Path) -> Result<Pose, ViewpointError> {
    let text = std::fs::read_to_string(path).map_err(|source| ViewpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let matrix = parse_pose_matrix(&text).map_err(|reason| ViewpointError::MalformedPose {
        path: path.to_path_buf(),
        reason,
    })?;
    Ok(Pose::from_matrix(&matrix))
}

/// Parses the 16 entries of a row-major 4x4 matrix.
pub fn parse_pose_matrix(text: &str) -> Result<Matrix4<f64>, String> {
    let values = text
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().map_err(|e| format!("{s:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;

    if values.len() != 16 {
        return Err(format!("expected 16 values, found {}", values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err("non-finite entry".to_string());
    }

    Ok(Matrix4::from_row_slice(&values))
}

fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, ViewpointError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ViewpointError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|source| ViewpointError::Io { path: dir.to_path_buf(), source })?
            .path();
        if path.is_file() && path.extension().is_some_and(|e| e == extension) {
            files.push(path);
        }
    }

    files.sort_by(|a, b| natural_cmp(&file_stem(a), &file_stem(b)));
    Ok(files)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Natural ordering: digit runs compare by numeric value, so `frame2`
/// sorts before `frame10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let run_a = take_digits(&mut left);
                let run_b = take_digits(&mut right);
                let ord = compare_digit_runs(&run_a, &run_b);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        run.push(c);
        chars.next();
    }
    run
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
        .then_with(|| a.len().cmp(&b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    const IDENTITY_AT_123: &str = "1 0 0 1\n0 1 0 2\n0 0 1 3\n0 0 0 1\n";

    fn write_dataset(dir: &Path, frames: usize) {
        for i in 0..frames {
            let pose = format!("1 0 0 {i}\n0 1 0 0\n0 0 1 0\n0 0 0 1\n");
            std::fs::write(dir.join(format!("{i}.txt")), pose).unwrap();
            std::fs::write(dir.join(format!("{i}.png")), b"png").unwrap();
        }
    }

    #[test]
    fn test_natural_order() {
        let mut names = vec!["frame10", "frame2", "frame1", "frame02", "frame"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["frame", "frame1", "frame2", "frame02", "frame10"]);
    }

    #[test]
    fn test_parse_pose_matrix() {
        let matrix = parse_pose_matrix(IDENTITY_AT_123).unwrap();
        let pose = Pose::from_matrix(&matrix);
        assert_relative_eq!(pose.position, Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_parse_pose_matrix_rejects_short_input() {
        assert!(parse_pose_matrix("1 0 0\n0 1 0").is_err());
        assert!(parse_pose_matrix("1 0 0 nan 0 1 0 0 0 0 1 0 0 0 0 1").is_err());
    }

    #[test]
    fn test_load_subsamples_in_natural_order() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), 25);

        let store = ViewpointStore::load(dir.path(), dir.path(), 10).unwrap();

        assert_eq!(store.len(), 3);
        let xs: Vec<f64> = store.iter().map(|v| v.pose.position.x).collect();
        assert_eq!(xs, vec![0.0, 10.0, 20.0]);
        assert_eq!(store.get(2).unwrap().index, 2);
        assert!(store.get(2).unwrap().image.ends_with("20.png"));
    }

    #[test]
    fn test_load_rejects_mismatched_counts() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), 3);
        std::fs::write(dir.path().join("extra.png"), b"png").unwrap();

        let err = ViewpointStore::load(dir.path(), dir.path(), 1).unwrap_err();
        assert!(matches!(err, ViewpointError::CountMismatch { poses: 3, images: 4 }));
    }

    #[test]
    fn test_load_rejects_zero_stride() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ViewpointStore::load(dir.path(), dir.path(), 0),
            Err(ViewpointError::InvalidStride)
        ));
    }

    #[test]
    fn test_dataset_family_stride() {
        assert_eq!(DatasetFamily::from_scene_path(Path::new("hm3d-v0/000-hm3d-BFRy")).stride(), 10);
        assert_eq!(DatasetFamily::from_scene_path(Path::new("scannet-v0/002-scene0709")).stride(), 60);
    }

    #[test]
    fn test_from_viewpoints_renumbers() {
        let v = |i| Viewpoint { index: i, pose: Pose::identity(), image: PathBuf::from("x.png") };
        let store = ViewpointStore::from_viewpoints(vec![v(7), v(3)]);
        assert_eq!(store.iter().map(|v| v.index).collect::<Vec<_>>(), vec![0, 1]);
    }
}
