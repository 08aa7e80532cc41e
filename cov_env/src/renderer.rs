//! Scene renderer abstraction for the CoV camera controller.

use crate::error::EnvError;
use crate::types::{Pose, PrimitiveAction, SceneBounds};
use image::RgbImage;
use std::path::Path;

/// A live renderer instance holding one loaded scene.
///
/// # Implementations
///
/// - **Production**: a mesh renderer/simulator bound through FFI or IPC
/// - **Simulation**: `cov_sim::SimRenderer` with call probes
///
/// # Ownership
///
/// An instance holds session-scoped state (current pose, loaded scene, and
/// usually GPU or OS resources). It is owned by exactly one camera
/// controller and must never be shared between sessions. `close` is called
/// exactly once when that controller is dropped.
pub trait SceneRenderer: Send {
    /// Returns the current camera pose.
    fn pose(&self) -> Pose;
    
    /// Teleports the camera to the given pose.
    fn set_pose(&mut self, pose: &Pose) -> Result<(), EnvError>;
    
    /// Executes one discrete primitive relative to the current pose.
    fn step(&mut self, action: PrimitiveAction) -> Result<(), EnvError>;
    
    /// Renders the current view.
    ///
    /// # Returns
    /// * `Ok(frame)` - Raw RGB frame
    /// * `Err(EnvError::FrameDropped)` - Transient, the caller may retry
    fn render(&mut self) -> Result<RgbImage, EnvError>;
    
    /// Returns the world-space bounding volume of the loaded scene.
    fn scene_bounds(&self) -> Result<SceneBounds, EnvError>;
    
    /// Releases the scene and any resources held by the instance.
    fn close(&mut self);
}

/// Factory for renderer instances, one per question.
pub trait SceneLoader {
    /// Renderer type produced by this loader.
    type Renderer: SceneRenderer;
    
    /// Loads a scene file into a fresh renderer instance.
    ///
    /// # Returns
    /// * `Err(EnvError::SceneError)` - File missing or malformed (fatal)
    fn load_scene(&self, scene_file: &Path) -> Result<Self::Renderer, EnvError>;
}
