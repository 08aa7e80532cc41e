//! Common types shared between the CoV core and its collaborators.

use nalgebra::{Isometry3, Matrix3, Matrix4, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::path::PathBuf;

/// Distance covered by one primitive move (scene units).
pub const MOVE_STEP: f64 = 0.4;

/// Angle covered by one primitive turn (degrees).
pub const TURN_STEP_DEGREES: f64 = 10.0;

/// Rigid camera pose in world coordinates.
///
/// Follows the renderer convention: +Y is up and the camera looks down -Z.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Camera center
    pub position: Vector3<f64>,

    /// Camera orientation
    pub rotation: UnitQuaternion<f64>,
}

impl Pose {
    /// Creates a pose from a position and an orientation.
    pub fn new(position: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self { position, rotation }
    }

    /// Pose at the origin looking down -Z.
    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }

    /// Builds a pose from a 4x4 rigid transform (rotation + translation).
    ///
    /// The upper-left 3x3 block is re-orthonormalized, so slightly noisy
    /// matrices from text files still yield a valid rotation.
    pub fn from_matrix(matrix: &Matrix4<f64>) -> Self {
        let linear: Matrix3<f64> = matrix.fixed_view::<3, 3>(0, 0).into_owned();
        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&linear));
        let position = Vector3::new(matrix[(0, 3)], matrix[(1, 3)], matrix[(2, 3)]);
        Self { position, rotation }
    }

    /// Returns the pose as an isometry.
    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.rotation)
    }

    /// Returns the pose as a homogeneous 4x4 matrix.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        self.isometry().to_homogeneous()
    }

    /// Unit vector the camera is looking along.
    pub fn forward(&self) -> Vector3<f64> {
        self.rotation * -Vector3::z()
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Axis-aligned bounding volume of a loaded scene.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneBounds {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl SceneBounds {
    /// Creates bounds from two corners.
    pub fn new(min: Vector3<f64>, max: Vector3<f64>) -> Self {
        Self { min, max }
    }

    /// Center of the volume.
    pub fn center(&self) -> Vector3<f64> {
        (self.min + self.max) / 2.0
    }

    /// Extent along each axis.
    pub fn size(&self) -> Vector3<f64> {
        self.max - self.min
    }

    /// Returns true if the point lies inside (or on) the volume.
    pub fn contains(&self, point: &Vector3<f64>) -> bool {
        (0..3).all(|i| point[i] >= self.min[i] && point[i] <= self.max[i])
    }
}

/// Discrete actions every renderer must support.
///
/// Moves cover `MOVE_STEP` units, turns cover `TURN_STEP_DEGREES` about +Y.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveAction {
    MoveForward,
    MoveBackward,
    MoveLeft,
    MoveRight,
    MoveUp,
    MoveDown,
    TurnLeft,
    TurnRight,
}

impl PrimitiveAction {
    /// Returns the renderer action name.
    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveAction::MoveForward => "move_forward",
            PrimitiveAction::MoveBackward => "move_backward",
            PrimitiveAction::MoveLeft => "move_left",
            PrimitiveAction::MoveRight => "move_right",
            PrimitiveAction::MoveUp => "move_up",
            PrimitiveAction::MoveDown => "move_down",
            PrimitiveAction::TurnLeft => "turn_left",
            PrimitiveAction::TurnRight => "turn_right",
        }
    }

    /// Returns true for the two turn actions.
    pub fn is_turn(&self) -> bool {
        matches!(self, PrimitiveAction::TurnLeft | PrimitiveAction::TurnRight)
    }
}

impl std::fmt::Display for PrimitiveAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One message in a VLM conversation: text plus an optional image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
}

impl ChatTurn {
    /// A text-only user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
            image: None,
        }
    }

    /// A user message carrying an image.
    pub fn user_with_image(text: impl Into<String>, image: impl Into<PathBuf>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
            image: Some(image.into()),
        }
    }

    /// A reply previously produced by the model.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            text: text.into(),
            image: None,
        }
    }
}

/// A complete chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlmRequest {
    pub system_prompt: String,
    pub turns: Vec<ChatTurn>,
    pub temperature: f32,
}

impl VlmRequest {
    /// Creates a deterministic (temperature 0) request.
    pub fn new(system_prompt: impl Into<String>, turns: Vec<ChatTurn>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            turns,
            temperature: 0.0,
        }
    }

    /// Text of the final user turn, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == ChatRole::User)
            .map(|t| t.text.as_str())
    }
}

/// Token accounting reported by the model provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

/// A chat completion result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlmResponse {
    /// Raw message content, thinking segment included
    pub content: String,

    #[serde(default)]
    pub usage: TokenUsage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pose_matrix_round_trip() {
        let rotation = UnitQuaternion::from_euler_angles(0.1, 0.7, -0.3);
        let pose = Pose::new(Vector3::new(1.0, 2.0, -3.5), rotation);

        let restored = Pose::from_matrix(&pose.to_matrix());

        assert_relative_eq!(restored.position, pose.position, epsilon = 1e-9);
        assert!(restored.rotation.angle_to(&pose.rotation) < 1e-6);
    }

    #[test]
    fn test_identity_looks_down_negative_z() {
        let forward = Pose::identity().forward();
        assert_relative_eq!(forward, Vector3::new(0.0, 0.0, -1.0));
    }

    #[test]
    fn test_scene_bounds_geometry() {
        let bounds = SceneBounds::new(Vector3::new(-2.0, 0.0, -4.0), Vector3::new(2.0, 3.0, 4.0));

        assert_relative_eq!(bounds.center(), Vector3::new(0.0, 1.5, 0.0));
        assert_relative_eq!(bounds.size(), Vector3::new(4.0, 3.0, 8.0));
        assert!(bounds.contains(&Vector3::new(2.0, 3.0, 4.0)));
        assert!(!bounds.contains(&Vector3::new(0.0, -0.1, 0.0)));
    }

    #[test]
    fn test_token_usage_accumulates() {
        let mut total = TokenUsage::default();
        total += TokenUsage { prompt_tokens: 10, completion_tokens: 2, total_tokens: 12 };
        total += TokenUsage { prompt_tokens: 5, completion_tokens: 1, total_tokens: 6 };

        assert_eq!(total, TokenUsage { prompt_tokens: 15, completion_tokens: 3, total_tokens: 18 });
    }

    #[test]
    fn test_last_user_text_skips_assistant() {
        let request = VlmRequest::new(
            "system",
            vec![ChatTurn::user("first"), ChatTurn::user("second"), ChatTurn::assistant("reply")],
        );

        assert_eq!(request.last_user_text(), Some("second"));
        assert_eq!(request.temperature, 0.0);
    }
}
