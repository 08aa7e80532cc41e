//! CoV Core - Chain-of-View embodied question answering
//!
//! An agent answers a question about a 3D scene by steering a camera
//! through recorded viewpoints and free motion, guided turn by turn by a
//! vision-language model:
//! 1. **Instruction parsing**: free-text VLM replies become typed camera instructions
//! 2. **Camera control**: a recorded/free-motion state machine over a `SceneRenderer`
//! 3. **Dialogue session**: the bounded turn loop with blank-view recovery and
//!    repetition breaking

pub mod answer;
pub mod baseline;
pub mod blank;
pub mod camera;
pub mod conversation;
pub mod instruction;
pub mod prompts;
pub mod session;
pub mod viewpoint;

// Re-export key types for convenience
pub use answer::{extract_answer, is_terminal, parse_selected_views, requests_overview, strip_thinking};
pub use baseline::run_baseline;
pub use blank::{is_blank, is_blank_file, BLANK_THRESHOLD};
pub use camera::{overview_pose, ApplyReport, CameraController, CameraError, CameraState};
pub use conversation::Conversation;
pub use instruction::{parse, Instruction, MoveDirection, RotationDirection};
pub use session::{
    DialogueSession, DialogueTurn, PromptKind, QuestionResult, Question, SessionConfig,
    SessionError, SessionId, SessionState,
};
pub use viewpoint::{DatasetFamily, Viewpoint, ViewpointError, ViewpointStore};
