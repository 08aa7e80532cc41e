//! CoV Environment Abstraction Layer
//!
//! This crate is the boundary between the CoV agent core and the two
//! external collaborators it drives:
//!
//! - **Scene renderer**: pose control, primitive motion, frame rendering and
//!   scene bounds (`SceneRenderer`, `SceneLoader`)
//! - **Vision-language model**: a blocking request/response chat completion
//!   over text and images (`VisionLanguageModel`)
//!
//! The core depends only on these traits. Production plugs in a real
//! renderer and `OpenAiVlm`; the simulation harness plugs in deterministic
//! stand-ins.
//!
//! # Example
//!
//! ```ignore
//! use cov_env::{SceneRenderer, PrimitiveAction, VisionLanguageModel, VlmRequest};
//!
//! async fn look_around<R: SceneRenderer, V: VisionLanguageModel>(
//!     renderer: &mut R,
//!     vlm: &V,
//!     request: &VlmRequest,
//! ) -> Result<String, cov_env::EnvError> {
//!     renderer.step(PrimitiveAction::TurnLeft)?;
//!     let frame = renderer.render()?;
//!     let reply = vlm.complete(request).await?;
//!     Ok(reply.content)
//! }
//! ```

mod config;
mod error;
mod openai_impl;
mod renderer;
mod types;
mod vlm;

pub use config::{ModelConfig, ModelPreset};
pub use error::EnvError;
pub use openai_impl::OpenAiVlm;
pub use renderer::{SceneLoader, SceneRenderer};
pub use types::{
    ChatRole, ChatTurn, PrimitiveAction, Pose, SceneBounds, TokenUsage, VlmRequest, VlmResponse,
    MOVE_STEP, TURN_STEP_DEGREES,
};
pub use vlm::VisionLanguageModel;
