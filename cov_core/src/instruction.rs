//! Instruction micro-language extracted from free-text VLM replies.
//!
//! Three token shapes are recognized anywhere in the text, each possibly
//! several times:
//!
//! ```text
//! <direction>-movement+<steps>     forward-movement+3
//! <label>-rotation+<degrees>       left-rotation+20, turn_right-rotation+45
//! switch[ing][ to view <index>]    switch to view 7, switching
//! ```
//!
//! Everything else is ignored. The model wraps its instructions in prose,
//! so extraction never fails; at worst it yields nothing.

use cov_env::PrimitiveAction;
use serde::{Deserialize, Serialize};

const MOVEMENT_KEYWORD: &str = "-movement+";
const ROTATION_KEYWORD: &str = "-rotation+";
const SWITCH_KEYWORD: &str = "switch";
const SWITCH_TARGET_PREFIX: &str = " to view ";

/// Translation directions, relative to the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoveDirection {
    Forward,
    Backward,
    Left,
    Right,
    Upward,
    Downward,
}

impl MoveDirection {
    /// Maps a direction token (case-insensitive) to a direction.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_lowercase().as_str() {
            "forward" => Some(MoveDirection::Forward),
            "backward" => Some(MoveDirection::Backward),
            "left" => Some(MoveDirection::Left),
            "right" => Some(MoveDirection::Right),
            "upward" => Some(MoveDirection::Upward),
            "downward" => Some(MoveDirection::Downward),
            _ => None,
        }
    }

    /// Renderer primitive executed once per step.
    pub fn primitive(&self) -> PrimitiveAction {
        match self {
            MoveDirection::Forward => PrimitiveAction::MoveForward,
            MoveDirection::Backward => PrimitiveAction::MoveBackward,
            MoveDirection::Left => PrimitiveAction::MoveLeft,
            MoveDirection::Right => PrimitiveAction::MoveRight,
            MoveDirection::Upward => PrimitiveAction::MoveUp,
            MoveDirection::Downward => PrimitiveAction::MoveDown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MoveDirection::Forward => "forward",
            MoveDirection::Backward => "backward",
            MoveDirection::Left => "left",
            MoveDirection::Right => "right",
            MoveDirection::Upward => "upward",
            MoveDirection::Downward => "downward",
        }
    }
}

/// Horizontal rotation sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RotationDirection {
    /// Counter-clockwise seen from above, positive angle
    Left,
    /// Clockwise seen from above, negative angle
    Right,
}

impl RotationDirection {
    /// Classifies a rotation label. Any label mentioning "right" is a right
    /// turn; otherwise one mentioning "left" is a left turn.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.to_lowercase();
        if label.contains("right") {
            Some(RotationDirection::Right)
        } else if label.contains("left") {
            Some(RotationDirection::Left)
        } else {
            None
        }
    }

    /// Applies the controller's sign convention to a magnitude.
    pub fn signed(&self, degrees: u32) -> f64 {
        match self {
            RotationDirection::Left => degrees as f64,
            RotationDirection::Right => -(degrees as f64),
        }
    }
}

/// One structured camera instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Instruction {
    /// Repeat a primitive translation `steps` times
    Movement { direction: MoveDirection, steps: u32 },

    /// Rotate about the vertical axis
    Rotation { direction: RotationDirection, degrees: u32 },

    /// Jump to a recorded viewpoint, or back to the last one when `target` is `None`
    ViewSwitch { target: Option<usize> },
}

impl Instruction {
    /// Signed angle handed to the camera for rotations.
    pub fn signed_degrees(&self) -> Option<f64> {
        match self {
            Instruction::Rotation { direction, degrees } => Some(direction.signed(*degrees)),
            _ => None,
        }
    }
}

/// Extracts every instruction from a reply.
///
/// The result lists all movements, then all rotations, then all view
/// switches, each group in text order.
pub fn parse(text: &str) -> Vec<Instruction> {
    let mut instructions = Vec::new();

    for (label, steps) in scan_labelled(text, MOVEMENT_KEYWORD) {
        if let Some(direction) = MoveDirection::from_token(label) {
            instructions.push(Instruction::Movement { direction, steps });
        }
    }

    for (label, degrees) in scan_labelled(text, ROTATION_KEYWORD) {
        if let Some(direction) = RotationDirection::from_label(label) {
            instructions.push(Instruction::Rotation { direction, degrees });
        }
    }

    for target in scan_switches(text) {
        instructions.push(Instruction::ViewSwitch { target });
    }

    instructions
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn leading_digits(text: &str) -> usize {
    text.bytes().take_while(u8::is_ascii_digit).count()
}

/// Finds `<word><keyword><digits>` occurrences, left to right, without
/// letting a label reach back into the previous match.
fn scan_labelled<'a>(text: &'a str, keyword: &str) -> Vec<(&'a str, u32)> {
    let mut found = Vec::new();
    let mut floor = 0;
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find(keyword) {
        let at = cursor + offset;
        let label_start = text[floor..at]
            .char_indices()
            .rev()
            .take_while(|(_, c)| is_word_char(*c))
            .last()
            .map(|(i, _)| floor + i);
        let digits_start = at + keyword.len();
        let digits = leading_digits(&text[digits_start..]);

        match label_start {
            Some(start) if digits > 0 => {
                let end = digits_start + digits;
                // Counts too large for u32 are not meaningful camera input
                if let Ok(value) = text[digits_start..end].parse::<u32>() {
                    found.push((&text[start..at], value));
                }
                floor = end;
                cursor = end;
            }
            _ => cursor = at + 1,
        }
    }

    found
}

fn scan_switches(text: &str) -> Vec<Option<usize>> {
    let mut found = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find(SWITCH_KEYWORD) {
        cursor += offset + SWITCH_KEYWORD.len();
        if text[cursor..].starts_with("ing") {
            cursor += 3;
        }

        let mut target = None;
        if let Some(rest) = text[cursor..].strip_prefix(SWITCH_TARGET_PREFIX) {
            let digits = leading_digits(rest);
            if digits > 0 {
                // An index that overflows is still an index, just an invalid one
                target = Some(rest[..digits].parse::<usize>().unwrap_or(usize::MAX));
                cursor += SWITCH_TARGET_PREFIX.len() + digits;
            }
        }
        found.push(target);
    }

    found
}
