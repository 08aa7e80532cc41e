//! Prompt text sent to the VLM.

/// System prompt for the navigation dialogue.
pub fn chat_system_prompt(question: &str, view_count: usize, max_views: usize, min_action_step: u32) -> String {
    format!(
        "You are an embodied agent answering a question about a 3D indoor scene.\n\
         Question: {question}\n\n\
         The scene was recorded from {view_count} viewpoints with ids 0 to {last}. \
         You have been shown up to {max_views} of the most relevant views and a bird's-eye \
         image of the whole scene. After each of your replies you receive the image from the \
         current camera.\n\n\
         Adjust the camera with these instructions:\n\
         - <direction>-movement+<steps> with direction one of forward, backward, left, right, \
         upward, downward; each step is 0.4 meters.\n\
         - <left|right>-rotation+<degrees> to turn the camera horizontally.\n\
         - switch to view <id> to jump to a recorded viewpoint.\n\
         - switch to bird-eye-view to see the overview image again.\n\n\
         Take at least {min_action_step} actions before answering. When you have enough \
         information, reply with done+[answer].",
        last = view_count.saturating_sub(1),
    )
}

/// System prompt for the view selection call.
pub fn selection_system_prompt(question: &str, view_count: usize, max_views: usize) -> String {
    format!(
        "You will see {view_count} images of a 3D indoor scene, labelled with view ids 0 to {last}.\n\
         Question: {question}\n\n\
         Select at most {max_views} views that are most useful for answering the question. \
         Reply with the pattern 'Selected views: [id1, id2, ...]'.",
        last = view_count.saturating_sub(1),
    )
}

/// System prompt for the all-images baseline.
pub fn baseline_system_prompt(question: &str) -> String {
    format!(
        "You will see images of a 3D indoor scene. Answer the question using only these images.\n\
         Question: {question}"
    )
}

/// Regular per-turn prompt.
pub fn step_prompt(step: u32, min_action_step: u32) -> String {
    format!(
        "Here is the provided view image based on your adjustment. Currently you are in step {step}. \
         Perform ONLY ONE action per step. Remember your minimum action step budget is {min_action_step}. \
         If you have reached minimum step budget and you are sure you have collected enough \
         information, give your answer following pattern 'done+[answer]'."
    )
}

pub const SELECTION_QUERY: &str =
    "Give your selection following the pattern 'Selected views: [id1, id2, ...]'.";

pub const BLANK_VIEW_PROMPT: &str = "You are moving to a blank view and I switched back. \
     Please resume from the view I provided and continue to give adjustment instructions or provide answer.";

pub const REPETITION_PROMPT: &str = "You have repeated this instruction too many times. \
     Please try to use other instructions to get the proper view or answer the question if you can.";

pub const BASELINE_QUERY: &str =
    "Your answer should STRICTLY FOLLOW the pattern 'done+[answer]'. Please give your answer:";

pub const OVERVIEW_LABEL: &str = "This is the image of the scene from bird eye's view for your reference";

/// Notice prefixed to the next prompt after switches to missing views.
pub fn invalid_view_notice(targets: &[usize], view_count: usize) -> String {
    let ids = targets
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "View id {ids} does not exist, valid ids are 0 to {}. That switch was skipped.",
        view_count.saturating_sub(1)
    )
}

/// Notice prefixed to the next prompt after "switch back" with no view to return to.
pub const NO_VIEW_TO_RESTORE_NOTICE: &str =
    "There is no previous view to switch back to. That switch was skipped.";

pub fn best_view_label(view_id: usize) -> String {
    format!("This is one of the best images, corresponding to view id: {view_id}")
}

pub fn selection_label(view_id: usize) -> String {
    format!("This is the image corresponding to view id: {view_id}")
}
