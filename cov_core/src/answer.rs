//! Reading the model's replies: terminal answers, overview requests,
//! reasoning traces and view selections.

/// Keyword that ends the dialogue, matched case-insensitively.
pub const TERMINAL_MARKER: &str = "done";

/// Phrase asking for a bird's-eye frame of the whole scene.
pub const OVERVIEW_MARKER: &str = "switch to bird-eye-view";

const THINKING_CLOSE_TAG: &str = "</think>";

/// Returns true if the reply carries an answer.
pub fn is_terminal(reply: &str) -> bool {
    reply.to_lowercase().contains(TERMINAL_MARKER)
}

/// Returns true if the reply asks for the overview frame.
pub fn requests_overview(reply: &str) -> bool {
    reply.contains(OVERVIEW_MARKER)
}

/// Drops a reasoning trace, keeping only the text after the last `</think>`.
pub fn strip_thinking(reply: &str) -> &str {
    match reply.rfind(THINKING_CLOSE_TAG) {
        Some(at) => &reply[at + THINKING_CLOSE_TAG.len()..],
        None => reply,
    }
}

/// Extracts the answer from a terminal reply.
///
/// Takes the text after the first "done" (any case), removes a leading `+`
/// and surrounding brackets:
///
/// ```text
/// done+[white box]              -> white box
/// I am done+Air conditioning    -> Air conditioning
/// [done] [white box]            -> white box
/// ```
///
/// Without a marker the whole reply is cleaned the same way.
pub fn extract_answer(reply: &str) -> String {
    let trimmed = reply.trim();

    // ASCII lowering keeps byte offsets aligned with the original
    let lowered = trimmed.to_ascii_lowercase();
    let tail = match lowered.find(TERMINAL_MARKER) {
        Some(at) => {
            let after = trimmed[at + TERMINAL_MARKER.len()..].trim();
            after.strip_prefix('+').unwrap_or(after).trim()
        }
        None => trimmed,
    };

    tail.trim_matches(|c: char| c == '[' || c == ']' || c.is_whitespace())
        .to_string()
}

/// Parses a `Selected views: [a, b, c]` reply into at most `max_views`
/// distinct, in-range view ids, in the order given.
pub fn parse_selected_views(reply: &str, max_views: usize, view_count: usize) -> Vec<usize> {
    if max_views == 0 {
        return Vec::new();
    }
    let lowered = reply.to_ascii_lowercase();
    let Some(list) = selection_list(&lowered) else {
        return Vec::new();
    };

    let mut selected = Vec::new();
    for token in list.split(|c: char| c == ',' || c.is_whitespace()) {
        let Ok(index) = token.parse::<usize>() else {
            continue;
        };
        if index < view_count && !selected.contains(&index) {
            selected.push(index);
        }
        if selected.len() == max_views {
            break;
        }
    }
    selected
}

/// Locates the digit list following "selected view(s)".
fn selection_list(lowered: &str) -> Option<&str> {
    let mut cursor = 0;
    while let Some(offset) = lowered[cursor..].find("selected") {
        let mut rest = lowered[cursor + offset + "selected".len()..].trim_start();
        cursor += offset + 1;

        let Some(after_view) = rest.strip_prefix("view") else {
            continue;
        };
        rest = after_view.strip_prefix('s').unwrap_or(after_view).trim_start();
        rest = rest.strip_prefix([':', '=']).unwrap_or(rest).trim_start();
        rest = rest.strip_prefix('[').unwrap_or(rest);

        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == ',' || c.is_whitespace()))
            .unwrap_or(rest.len());
        let list = &rest[..end];
        if list.chars().any(|c| c.is_ascii_digit()) {
            return Some(list);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_marker_any_case() {
        assert!(is_terminal("done+[chair]"));
        assert!(is_terminal("I am DONE with this"));
        assert!(!is_terminal("forward-movement+1"));
    }

    #[test]
    fn test_extract_answer_forms() {
        assert_eq!(extract_answer("done+[white box]"), "white box");
        assert_eq!(extract_answer("I am done+Air conditioning unit"), "Air conditioning unit");
        assert_eq!(extract_answer("[done] [white box]"), "white box");
        assert_eq!(extract_answer("Done + [two]  "), "two");
        assert_eq!(extract_answer("[blue]"), "blue");
        assert_eq!(extract_answer(""), "");
    }

    #[test]
    fn test_extract_answer_keeps_inner_brackets() {
        assert_eq!(extract_answer("done+[a [small] lamp]"), "a [small] lamp");
    }

    #[test]
    fn test_strip_thinking() {
        assert_eq!(strip_thinking("<think>a</think>x<think>b</think> done+[y]"), " done+[y]");
        assert_eq!(strip_thinking("no trace"), "no trace");
    }

    #[test]
    fn test_overview_request() {
        assert!(requests_overview("Let me switch to bird-eye-view first"));
        assert!(!requests_overview("switch to view 3"));
    }

    #[test]
    fn test_parse_selected_views() {
        assert_eq!(parse_selected_views("Selected views: [3, 7, 1]", 5, 10), vec![3, 7, 1]);
        assert_eq!(parse_selected_views("selected view=2", 5, 10), vec![2]);
        assert_eq!(parse_selected_views("SelectedViews [0,1]", 5, 10), vec![0, 1]);
    }

    #[test]
    fn test_parse_selected_views_bounds() {
        assert_eq!(parse_selected_views("Selected views: [1, 2, 3, 4, 5, 6]", 5, 10), vec![1, 2, 3, 4, 5]);
        assert_eq!(parse_selected_views("Selected views: [9, 12, 2, 2]", 5, 10), vec![9, 2]);
        assert!(parse_selected_views("I like view 3", 5, 10).is_empty());
        assert!(parse_selected_views("Selected views: none", 5, 10).is_empty());
    }

    #[test]
    fn test_parse_selected_views_skips_prose_mentions() {
        let reply = "The selected region is the kitchen. Selected views: [4]";
        assert_eq!(parse_selected_views(reply, 5, 10), vec![4]);
    }
}
