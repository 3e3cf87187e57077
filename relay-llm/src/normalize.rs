//! Provider-specific history shaping.
//!
//! Some providers reject histories that open with an assistant turn or that contain two
//! consecutive turns with the same role. `normalize` turns stored history into a payload
//! those providers accept; for everything else it only prepends the system preamble.

use crate::types::{ChatMessage, HistoryProfile, Role};

pub const PLACEHOLDER_USER_GREETING: &str = "Hello";
const MERGE_SEPARATOR: &str = "\n\n";

pub fn normalize(
    turns: &[ChatMessage],
    profile: HistoryProfile,
    system_preamble: Option<&str>,
) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(turns.len() + 1);
    if let Some(preamble) = system_preamble {
        out.push(ChatMessage::system(preamble));
    }

    match profile {
        HistoryProfile::Passthrough => {
            out.extend_from_slice(turns);
        }
        HistoryProfile::StrictAlternation => {
            let trimmed = drop_leading_assistant(turns);
            let merged = merge_same_role_runs(&trimmed);
            tracing::debug!(
                input_turns = turns.len(),
                output_turns = merged.len(),
                "history normalized for strict alternation"
            );
            out.extend(merged);
        }
    }
    out
}

/// Drops every non-system turn before the first user turn. System turns found in the
/// dropped prefix are kept in place.
fn drop_leading_assistant(turns: &[ChatMessage]) -> Vec<ChatMessage> {
    let first_non_system = turns.iter().position(|t| t.role != Role::System);
    let Some(first_non_system) = first_non_system else {
        let mut out = turns.to_vec();
        if out.is_empty() {
            return out;
        }
        out.push(ChatMessage::user(PLACEHOLDER_USER_GREETING));
        return out;
    };
    if turns[first_non_system].role == Role::User {
        return turns.to_vec();
    }

    match turns.iter().position(|t| t.role == Role::User) {
        Some(first_user) => {
            let dropped = turns[..first_user]
                .iter()
                .filter(|t| t.role != Role::System)
                .count();
            tracing::info!(dropped, "leading assistant turns dropped from history");
            turns[..first_user]
                .iter()
                .filter(|t| t.role == Role::System)
                .chain(turns[first_user..].iter())
                .cloned()
                .collect()
        }
        None => {
            tracing::info!(
                turns = turns.len(),
                "history has no user turn; substituting placeholder greeting"
            );
            let mut out: Vec<ChatMessage> = turns
                .iter()
                .filter(|t| t.role == Role::System)
                .cloned()
                .collect();
            out.push(ChatMessage::user(PLACEHOLDER_USER_GREETING));
            out
        }
    }
}

fn merge_same_role_runs(turns: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(turns.len());
    for turn in turns {
        if turn.role != Role::System {
            // System turns in between do not separate a same-role run.
            let previous = out.iter_mut().rev().find(|m| m.role != Role::System);
            if let Some(previous) = previous.filter(|m| m.role == turn.role) {
                previous.content.push_str(MERGE_SEPARATOR);
                previous.content.push_str(&turn.content);
                continue;
            }
        }
        out.push(turn.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(messages: &[ChatMessage]) -> Vec<Role> {
        messages.iter().map(|m| m.role).collect()
    }

    fn assert_alternates(messages: &[ChatMessage]) {
        let non_system: Vec<&ChatMessage> =
            messages.iter().filter(|m| m.role != Role::System).collect();
        assert_eq!(
            non_system.first().map(|m| m.role),
            Some(Role::User),
            "first non-system turn must be user: {messages:?}"
        );
        for pair in non_system.windows(2) {
            assert_ne!(pair[0].role, pair[1].role, "adjacent same-role turns: {messages:?}");
        }
    }

    #[test]
    fn passthrough_only_prepends_preamble() {
        let turns = vec![
            ChatMessage::assistant("Welcome back"),
            ChatMessage::assistant("Anything else?"),
            ChatMessage::user("yes"),
        ];
        let out = normalize(&turns, HistoryProfile::Passthrough, Some("be kind"));
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], ChatMessage::system("be kind"));
        assert_eq!(&out[1..], &turns[..]);
    }

    #[test]
    fn leading_assistant_turns_are_dropped_up_to_first_user() {
        let turns = vec![
            ChatMessage::assistant("Hi, I am your assistant"),
            ChatMessage::assistant("How can I help?"),
            ChatMessage::user("Bonjour"),
            ChatMessage::assistant("Salut"),
        ];
        let out = normalize(&turns, HistoryProfile::StrictAlternation, Some("sys"));
        assert_eq!(
            out,
            vec![
                ChatMessage::system("sys"),
                ChatMessage::user("Bonjour"),
                ChatMessage::assistant("Salut"),
            ]
        );
        assert_alternates(&out);
    }

    #[test]
    fn history_without_user_turn_becomes_single_placeholder() {
        let turns = vec![
            ChatMessage::assistant("one"),
            ChatMessage::assistant("two"),
        ];
        let out = normalize(&turns, HistoryProfile::StrictAlternation, None);
        assert_eq!(out, vec![ChatMessage::user(PLACEHOLDER_USER_GREETING)]);
    }

    #[test]
    fn consecutive_same_role_turns_merge_with_blank_line() {
        let turns = vec![
            ChatMessage::user("first"),
            ChatMessage::user("second"),
            ChatMessage::assistant("a"),
            ChatMessage::assistant("b"),
            ChatMessage::assistant("c"),
            ChatMessage::user("third"),
        ];
        let out = normalize(&turns, HistoryProfile::StrictAlternation, None);
        assert_eq!(
            out,
            vec![
                ChatMessage::user("first\n\nsecond"),
                ChatMessage::assistant("a\n\nb\n\nc"),
                ChatMessage::user("third"),
            ]
        );
        assert_alternates(&out);
    }

    #[test]
    fn leading_drop_and_merge_compose() {
        let turns = vec![
            ChatMessage::assistant("greeting"),
            ChatMessage::user("q1"),
            ChatMessage::user("q1 again"),
            ChatMessage::assistant("a1"),
        ];
        let out = normalize(&turns, HistoryProfile::StrictAlternation, Some("sys"));
        assert_eq!(roles(&out), vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(out[1].content, "q1\n\nq1 again");
    }

    #[test]
    fn empty_history_with_preamble_returns_only_preamble() {
        let out = normalize(&[], HistoryProfile::StrictAlternation, Some("sys"));
        assert_eq!(out, vec![ChatMessage::system("sys")]);

        let out = normalize(&[], HistoryProfile::Passthrough, None);
        assert!(out.is_empty());
    }

    #[test]
    fn same_role_turns_around_a_system_turn_still_merge() {
        let turns = vec![
            ChatMessage::user("a"),
            ChatMessage::system("s"),
            ChatMessage::user("b"),
            ChatMessage::assistant("c"),
        ];
        let out = normalize(&turns, HistoryProfile::StrictAlternation, None);
        assert_eq!(
            out,
            vec![
                ChatMessage::user("a\n\nb"),
                ChatMessage::system("s"),
                ChatMessage::assistant("c"),
            ]
        );
        assert_alternates(&out);
    }

    #[test]
    fn system_turns_inside_history_are_never_merged() {
        let turns = vec![
            ChatMessage::user("q"),
            ChatMessage::system("note"),
            ChatMessage::system("note 2"),
            ChatMessage::assistant("a"),
        ];
        let out = normalize(&turns, HistoryProfile::StrictAlternation, None);
        assert_eq!(
            roles(&out),
            vec![Role::User, Role::System, Role::System, Role::Assistant]
        );
    }
}
