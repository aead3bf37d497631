//! request assembly: history + settings + new text → what the server sees.

use crate::api::ChatMessage;
use crate::history::{AI_PREFIX, HUMAN_PREFIX};

/// role and personality joined by a newline; blank parts are skipped.
pub fn system_prompt(role: &str, personality: &str) -> String {
    [role.trim(), personality.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// message list for `/chat`: system, replayed history, new user turn.
pub fn build_messages(
    role: &str,
    personality: &str,
    history: &[String],
    user_text: &str,
) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(history.len() + 2);
    out.push(ChatMessage::system(system_prompt(role, personality)));
    out.extend(history.iter().map(|entry| history_message(entry)));
    out.push(ChatMessage::user(user_text));
    out
}

fn history_message(entry: &str) -> ChatMessage {
    if let Some(text) = entry.strip_prefix(AI_PREFIX) {
        ChatMessage::assistant(text)
    } else if let Some(text) = entry.strip_prefix(HUMAN_PREFIX) {
        ChatMessage::user(text)
    } else {
        ChatMessage::user(entry)
    }
}

/// flat prompt for `/generate`.
pub fn build_generate_prompt(personality: &str, history: &[String], user_text: &str) -> String {
    format!(
        "{}\n{}\n{HUMAN_PREFIX}{}\nAI:",
        personality.trim(),
        history.join("\n"),
        user_text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ChatRole;
    use pretty_assertions::assert_eq;

    #[test]
    fn messages_follow_history_prefixes() {
        let history = vec![
            "Human: hi".to_string(),
            "AI: hello".to_string(),
            "stray line".to_string(),
        ];
        let msgs = build_messages("a pirate", "speaks briefly", &history, "how are you?");
        let roles: Vec<ChatRole> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::User, ChatRole::User]
        );
        assert_eq!(msgs[0].content, "a pirate\nspeaks briefly");
        assert_eq!(msgs[1].content, "hi");
        assert_eq!(msgs[2].content, "hello");
        assert_eq!(msgs[3].content, "stray line");
        assert_eq!(msgs[4].content, "how are you?");
    }

    #[test]
    fn system_prompt_is_always_present() {
        let msgs = build_messages("", "  ", &[], "x");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], ChatMessage::system(""));
    }

    #[test]
    fn generate_prompt_layout() {
        let history = vec!["Human: hi".to_string(), "AI: hello".to_string()];
        assert_eq!(
            build_generate_prompt("be kind", &history, "bye"),
            "be kind\nHuman: hi\nAI: hello\nHuman: bye\nAI:"
        );
    }
}
