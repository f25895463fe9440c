use chrono::{DateTime, Utc};

use parley_core::ConversationScope;

/// Built-in system prompt, used unless the settings supply one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant in a workplace chat.
Keep answers concise, accurate and useful.
If you do not know the answer to a question, say so instead of making something up.
Stay friendly and professional.";

const GROUP_GUIDANCE: &str = "This is an open group chat:
1. Several people, and possibly other bots, talk here at the same time.
2. Your reply is visible to everyone in the group.
3. Address the person you are answering with an @mention.
4. The group name may change; the group id does not.";

const DIRECT_GUIDANCE: &str = "This is a private one-to-one chat:
1. Only you and this user can see the conversation.
2. Personal, direct help is appropriate.
3. Do not ask for or reveal sensitive information.";

/// Who is talking and where, injected ahead of the system prompt each turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnContext {
    pub robot_code: String,
    pub scope: ConversationScope,
    pub sender_id: String,
    pub sender_nick: String,
    pub conversation_id: String,
    pub group_name: Option<String>,
}

impl TurnContext {
    /// Render the per-turn system message: session info, scene guidance,
    /// then the base prompt.
    pub fn system_prompt(&self, base: &str, now: DateTime<Utc>) -> String {
        let mut text = format!(
            "--- Session ---\nCurrent time: {}\nUser id: {}\nUser nickname: {}\nConversation type: {}\nBot id: {}\n",
            now.format("%Y-%m-%d %H:%M:%S UTC"),
            self.sender_id,
            self.sender_nick,
            self.scope,
            self.robot_code,
        );
        match self.scope {
            ConversationScope::Group => {
                text.push_str(&format!(
                    "Group id: {}\nGroup name: {}\n\n--- Scene ---\n{GROUP_GUIDANCE}\n",
                    self.conversation_id,
                    self.group_name.as_deref().unwrap_or("unknown group"),
                ));
            }
            ConversationScope::Direct => {
                text.push_str(&format!("\n--- Scene ---\n{DIRECT_GUIDANCE}\n"));
            }
        }
        text.push('\n');
        text.push_str(base);
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(scope: ConversationScope) -> TurnContext {
        TurnContext {
            robot_code: "r1".into(),
            scope,
            sender_id: "u1".into(),
            sender_nick: "Mei".into(),
            conversation_id: "g42".into(),
            group_name: Some("Ops".into()),
        }
    }

    #[test]
    fn group_prompt_carries_group_info() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let text = ctx(ConversationScope::Group).system_prompt(DEFAULT_SYSTEM_PROMPT, now);
        assert!(text.contains("Current time: 2024-03-01 09:30:00 UTC"));
        assert!(text.contains("Group name: Ops"));
        assert!(text.contains("Conversation type: group"));
        assert!(text.ends_with(DEFAULT_SYSTEM_PROMPT));
    }

    #[test]
    fn direct_prompt_omits_group_fields() {
        let text = ctx(ConversationScope::Direct).system_prompt("base", Utc::now());
        assert!(text.contains("User nickname: Mei"));
        assert!(!text.contains("Group name"));
        assert!(text.contains("private one-to-one"));
    }
}
