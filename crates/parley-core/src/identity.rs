//! Thread identity resolution.
//!
//! Maps a platform identity tuple onto the thread id used as the primary key
//! of the `threads` table. The mapping is part of the persisted schema and
//! must not change without a data migration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::ThreadId;

/// Whether a chat event comes from a one-to-one exchange or a group.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationScope {
    Direct,
    Group,
}

impl ConversationScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

impl fmt::Display for ConversationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationScope {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            other => Err(format!("unknown conversation scope: {other}")),
        }
    }
}

/// Resolve the thread id for an identity tuple.
///
/// * direct: `"{robot_id}_{user_id}"`
/// * group: the platform conversation id, unmodified
pub fn resolve(robot_id: &str, scope: ConversationScope, user_or_conversation_id: &str) -> ThreadId {
    match scope {
        ConversationScope::Direct => ThreadId::from_raw(format!("{robot_id}_{user_or_conversation_id}")),
        ConversationScope::Group => ThreadId::from_raw(user_or_conversation_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_scope_joins_robot_and_user() {
        assert_eq!(resolve("r1", ConversationScope::Direct, "u1").as_str(), "r1_u1");
    }

    #[test]
    fn group_scope_is_conversation_id_verbatim() {
        assert_eq!(resolve("r1", ConversationScope::Group, "g42").as_str(), "g42");
        assert_eq!(
            resolve("r1", ConversationScope::Group, "cid+AbC/9==").as_str(),
            "cid+AbC/9=="
        );
    }

    #[test]
    fn group_id_ignores_robot() {
        assert_eq!(
            resolve("r1", ConversationScope::Group, "g42"),
            resolve("r2", ConversationScope::Group, "g42")
        );
    }

    #[test]
    fn scope_round_trips_through_str() {
        for scope in [ConversationScope::Direct, ConversationScope::Group] {
            assert_eq!(scope.as_str().parse::<ConversationScope>().unwrap(), scope);
        }
        assert!("单聊".parse::<ConversationScope>().is_err());
    }

    #[test]
    fn scope_serde_is_snake_case() {
        assert_eq!(serde_json::to_string(&ConversationScope::Group).unwrap(), r#""group""#);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn resolve_is_deterministic(
                robot in "[A-Za-z0-9]{1,16}",
                user in "[A-Za-z0-9_]{1,24}",
            ) {
                let a = resolve(&robot, ConversationScope::Direct, &user);
                let b = resolve(&robot, ConversationScope::Direct, &user);
                prop_assert_eq!(a, b);
            }

            #[test]
            fn distinct_users_never_share_a_thread(
                robot in "[A-Za-z0-9]{1,16}",
                a in "[A-Za-z0-9_]{1,24}",
                b in "[A-Za-z0-9_]{1,24}",
            ) {
                prop_assume!(a != b);
                prop_assert_ne!(
                    resolve(&robot, ConversationScope::Direct, &a),
                    resolve(&robot, ConversationScope::Direct, &b)
                );
            }

            #[test]
            fn distinct_groups_never_share_a_thread(
                a in "cid[A-Za-z0-9+/=]{1,24}",
                b in "cid[A-Za-z0-9+/=]{1,24}",
            ) {
                prop_assume!(a != b);
                prop_assert_ne!(
                    resolve("r1", ConversationScope::Group, &a),
                    resolve("r1", ConversationScope::Group, &b)
                );
            }
        }
    }
}
