//! Conversation turns exchanged between the user and the orchestrator.
//!
//! A [`Message`] is not a raw chat envelope: roles are a closed [`Role`]
//! enum (the routing engine branches on them, so stringly-typed roles
//! would push validation into every stage), and assistant turns carry the
//! [`StageKind`] that authored them so a final answer is traceable to the
//! stage that produced it. The API surface maps loosely-typed wire roles
//! in through [`Message::from_wire`]; unknown roles become [`Role::Tool`]
//! data rather than user intent.
//!
//! ```
//! use synesis::message::{Message, Role};
//! use synesis::types::StageKind;
//!
//! let ask = Message::user("hello world in python");
//! let answer = Message::reply(StageKind::Respond, "```python\nprint(\"hi\")\n```");
//! assert_eq!(ask.role, Role::User);
//! assert!(answer.is_reply());
//! assert_eq!(answer.authored_by, Some(StageKind::Respond));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::StageKind;

/// The closed set of conversation roles the traversal understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A turn authored by the requesting user; the only role the
    /// classifier and pivot detection act on.
    User,
    /// A turn produced by the orchestrator itself.
    Assistant,
    /// Directive context injected by a stage when building a prompt.
    System,
    /// Non-conversational payloads (tool logs, unrecognized wire roles).
    /// Treated as data, never as user intent.
    Tool,
}

impl Role {
    /// Wire form of the role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    /// Parse a wire role. `None` for anything outside the closed set;
    /// callers decide whether to demote or drop.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One conversation turn, with provenance for orchestrator-authored ones.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// The stage that authored this turn. `None` for turns that arrived
    /// from outside the traversal (user input, wire history).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authored_by: Option<StageKind>,
}

impl Message {
    /// A turn with no stage provenance.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            authored_by: None,
        }
    }

    /// A user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// A stage-built directive for a model prompt.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// An assistant turn authored by a specific stage. Replies always
    /// carry their author; there is no anonymous assistant constructor.
    pub fn reply(stage: StageKind, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            authored_by: Some(stage),
        }
    }

    /// Normalize an incoming wire turn. Unknown roles are demoted to
    /// [`Role::Tool`] so injected role strings cannot impersonate the
    /// user or the system.
    pub fn from_wire(role: &str, content: impl Into<String>) -> Self {
        Self::new(Role::parse(role).unwrap_or(Role::Tool), content)
    }

    /// Whether this turn is an orchestrator reply.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.role == Role::Assistant
    }
}

/// The most recent user-authored content in a message list, if any.
///
/// Stages classify and act on the latest user turn; assistant, system and
/// tool turns are skipped.
#[must_use]
pub fn last_user_content(messages: &[Message]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_roles_and_provenance() {
        assert_eq!(Message::user("a").role, Role::User);
        assert_eq!(Message::system("b").role, Role::System);
        let reply = Message::reply(StageKind::Respond, "c");
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.authored_by, Some(StageKind::Respond));
        assert_eq!(Message::user("a").authored_by, None);
    }

    #[test]
    fn wire_roles_outside_the_closed_set_become_tool_data() {
        assert_eq!(Message::from_wire("user", "x").role, Role::User);
        assert_eq!(Message::from_wire("assistant", "x").role, Role::Assistant);
        assert_eq!(Message::from_wire("function", "x").role, Role::Tool);
        assert_eq!(Message::from_wire("SYSTEM:", "x").role, Role::Tool);
    }

    #[test]
    fn last_user_content_skips_non_user_turns() {
        let msgs = vec![
            Message::user("first"),
            Message::reply(StageKind::Respond, "reply"),
            Message::user("second"),
            Message::reply(StageKind::Respond, "done"),
        ];
        assert_eq!(last_user_content(&msgs), Some("second"));
        assert_eq!(last_user_content(&[Message::system("s")]), None);
    }

    #[test]
    fn provenance_is_omitted_from_the_wire_when_absent() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(!json.contains("authored_by"));
        let json = serde_json::to_string(&Message::reply(StageKind::Respond, "ok")).unwrap();
        assert!(json.contains("\"authored_by\":\"respond\""));
    }
}
