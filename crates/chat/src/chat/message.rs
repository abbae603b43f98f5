use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, stable identifier for one message.
///
/// Stored as a string so histories written with other id schemes still load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Mints a fresh time-ordered identifier.
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl From<Role> for parlor_llm::Role {
    fn from(role: Role) -> Self {
        match role {
            Role::User => parlor_llm::Role::User,
            Role::Assistant => parlor_llm::Role::Assistant,
        }
    }
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Message {
    pub fn new(id: MessageId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            reasoning: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageId::new_v7(), Role::User, content)
    }

    /// Empty assistant message that receives streamed output.
    pub fn assistant_placeholder() -> Self {
        Self::new(MessageId::new_v7(), Role::Assistant, String::new())
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self.role, Role::Assistant)
    }

    pub fn to_provider_message(&self) -> parlor_llm::ProviderMessage {
        parlor_llm::ProviderMessage::new(self.role.into(), self.content.clone())
    }
}
