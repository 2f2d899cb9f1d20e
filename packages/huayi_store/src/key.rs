//! Conversation kinds and the `kind:id` keys that identify conversations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// One-to-one conversation, keyed by the peer's username.
    Direct,
    /// Named multi-party channel (a server-side topic), keyed by its id.
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    /// Display title for a conversation of this kind: groups are prefixed
    /// with `#`, direct conversations show the peer id bare.
    pub fn title_for(&self, id: &str) -> String {
        match self {
            Self::Direct => id.to_string(),
            Self::Group => format!("#{id}"),
        }
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationKind {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            other => Err(KeyParseError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyParseError {
    #[error("conversation key must look like kind:id, got {0:?}")]
    MissingSeparator(String),

    #[error("unknown conversation kind: {0}")]
    UnknownKind(String),

    #[error("conversation id is empty")]
    EmptyId,
}

/// Stable identifier of a conversation, rendered as `kind:id`
/// (`direct:Ron`, `group:rust`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn new(kind: ConversationKind, id: &str) -> Self {
        Self(format!("{kind}:{id}"))
    }

    pub fn direct(id: &str) -> Self {
        Self::new(ConversationKind::Direct, id)
    }

    pub fn group(id: &str) -> Self {
        Self::new(ConversationKind::Group, id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> ConversationKind {
        // Keys are only ever built from a valid kind, so the prefix always parses.
        if self.0.starts_with("group:") {
            ConversationKind::Group
        } else {
            ConversationKind::Direct
        }
    }

    pub fn id(&self) -> &str {
        self.0.split_once(':').map(|(_, id)| id).unwrap_or_default()
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConversationKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| KeyParseError::MissingSeparator(s.to_string()))?;
        let kind: ConversationKind = kind.parse()?;
        if id.is_empty() {
            return Err(KeyParseError::EmptyId);
        }
        Ok(Self::new(kind, id))
    }
}

impl TryFrom<String> for ConversationKey {
    type Error = KeyParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConversationKey> for String {
    fn from(key: ConversationKey) -> Self {
        key.0
    }
}
