//! Session, conversation, and message records held by the store.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::key::{ConversationKey, ConversationKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    #[default]
    LoggedOut,
    LoggingIn,
    LoggedIn,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => write!(f, "logged_out"),
            Self::LoggingIn => write!(f, "logging_in"),
            Self::LoggedIn => write!(f, "logged_in"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// The single authenticated session as seen by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub auth: AuthState,
    pub connection: ConnectionState,
    /// Username of the logged-in identity.
    pub me: Option<String>,
    /// Transient, user-visible error text.
    pub last_error: Option<String>,
}

impl Session {
    pub fn is_logged_in(&self) -> bool {
        self.auth == AuthState::LoggedIn
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Locally generated, unique per message.
    pub id: String,
    pub at: DateTime<Utc>,
    pub direction: Direction,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub content: String,
}

impl Message {
    /// Build a message with a fresh random id.
    pub fn new(
        at: DateTime<Utc>,
        direction: Direction,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            at,
            direction,
            sender: sender.into(),
            recipients: Vec::new(),
            group_id: None,
            content: content.into(),
        }
    }

    pub fn with_recipients(mut self, recipients: Vec<String>) -> Self {
        self.recipients = recipients;
        self
    }

    pub fn with_group(mut self, group_id: Option<String>) -> Self {
        self.group_id = group_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub key: ConversationKey,
    pub kind: ConversationKind,
    pub id: String,
    pub title: String,
    pub last_activity_at: DateTime<Utc>,
    pub last_preview: String,
    pub unread_count: u32,
    /// Arrival order, most recent last.
    pub messages: VecDeque<Message>,
}

impl Conversation {
    pub(crate) fn new(kind: ConversationKind, id: &str) -> Self {
        Self {
            key: ConversationKey::new(kind, id),
            kind,
            id: id.to_string(),
            title: kind.title_for(id),
            last_activity_at: DateTime::<Utc>::UNIX_EPOCH,
            last_preview: String::new(),
            unread_count: 0,
            messages: VecDeque::new(),
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.back()
    }
}
