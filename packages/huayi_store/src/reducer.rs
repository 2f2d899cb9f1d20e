//! The pure reducer: `(State, Action) -> State`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::{ConversationKey, ConversationKind};
use crate::model::{AuthState, ConnectionState, Conversation, Message, Session};

/// Maximum messages kept per conversation. Oldest entries are evicted first.
pub const MESSAGE_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone)]
pub enum Action {
    AuthStart,
    AuthSucceeded { me: String },
    AuthFailed { message: String },
    /// Logout: back to the initial state.
    AuthReset,
    ConnectionStateChanged(ConnectionState),
    ErrorSet(Option<String>),
    ConversationEnsured {
        kind: ConversationKind,
        id: String,
    },
    ConversationTouched {
        key: ConversationKey,
        at: DateTime<Utc>,
        preview: String,
    },
    MessageAppended {
        key: ConversationKey,
        message: Message,
        increment_unread: bool,
    },
    /// Inbound network message: ensure the conversation, then append,
    /// counting it unread unless the conversation is selected.
    MessageDelivered {
        kind: ConversationKind,
        id: String,
        message: Message,
    },
    ConversationSelected(Option<ConversationKey>),
    DraftTextSet {
        key: ConversationKey,
        text: String,
    },
    DraftMentionsSet {
        key: ConversationKey,
        text: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub session: Session,
    pub conversations: HashMap<ConversationKey, Conversation>,
    /// Every known key, most recently active first.
    pub order: Vec<ConversationKey>,
    pub selected: Option<ConversationKey>,
    pub draft_text: HashMap<ConversationKey, String>,
    pub draft_mentions: HashMap<ConversationKey, String>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one action, returning the next state.
    pub fn reduce(mut self, action: Action) -> Self {
        match action {
            Action::AuthStart => {
                self.session.auth = AuthState::LoggingIn;
                self.session.last_error = None;
                self
            }
            Action::AuthSucceeded { me } => Self {
                session: Session {
                    auth: AuthState::LoggedIn,
                    me: Some(me),
                    ..Session::default()
                },
                ..Self::default()
            },
            Action::AuthFailed { message } => {
                self.session.auth = AuthState::LoggedOut;
                self.session.last_error = Some(message);
                self
            }
            Action::AuthReset => Self::default(),
            Action::ConnectionStateChanged(connection) => {
                self.session.connection = connection;
                self
            }
            Action::ErrorSet(error) => {
                self.session.last_error = error;
                self
            }
            Action::ConversationEnsured { kind, id } => {
                self.ensure_conversation(kind, &id);
                self
            }
            Action::ConversationTouched { key, at, preview } => {
                let Some(conv) = self.conversations.get_mut(&key) else {
                    return self;
                };
                conv.last_activity_at = at;
                conv.last_preview = preview;
                self.sort_order();
                self
            }
            Action::MessageAppended {
                key,
                message,
                increment_unread,
            } => {
                self.append_message(&key, message, increment_unread);
                self
            }
            Action::MessageDelivered { kind, id, message } => {
                let key = self.ensure_conversation(kind, &id);
                let increment_unread = self.selected.as_ref() != Some(&key);
                self.append_message(&key, message, increment_unread);
                self
            }
            Action::ConversationSelected(None) => {
                self.selected = None;
                self
            }
            Action::ConversationSelected(Some(key)) => {
                let Some(conv) = self.conversations.get_mut(&key) else {
                    return self;
                };
                conv.unread_count = 0;
                self.selected = Some(key);
                self
            }
            Action::DraftTextSet { key, text } => {
                self.draft_text.insert(key, text);
                self
            }
            Action::DraftMentionsSet { key, text } => {
                self.draft_mentions.insert(key, text);
                self
            }
        }
    }

    fn ensure_conversation(&mut self, kind: ConversationKind, id: &str) -> ConversationKey {
        let key = ConversationKey::new(kind, id);
        if !self.conversations.contains_key(&key) {
            self.conversations
                .insert(key.clone(), Conversation::new(kind, id));
            if !self.order.contains(&key) {
                self.order.push(key.clone());
            }
        }
        key
    }

    fn append_message(&mut self, key: &ConversationKey, message: Message, increment_unread: bool) {
        let Some(conv) = self.conversations.get_mut(key) else {
            return;
        };
        conv.last_activity_at = message.at;
        conv.last_preview = message.content.clone();
        conv.messages.push_back(message);
        while conv.messages.len() > MESSAGE_HISTORY_LIMIT {
            conv.messages.pop_front();
        }
        if increment_unread {
            conv.unread_count += 1;
        }
        self.sort_order();
    }

    /// Stable sort, so ties keep their previous relative order.
    fn sort_order(&mut self) {
        let conversations = &self.conversations;
        let activity = |key: &ConversationKey| {
            conversations
                .get(key)
                .map(|c| c.last_activity_at)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        };
        self.order.sort_by(|a, b| activity(b).cmp(&activity(a)));
    }

    // --- Read-only projections ---

    pub fn conversation(&self, key: &ConversationKey) -> Option<&Conversation> {
        self.conversations.get(key)
    }

    /// Conversations in display order (most recently active first).
    pub fn ordered_conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.order.iter().filter_map(|k| self.conversations.get(k))
    }

    pub fn selected_conversation(&self) -> Option<&Conversation> {
        self.selected.as_ref().and_then(|k| self.conversations.get(k))
    }

    pub fn draft_text(&self, key: &ConversationKey) -> &str {
        self.draft_text.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn draft_mentions(&self, key: &ConversationKey) -> &str {
        self.draft_mentions.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.values().map(|c| c.unread_count).sum()
    }
}

/// Owner of the single live [`State`]. All mutation goes through
/// [`Store::dispatch`].
#[derive(Debug, Default)]
pub struct Store {
    state: State,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn session(&self) -> &Session {
        &self.state.session
    }

    pub fn dispatch(&mut self, action: Action) {
        let state = std::mem::take(&mut self.state);
        self.state = state.reduce(action);
    }
}
