//! Outbound send pipeline.
//!
//! Local state only changes after the remote call succeeds. The helpers here
//! are the synchronous halves of each intent: validating and building the
//! remote request, and committing its outcome into the store. The session
//! runtime owns the remote call in between.

use chrono::{DateTime, Utc};
use tracing::debug;

use huayi_store::{Action, ConversationKey, ConversationKind, Direction, Message, Store};

use crate::api::{ApiError, CommandApi, SendRequest};

/// Split a comma-separated mentions field into recipient names.
pub fn parse_mentions(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// A validated send waiting on its remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub key: ConversationKey,
    pub request: SendRequest,
}

impl PendingSend {
    /// The outbound message as it will be recorded locally.
    fn into_message(self, at: DateTime<Utc>) -> (ConversationKey, Message) {
        let SendRequest {
            from,
            kind,
            id,
            content,
            mentions,
        } = self.request;
        let message = Message::new(at, Direction::Outbound, from, content);
        let message = match kind {
            ConversationKind::Direct => message.with_recipients(vec![id]),
            ConversationKind::Group => message.with_recipients(mentions).with_group(Some(id)),
        };
        (self.key, message)
    }
}

/// Validate a send intent and clear any previous error.
///
/// Returns `None` (touching nothing) when nobody is logged in, the target
/// conversation is unknown, or the trimmed content is empty.
pub fn prepare_send(
    store: &mut Store,
    key: &ConversationKey,
    content: &str,
    mentions_text: &str,
) -> Option<PendingSend> {
    let state = store.state();
    let me = state.session.me.clone()?;
    let conversation = state.conversation(key)?;
    let content = content.trim();
    if content.is_empty() {
        return None;
    }

    let request = SendRequest {
        from: me,
        kind: conversation.kind,
        id: conversation.id.clone(),
        content: content.to_string(),
        mentions: match conversation.kind {
            ConversationKind::Group => parse_mentions(mentions_text),
            ConversationKind::Direct => Vec::new(),
        },
    };
    store.dispatch(Action::ErrorSet(None));
    Some(PendingSend {
        key: key.clone(),
        request,
    })
}

/// Record a send the server accepted: append it and clear the draft text.
/// The mentions draft is left as it was.
pub fn commit_send(store: &mut Store, pending: PendingSend, at: DateTime<Utc>) {
    let (key, message) = pending.into_message(at);
    store.dispatch(Action::MessageAppended {
        key: key.clone(),
        message,
        increment_unread: false,
    });
    store.dispatch(Action::DraftTextSet {
        key,
        text: String::new(),
    });
}

/// What the caller must do after a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The session is gone; run the full logout.
    SessionInvalid,
    /// A transient error has been recorded; the draft is untouched.
    Reported,
}

pub fn fail_send(store: &mut Store, err: &ApiError) -> SendFailure {
    if err.is_session_invalid() {
        return SendFailure::SessionInvalid;
    }
    report_failure(store, err, "send failed");
    SendFailure::Reported
}

/// Set the transient error for a failed command, falling back to `fallback`
/// when the server gave no message.
pub fn report_failure(store: &mut Store, err: &ApiError, fallback: &str) {
    let message = if err.message.trim().is_empty() {
        fallback.to_string()
    } else {
        err.message.clone()
    };
    store.dispatch(Action::ErrorSet(Some(message)));
}

/// Local half of starting a conversation: ensure it, mark it active now, and
/// select it. Returns the key and whether the group should be created and
/// joined remotely.
pub fn start_conversation(
    store: &mut Store,
    kind: ConversationKind,
    id: &str,
    now: DateTime<Utc>,
) -> (ConversationKey, bool) {
    let key = ConversationKey::new(kind, id);
    store.dispatch(Action::ConversationEnsured {
        kind,
        id: id.to_string(),
    });
    store.dispatch(Action::ConversationTouched {
        key: key.clone(),
        at: now,
        preview: String::new(),
    });
    store.dispatch(Action::ConversationSelected(Some(key.clone())));
    (key, kind == ConversationKind::Group)
}

/// Create then join a group, ignoring failures of either: the group may
/// already exist, or we may already be a member.
pub async fn ensure_group_membership(api: &dyn CommandApi, id: &str) {
    if let Err(e) = api.create_group(id).await {
        debug!(group = id, error = %e, "create group failed (ignored)");
    }
    if let Err(e) = api.join_group(id).await {
        debug!(group = id, error = %e, "join group failed (ignored)");
    }
}

/// Group commands that are thin pass-throughs to the command API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCommand {
    Join,
    Quit,
    Delete,
}

impl GroupCommand {
    pub fn failure_message(&self) -> &'static str {
        match self {
            Self::Join => "join failed",
            Self::Quit => "quit failed",
            Self::Delete => "delete failed",
        }
    }

    pub async fn call(&self, api: &dyn CommandApi, id: &str) -> Result<(), ApiError> {
        match self {
            Self::Join => api.join_group(id).await,
            Self::Quit => api.quit_group(id).await,
            Self::Delete => api.delete_group(id).await,
        }
    }
}
