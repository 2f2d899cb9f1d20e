//! Inbound frame classification.
//!
//! The receiver is liberal: anything that is not a JSON object with a known
//! `message-type` is dropped without error.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::trace;

use huayi_store::{Action, ConversationKind, Direction, Message};

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Ping { message_id: i64 },
    Pong { message_id: i64 },
    Ack { ack_id: i64 },
    Message(DeliveredMessage),
}

/// Chat content pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub from: String,
    pub to: Vec<String>,
    /// Present (and non-empty) only for group messages.
    pub topic: Option<String>,
    pub content: String,
}

impl DeliveredMessage {
    /// Group id present ⇒ group conversation keyed by it; otherwise a direct
    /// conversation keyed by the sender.
    pub fn conversation(&self) -> (ConversationKind, &str) {
        match &self.topic {
            Some(topic) => (ConversationKind::Group, topic.as_str()),
            None => (ConversationKind::Direct, self.from.as_str()),
        }
    }

    /// Turn this delivery into the store action, stamped with local receipt time.
    pub fn into_action(self, received_at: DateTime<Utc>) -> Action {
        let (kind, id) = self.conversation();
        let id = id.to_string();
        let message = Message::new(received_at, Direction::Inbound, self.from, self.content)
            .with_recipients(self.to)
            .with_group(self.topic);
        Action::MessageDelivered { kind, id, message }
    }
}

/// Classify one text frame. Returns `None` for anything malformed.
pub fn classify(text: &str) -> Option<InboundFrame> {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        trace!("dropping non-JSON frame");
        return None;
    };
    let Value::Object(obj) = value else {
        trace!("dropping non-object frame");
        return None;
    };

    let frame = match get_str(&obj, "message-type")? {
        "ping" => InboundFrame::Ping {
            message_id: get_i64(&obj, "message-id")?,
        },
        "pong" => InboundFrame::Pong {
            message_id: get_i64(&obj, "message-id")?,
        },
        "ack" => InboundFrame::Ack {
            ack_id: get_i64(&obj, "ack-id")?,
        },
        "message" => InboundFrame::Message(DeliveredMessage {
            from: get_str(&obj, "from").unwrap_or_default().to_string(),
            to: get_string_array(&obj, "to").unwrap_or_default(),
            topic: get_str(&obj, "topic")
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            content: get_str(&obj, "content").unwrap_or_default().to_string(),
        }),
        other => {
            trace!(message_type = other, "dropping frame with unknown type");
            return None;
        }
    };
    Some(frame)
}

fn get_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn get_i64(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    obj.get(key).and_then(Value::as_i64)
}

fn get_string_array(obj: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    obj.get(key)?
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}
