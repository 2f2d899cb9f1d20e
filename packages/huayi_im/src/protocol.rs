//! Duplex-channel frame shapes.
//!
//! Every frame is a JSON object discriminated by `message-type`. Outbound
//! frames are serialized from [`OutboundFrame`]; inbound text is classified
//! leniently by [`crate::router`].

use serde::{Deserialize, Serialize};

pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Frames the client writes to the duplex channel (and the message body of
/// the command API's send call).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message-type", rename_all = "lowercase")]
pub enum OutboundFrame {
    /// Our own liveness probe; the server answers with `ack`.
    Ping {
        #[serde(rename = "message-id")]
        message_id: i64,
        from: String,
    },
    /// Answer to a server-initiated probe.
    Ack {
        #[serde(rename = "ack-id")]
        ack_id: i64,
    },
    Message(ChatFrame),
}

impl OutboundFrame {
    pub fn to_json(&self) -> String {
        // Serializing these plain structs cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Chat content as carried on the wire. Group messages carry `topic`;
/// direct messages omit it and name the recipient in `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFrame {
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(rename = "content-type", default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub content: String,
}

fn default_content_type() -> String {
    CONTENT_TYPE_TEXT.to_string()
}

impl ChatFrame {
    pub fn direct(from: &str, to: &str, content: &str) -> Self {
        Self {
            from: from.to_string(),
            to: vec![to.to_string()],
            topic: None,
            content_type: default_content_type(),
            content: content.to_string(),
        }
    }

    pub fn group(from: &str, group: &str, mentions: Vec<String>, content: &str) -> Self {
        Self {
            from: from.to_string(),
            to: mentions,
            topic: Some(group.to_string()),
            content_type: default_content_type(),
            content: content.to_string(),
        }
    }
}
