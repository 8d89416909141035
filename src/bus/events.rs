use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message received from a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Local filesystem paths or URIs of downloaded media.
    pub media: Vec<String>,
    /// Channel-specific fields (platform message id, guild id, reply-to, chat type).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Unique key for agent session identification.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// Message the agent wants delivered to a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    /// Platform message id to reply to, when the channel supports it.
    pub reply_to: Option<String>,
    pub media: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_format() {
        let msg = InboundMessage::new("discord", "user1", "C1", "hi");
        assert_eq!(msg.session_key(), "discord:C1");
    }

    #[test]
    fn test_inbound_defaults() {
        let msg = InboundMessage::new("telegram", "42", "42", "hello");
        assert!(msg.media.is_empty());
        assert!(msg.metadata.is_empty());
        // Timestamp defaults to receive time
        let age = Utc::now() - msg.timestamp;
        assert!(age.num_seconds() < 5);
    }

    #[test]
    fn test_outbound_defaults() {
        let msg = OutboundMessage::new("feishu", "oc_1", "reply");
        assert!(msg.reply_to.is_none());
        assert!(msg.media.is_empty());
    }

    #[test]
    fn test_inbound_serde_round_trip() {
        let mut msg = InboundMessage::new("discord", "u|v", "C1", "hi");
        msg.metadata
            .insert("message_id".into(), serde_json::json!("m1"));
        let json = serde_json::to_string(&msg).unwrap();
        let back: InboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sender_id, "u|v");
        assert_eq!(back.metadata["message_id"], "m1");
    }
}
