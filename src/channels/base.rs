use crate::bus::{InboundMessage, OutboundMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Contract every channel adapter implements.
///
/// `start()` is long-running: it connects, consumes platform events and
/// publishes inbound messages until `stop()` is requested or an unrecoverable
/// error occurs. Transient transport failures are handled internally.
#[async_trait]
pub trait BaseChannel: Send + Sync {
    fn name(&self) -> &'static str;
    fn allow_from(&self) -> &[String];
    fn inbound_tx(&self) -> &mpsc::Sender<InboundMessage>;
    fn is_running(&self) -> bool;

    async fn start(&self) -> anyhow::Result<()>;

    /// Cancel background work and release transport handles. Idempotent.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Transmit one outbound message with adapter-specific framing and
    /// rate-limit policy.
    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()>;

    /// Allow-list gate: an empty list admits everyone; composite ids
    /// (`"a|b"`) are admitted when any part is listed.
    fn is_allowed(&self, sender_id: &str) -> bool {
        sender_allowed(self.allow_from(), sender_id)
    }

    /// Apply the allow-list, build an `InboundMessage` and publish it.
    async fn handle_message(
        &self,
        sender_id: &str,
        chat_id: &str,
        content: String,
        media: Vec<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) {
        forward_to_bus(
            self.name(),
            self.allow_from(),
            self.inbound_tx(),
            sender_id,
            chat_id,
            content,
            media,
            metadata,
        )
        .await;
    }
}

pub(crate) fn sender_allowed(allow_list: &[String], sender_id: &str) -> bool {
    if allow_list.is_empty() {
        return true;
    }
    if allow_list.iter().any(|a| a == sender_id) {
        return true;
    }
    if sender_id.contains('|') {
        return sender_id
            .split('|')
            .any(|part| !part.is_empty() && allow_list.iter().any(|a| a == part));
    }
    false
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn forward_to_bus(
    name: &str,
    allow_list: &[String],
    inbound_tx: &mpsc::Sender<InboundMessage>,
    sender_id: &str,
    chat_id: &str,
    content: String,
    media: Vec<String>,
    metadata: HashMap<String, serde_json::Value>,
) {
    if !sender_allowed(allow_list, sender_id) {
        warn!(
            "Access denied for sender {} on channel {}. Add them to allowFrom in config to grant access.",
            sender_id, name
        );
        return;
    }

    let mut msg = InboundMessage::new(name, sender_id, chat_id, content);
    msg.media = media;
    msg.metadata = metadata;

    if let Err(e) = inbound_tx.send(msg).await {
        error!("Failed to publish inbound message from {}: {}", name, e);
    }
}

/// Split a message into chunks respecting UTF-8 character boundaries,
/// preferring paragraph and newline breaks.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while remaining.len() > limit {
        // Largest valid byte index <= limit that is a char boundary
        let mut split_at = limit;
        while split_at > 0 && !remaining.is_char_boundary(split_at) {
            split_at -= 1;
        }
        if split_at == 0 {
            // Degenerate case: single character wider than limit
            split_at = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }

        if let Some(idx) = remaining[..split_at].rfind("\n\n") {
            chunks.push(remaining[..idx].trim().to_string());
            remaining = &remaining[idx + 2..];
            continue;
        }

        if let Some(idx) = remaining[..split_at].rfind('\n') {
            chunks.push(remaining[..idx].trim().to_string());
            remaining = &remaining[idx + 1..];
            continue;
        }

        chunks.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }

    if !remaining.is_empty() {
        chunks.push(remaining.trim().to_string());
    }

    chunks
}
