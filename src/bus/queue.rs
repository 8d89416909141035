use crate::bus::{InboundMessage, OutboundMessage};
use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_INBOUND_CAPACITY: usize = 1000;
const DEFAULT_OUTBOUND_CAPACITY: usize = 1000;

/// In-process FIFO pair decoupling channel adapters from the agent.
///
/// Two independent bounded queues: `inbound` (adapter -> agent) and
/// `outbound` (agent -> channel manager). Publishing applies backpressure
/// when a queue is full. The bus is pure transport: it knows nothing about
/// channels, sessions, or retry.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Option<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Option<mpsc::Receiver<OutboundMessage>>,
}

impl MessageBus {
    pub fn new(inbound_capacity: usize, outbound_capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity);
        Self {
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        }
    }

    /// Sender handle adapters publish ingress through.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Sender handle the agent publishes egress through.
    pub fn outbound_sender(&self) -> mpsc::Sender<OutboundMessage> {
        self.outbound_tx.clone()
    }

    /// Extract the inbound receiver. Single-reader: the agent loop owns it,
    /// so no lock is held across `recv().await`.
    pub fn take_inbound_rx(&mut self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.take()
    }

    /// Extract the outbound receiver. Single-reader: the dispatcher owns it.
    pub fn take_outbound_rx(&mut self) -> Option<mpsc::Receiver<OutboundMessage>> {
        self.outbound_rx.take()
    }

    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<()> {
        let channel = msg.channel.clone();
        let sender_id = msg.sender_id.clone();
        self.inbound_tx
            .send(msg)
            .await
            .context("Failed to send inbound message - receiver closed")?;
        debug!(
            "inbound message queued: channel={}, sender={}",
            channel, sender_id
        );
        Ok(())
    }

    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<()> {
        let channel = msg.channel.clone();
        let chat_id = msg.chat_id.clone();
        self.outbound_tx
            .send(msg)
            .await
            .context("Failed to send outbound message - receiver closed")?;
        debug!(
            "outbound message queued: channel={}, chat_id={}",
            channel, chat_id
        );
        Ok(())
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_INBOUND_CAPACITY, DEFAULT_OUTBOUND_CAPACITY)
    }
}
