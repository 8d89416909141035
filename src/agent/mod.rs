//! The narrow contracts this core consumes from the agent, plus the glue
//! that wires them to the bus, the cron service and the heartbeat service.
//! The agent's reasoning loop itself lives outside this crate.

use crate::bus::{InboundMessage, OutboundMessage};
use crate::cron::CronJobCallback;
use crate::heartbeat::HeartbeatCallback;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// One agent turn. The core never looks inside the agent.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    async fn process_direct(
        &self,
        content: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<String>;
}

/// Consume inbound messages, run agent turns, publish replies.
///
/// Agent errors are logged and the loop continues; it exits when the
/// inbound queue closes.
pub async fn run_agent_loop(
    agent: Arc<dyn AgentHandle>,
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
) {
    info!("Agent loop started");
    while let Some(msg) = inbound_rx.recv().await {
        let session_key = msg.session_key();
        debug!(
            "Agent turn: session={}, content_len={}",
            session_key,
            msg.content.len()
        );

        match agent
            .process_direct(&msg.content, &session_key, &msg.channel, &msg.chat_id)
            .await
        {
            Ok(response) => {
                if response.trim().is_empty() {
                    continue;
                }
                let mut out = OutboundMessage::new(&msg.channel, &msg.chat_id, response);
                out.reply_to = msg
                    .metadata
                    .get("message_id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(ToString::to_string);
                if outbound_tx.send(out).await.is_err() {
                    warn!("Outbound queue closed, agent loop exiting");
                    break;
                }
            }
            Err(e) => error!("Agent error for {}: {}", session_key, e),
        }
    }
    info!("Agent loop stopped");
}

/// Adapt an [`AgentHandle`] to the cron `on_job` contract. When the job
/// payload asks for delivery and the agent returns a non-empty response, it
/// is emitted to the payload's channel/target.
pub fn cron_job_callback(
    agent: Arc<dyn AgentHandle>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
) -> CronJobCallback {
    Arc::new(move |job| {
        let agent = agent.clone();
        let outbound_tx = outbound_tx.clone();
        Box::pin(async move {
            if job.payload.kind != "agent_turn" {
                return Ok(None);
            }
            let session_key = format!("cron:{}", job.id);
            let response = agent
                .process_direct(&job.payload.message, &session_key, "cron", &job.id)
                .await?;

            if job.payload.deliver
                && !response.trim().is_empty()
                && let (Some(channel), Some(to)) = (&job.payload.channel, &job.payload.to)
            {
                let out = OutboundMessage::new(channel, to, response.clone());
                if let Err(e) = outbound_tx.send(out).await {
                    warn!("Cron: failed to deliver response for job {}: {}", job.id, e);
                }
            }
            Ok(Some(response))
        })
    })
}

/// Adapt an [`AgentHandle`] to the heartbeat `on_heartbeat` contract.
pub fn heartbeat_callback(agent: Arc<dyn AgentHandle>) -> HeartbeatCallback {
    Arc::new(move |prompt| {
        let agent = agent.clone();
        Box::pin(async move {
            agent
                .process_direct(&prompt, "heartbeat:main", "system", "heartbeat")
                .await
        })
    })
}
