use crate::bus::{MessageBus, OutboundMessage};
use crate::channels::base::BaseChannel;
#[cfg(feature = "channel-discord")]
use crate::channels::discord::DiscordChannel;
#[cfg(feature = "channel-feishu")]
use crate::channels::feishu::FeishuChannel;
use crate::config::Config;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long the dispatcher waits on the outbound queue before re-checking
/// for cancellation.
const DISPATCH_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub enabled: bool,
    pub running: bool,
}

/// Owns the channel adapters and the outbound dispatcher.
///
/// Adapters run as independently supervised tasks: one adapter crashing
/// never tears down the others, the dispatcher, or the process.
pub struct ChannelManager {
    channels: IndexMap<String, Arc<dyn BaseChannel>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    channel_tasks: Mutex<Vec<JoinHandle<()>>>,
    channel_aborts: Mutex<Vec<tokio::task::AbortHandle>>,
    stopping: Arc<AtomicBool>,
}

impl ChannelManager {
    // Variables used conditionally inside #[cfg(feature)] blocks
    #[allow(unused_variables, unused_mut)]
    pub fn new(config: &Config, bus: &mut MessageBus) -> Self {
        let inbound_tx = bus.inbound_sender();
        let outbound_rx = bus.take_outbound_rx();
        let mut channels: IndexMap<String, Arc<dyn BaseChannel>> = IndexMap::new();

        #[cfg(feature = "channel-discord")]
        if config.channels.discord.enabled {
            if config.channels.discord.token.is_empty() {
                warn!("Discord is enabled but no token is configured, skipping");
            } else {
                channels.insert(
                    "discord".to_string(),
                    Arc::new(DiscordChannel::new(
                        config.channels.discord.clone(),
                        inbound_tx.clone(),
                    )),
                );
                info!("Discord channel enabled");
            }
        }
        #[cfg(not(feature = "channel-discord"))]
        if config.channels.discord.enabled {
            warn!(
                "Discord is enabled in config but not compiled (missing 'channel-discord' feature)"
            );
        }

        #[cfg(feature = "channel-feishu")]
        if config.channels.feishu.enabled {
            if config.channels.feishu.app_id.is_empty()
                || config.channels.feishu.app_secret.is_empty()
            {
                warn!("Feishu is enabled but app_id/app_secret are not configured, skipping");
            } else {
                channels.insert(
                    "feishu".to_string(),
                    Arc::new(FeishuChannel::new(
                        config.channels.feishu.clone(),
                        inbound_tx.clone(),
                    )),
                );
                info!("Feishu channel enabled");
            }
        }
        #[cfg(not(feature = "channel-feishu"))]
        if config.channels.feishu.enabled {
            warn!(
                "Feishu is enabled in config but not compiled (missing 'channel-feishu' feature)"
            );
        }

        Self {
            channels,
            outbound_rx: Mutex::new(outbound_rx),
            dispatch_task: Mutex::new(None),
            channel_tasks: Mutex::new(Vec::new()),
            channel_aborts: Mutex::new(Vec::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    #[cfg(test)]
    fn with_channels(
        channels: Vec<Arc<dyn BaseChannel>>,
        outbound_rx: mpsc::Receiver<OutboundMessage>,
    ) -> Self {
        let channels = channels
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        Self {
            channels,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            dispatch_task: Mutex::new(None),
            channel_tasks: Mutex::new(Vec::new()),
            channel_aborts: Mutex::new(Vec::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn enabled_channels(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn get_channel(&self, name: &str) -> Option<Arc<dyn BaseChannel>> {
        self.channels.get(name).cloned()
    }

    /// Launch every adapter as a supervised task and start the outbound
    /// dispatcher. Returns once everything is launched.
    pub async fn start_all(&self) {
        if self.channels.is_empty() {
            warn!("No channels enabled");
            return;
        }

        if let Some(rx) = self.outbound_rx.lock().await.take() {
            let channels = self.channels.clone();
            let stopping = self.stopping.clone();
            let handle = tokio::spawn(Self::dispatch_outbound(channels, rx, stopping));
            *self.dispatch_task.lock().await = Some(handle);
        }

        let mut tasks = self.channel_tasks.lock().await;
        let mut aborts = self.channel_aborts.lock().await;
        for (name, channel) in &self.channels {
            info!("Starting {} channel...", name);
            let name = name.clone();
            let channel = channel.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = channel.start().await {
                    error!("Failed to start channel {}: {}", name, e);
                }
            });
            aborts.push(task.abort_handle());
            tasks.push(task);
        }
    }

    /// Block until every adapter task finishes (normally only on shutdown).
    /// A panicking adapter is logged and never tears down the others.
    pub async fn wait_all(&self) {
        let tasks: Vec<JoinHandle<()>> = self.channel_tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                error!("Channel task panicked: {}", e);
            }
        }
    }

    /// Consume the outbound queue and hand each message to its adapter.
    /// Unknown channels and send failures are logged; neither stops the loop.
    async fn dispatch_outbound(
        channels: IndexMap<String, Arc<dyn BaseChannel>>,
        mut rx: mpsc::Receiver<OutboundMessage>,
        stopping: Arc<AtomicBool>,
    ) {
        info!("Outbound dispatcher started");
        loop {
            if stopping.load(Ordering::SeqCst) {
                break;
            }
            match tokio::time::timeout(DISPATCH_POLL, rx.recv()).await {
                Ok(Some(msg)) => match channels.get(&msg.channel) {
                    Some(channel) => {
                        if let Err(e) = channel.send(&msg).await {
                            error!("Error sending to {}: {}", msg.channel, e);
                        }
                    }
                    None => warn!("Unknown channel: {}", msg.channel),
                },
                Ok(None) => break, // bus closed
                Err(_) => {}       // periodic wakeup so cancellation is timely
            }
        }
        info!("Outbound dispatcher stopped");
    }

    pub async fn stop_all(&self) {
        info!("Stopping all channels...");
        self.stopping.store(true, Ordering::SeqCst);

        if let Some(task) = self.dispatch_task.lock().await.take() {
            task.abort();
        }

        for (name, channel) in &self.channels {
            match channel.stop().await {
                Ok(()) => info!("Stopped {} channel", name),
                Err(e) => error!("Error stopping {}: {}", name, e),
            }
        }

        for abort in self.channel_aborts.lock().await.drain(..) {
            abort.abort();
        }
        self.channel_tasks.lock().await.clear();
    }

    pub fn get_status(&self) -> HashMap<String, ChannelStatus> {
        self.channels
            .iter()
            .map(|(name, channel)| {
                (
                    name.clone(),
                    ChannelStatus {
                        enabled: true,
                        running: channel.is_running(),
                    },
                )
            })
            .collect()
    }
}
