use crate::bus::{InboundMessage, OutboundMessage};
use crate::channels::base::{BaseChannel, split_message};
use crate::config::DiscordConfig;
use crate::utils::{media_dir, safe_filename};
use anyhow::{Result, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{error, info, warn};

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const MAX_ATTACHMENT_BYTES: u64 = 20 * 1024 * 1024;
const MESSAGE_CHAR_LIMIT: usize = 2000;
const RECONNECT_DELAY_S: u64 = 5;
const TYPING_REFRESH_S: u64 = 8;
const SEND_ATTEMPTS: u32 = 3;

// Gateway opcodes
const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;

type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;

#[derive(Debug, Deserialize)]
struct GatewayFrame {
    op: u8,
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    d: Option<Value>,
}

/// How a gateway session ended, deciding the reconnect cadence.
enum GatewayExit {
    /// Server asked for an immediate reconnect (op 7).
    Resume,
    /// Invalid session, transport error or stream end: back off first.
    Backoff,
    /// `stop()` was requested.
    Stopped,
}

/// Discord channel speaking the raw Gateway websocket protocol, with sends
/// going through the REST API.
pub struct DiscordChannel {
    config: DiscordConfig,
    inbound_tx: mpsc::Sender<InboundMessage>,
    running: Arc<AtomicBool>,
    http: reqwest::Client,
    api_base: String,
    seq: Arc<Mutex<Option<u64>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    typing_tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl DiscordChannel {
    pub fn new(config: DiscordConfig, inbound_tx: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            config,
            inbound_tx,
            running: Arc::new(AtomicBool::new(false)),
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            api_base: DISCORD_API_BASE.to_string(),
            seq: Arc::new(Mutex::new(None)),
            heartbeat_task: Mutex::new(None),
            typing_tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[cfg(test)]
    fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.to_string();
        self
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.config.token)
    }

    async fn gateway_loop(&self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> GatewayExit {
        let (write, mut read) = ws.split();
        let write = Arc::new(Mutex::new(write));

        while let Some(frame) = read.next().await {
            if !self.running.load(Ordering::SeqCst) {
                return GatewayExit::Stopped;
            }
            match frame {
                Ok(Message::Text(text)) => {
                    let frame: GatewayFrame = match serde_json::from_str(&text) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!("Invalid JSON from Discord gateway: {}", e);
                            continue;
                        }
                    };

                    if let Some(seq) = frame.s {
                        *self.seq.lock().await = Some(seq);
                    }

                    match frame.op {
                        OP_HELLO => {
                            let interval_ms = frame
                                .d
                                .as_ref()
                                .and_then(|d| d.get("heartbeat_interval"))
                                .and_then(Value::as_u64)
                                .unwrap_or(45_000);
                            self.start_heartbeat(write.clone(), interval_ms).await;
                            if let Err(e) = self.identify(&write).await {
                                warn!("Discord IDENTIFY failed: {}", e);
                                return GatewayExit::Backoff;
                            }
                        }
                        OP_DISPATCH => match frame.t.as_deref() {
                            Some("READY") => info!("Discord gateway READY"),
                            Some("MESSAGE_CREATE") => {
                                if let Some(payload) = frame.d {
                                    self.handle_message_create(payload).await;
                                }
                            }
                            _ => {}
                        },
                        OP_RECONNECT => {
                            info!("Discord gateway requested reconnect");
                            return GatewayExit::Resume;
                        }
                        OP_INVALID_SESSION => {
                            warn!("Discord gateway invalid session");
                            return GatewayExit::Backoff;
                        }
                        _ => {}
                    }
                }
                Ok(Message::Ping(data)) => {
                    if let Err(e) = write.lock().await.send(Message::Pong(data)).await {
                        warn!("Discord gateway pong failed: {}", e);
                        return GatewayExit::Backoff;
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("Discord gateway connection closed");
                    return GatewayExit::Backoff;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Discord gateway error: {}", e);
                    return GatewayExit::Backoff;
                }
            }
        }

        GatewayExit::Backoff
    }

    async fn identify(&self, write: &Arc<Mutex<WsSink>>) -> Result<()> {
        let identify = json!({
            "op": OP_IDENTIFY,
            "d": {
                "token": self.config.token,
                "intents": self.config.intents,
                "properties": {
                    "os": "nanobot",
                    "browser": "nanobot",
                    "device": "nanobot",
                },
            },
        });
        write
            .lock()
            .await
            .send(Message::text(identify.to_string()))
            .await?;
        Ok(())
    }

    /// Start (or restart) the heartbeat loop for the current connection.
    /// The heartbeat payload carries the last seen sequence number.
    async fn start_heartbeat(&self, write: Arc<Mutex<WsSink>>, interval_ms: u64) {
        let interval = Duration::from_millis(interval_ms);
        let seq = self.seq.clone();
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let payload = json!({"op": OP_HEARTBEAT, "d": *seq.lock().await});
                if let Err(e) = write
                    .lock()
                    .await
                    .send(Message::text(payload.to_string()))
                    .await
                {
                    warn!("Discord heartbeat failed: {}", e);
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        });

        if let Some(old) = self.heartbeat_task.lock().await.replace(handle) {
            old.abort();
        }
    }

    async fn cancel_heartbeat(&self) {
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            task.abort();
        }
    }

    async fn handle_message_create(&self, payload: Value) {
        let author = payload.get("author").cloned().unwrap_or(Value::Null);
        if author.get("bot").and_then(Value::as_bool) == Some(true) {
            return;
        }

        let sender_id = author.get("id").and_then(Value::as_str).unwrap_or("");
        let channel_id = payload
            .get("channel_id")
            .and_then(Value::as_str)
            .unwrap_or("");
        if sender_id.is_empty() || channel_id.is_empty() {
            return;
        }
        if !self.is_allowed(sender_id) {
            return;
        }

        let content = payload
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("");
        let mut content_parts: Vec<String> = if content.is_empty() {
            Vec::new()
        } else {
            vec![content.to_string()]
        };
        let mut media_paths = Vec::new();

        let attachments = payload
            .get("attachments")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for attachment in &attachments {
            let Some(url) = attachment.get("url").and_then(Value::as_str) else {
                continue;
            };
            let filename = attachment
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or("attachment");
            let size = attachment.get("size").and_then(Value::as_u64).unwrap_or(0);
            if size > MAX_ATTACHMENT_BYTES {
                content_parts.push(format!("[attachment: {} - too large]", filename));
                continue;
            }
            let attachment_id = attachment
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("file");
            match self.download_attachment(url, attachment_id, filename).await {
                Ok(path) => {
                    content_parts.push(format!("[attachment: {}]", path));
                    media_paths.push(path);
                }
                Err(e) => {
                    warn!("Failed to download Discord attachment: {}", e);
                    content_parts.push(format!("[attachment: {} - download failed]", filename));
                }
            }
        }

        let reply_to = payload
            .get("referenced_message")
            .and_then(|r| r.get("id"))
            .and_then(Value::as_str)
            .map(ToString::to_string);

        self.start_typing(channel_id).await;

        let mut metadata = HashMap::new();
        metadata.insert(
            "message_id".to_string(),
            json!(payload.get("id").and_then(Value::as_str).unwrap_or("")),
        );
        metadata.insert(
            "guild_id".to_string(),
            payload.get("guild_id").cloned().unwrap_or(Value::Null),
        );
        metadata.insert("reply_to".to_string(), json!(reply_to));

        let content = if content_parts.is_empty() {
            "[empty message]".to_string()
        } else {
            content_parts.join("\n")
        };

        self.handle_message(sender_id, channel_id, content, media_paths, metadata)
            .await;
    }

    async fn download_attachment(
        &self,
        url: &str,
        attachment_id: &str,
        filename: &str,
    ) -> Result<String> {
        let dir = media_dir()?;
        let file_path = dir.join(format!("{}_{}", attachment_id, safe_filename(filename)));
        let resp = self.http.get(url).send().await?.error_for_status()?;
        let bytes = resp.bytes().await?;
        tokio::fs::write(&file_path, &bytes).await?;
        Ok(file_path.to_string_lossy().to_string())
    }

    /// Start the periodic typing indicator for a conversation, replacing any
    /// prior task for the same conversation.
    async fn start_typing(&self, chat_id: &str) {
        self.stop_typing(chat_id).await;

        let url = format!("{}/channels/{}/typing", self.api_base, chat_id);
        let auth = self.auth_header();
        let http = self.http.clone();
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let _ = http
                    .post(&url)
                    .header("Authorization", &auth)
                    .send()
                    .await;
                tokio::time::sleep(Duration::from_secs(TYPING_REFRESH_S)).await;
            }
        });

        self.typing_tasks
            .lock()
            .await
            .insert(chat_id.to_string(), handle);
    }

    async fn stop_typing(&self, chat_id: &str) {
        if let Some(task) = self.typing_tasks.lock().await.remove(chat_id) {
            task.abort();
        }
    }

    /// POST one chunk, honoring 429 `retry_after` for up to `SEND_ATTEMPTS`
    /// total attempts.
    async fn post_message(&self, chat_id: &str, payload: &Value) -> Result<()> {
        let url = format!("{}/channels/{}/messages", self.api_base, chat_id);
        let mut last_err = None;

        for attempt in 1..=SEND_ATTEMPTS {
            let result = self
                .http
                .post(&url)
                .header("Authorization", self.auth_header())
                .json(payload)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().as_u16() == 429 => {
                    let body: Value = resp.json().await.unwrap_or(Value::Null);
                    let retry_after = body
                        .get("retry_after")
                        .and_then(Value::as_f64)
                        .unwrap_or(1.0);
                    warn!("Discord rate limited, retrying in {}s", retry_after);
                    last_err = Some(anyhow::anyhow!("rate limited"));
                    tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
                }
                Ok(resp) => match resp.error_for_status() {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        last_err = Some(e.into());
                        if attempt < SEND_ATTEMPTS {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                },
                Err(e) => {
                    last_err = Some(e.into());
                    if attempt < SEND_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Discord send failed")))
    }
}

#[async_trait]
impl BaseChannel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn allow_from(&self) -> &[String] {
        &self.config.allow_from
    }

    fn inbound_tx(&self) -> &mpsc::Sender<InboundMessage> {
        &self.inbound_tx
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<()> {
        if self.config.token.is_empty() {
            bail!("Discord bot token not configured");
        }

        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            info!("Connecting to Discord gateway...");
            let exit = match connect_async(self.config.gateway_url.as_str()).await {
                Ok((ws, _)) => self.gateway_loop(ws).await,
                Err(e) => {
                    warn!("Discord gateway connect failed: {}", e);
                    GatewayExit::Backoff
                }
            };
            self.cancel_heartbeat().await;

            match exit {
                GatewayExit::Stopped => break,
                GatewayExit::Resume => {}
                GatewayExit::Backoff => {
                    if self.running.load(Ordering::SeqCst) {
                        info!(
                            "Reconnecting to Discord gateway in {} seconds...",
                            RECONNECT_DELAY_S
                        );
                        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_S)).await;
                    }
                }
            }
        }

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.cancel_heartbeat().await;
        let mut typing = self.typing_tasks.lock().await;
        for (_, task) in typing.drain() {
            task.abort();
        }
        *self.seq.lock().await = None;
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let chunks = split_message(&msg.content, MESSAGE_CHAR_LIMIT);
        let mut result = Ok(());

        for (i, chunk) in chunks.iter().enumerate() {
            let mut payload = json!({"content": chunk});
            // The reply reference rides the first chunk only
            if i == 0 && let Some(reply_to) = &msg.reply_to {
                payload["message_reference"] = json!({"message_id": reply_to});
                payload["allowed_mentions"] = json!({"replied_user": false});
            }
            if let Err(e) = self.post_message(&msg.chat_id, &payload).await {
                error!("Error sending Discord message: {}", e);
                result = Err(e);
                break;
            }
        }

        self.stop_typing(&msg.chat_id).await;
        result
    }
}
