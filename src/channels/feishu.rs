use crate::bus::{InboundMessage, OutboundMessage};
use crate::channels::base::{BaseChannel, forward_to_bus};
use crate::config::FeishuConfig;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use indexmap::IndexSet;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const FEISHU_BASE: &str = "https://open.feishu.cn";
const MESSAGE_RECEIVE_EVENT: &str = "im.message.receive_v1";
const ACK_EMOJI: &str = "THUMBSUP";
const RECONNECT_DELAY_S: u64 = 5;
// Dedup cache: trim to the 500 most-recent ids once it exceeds 1000
const DEDUP_HIGH_WATER: usize = 1000;
const DEDUP_TRIM_TO: usize = 500;
// Refresh the tenant token when less than a minute of validity remains
const TOKEN_EXPIRY_MARGIN_S: u64 = 60;

fn msg_type_placeholder(msg_type: &str) -> String {
    match msg_type {
        "image" => "[image]".to_string(),
        "audio" => "[audio]".to_string(),
        "file" => "[file]".to_string(),
        "sticker" => "[sticker]".to_string(),
        other => format!("[{}]", other),
    }
}

/// `oc_…` ids address group chats, everything else is a user open id.
fn receive_id_type(chat_id: &str) -> &'static str {
    if chat_id.starts_with("oc_") {
        "chat_id"
    } else {
        "open_id"
    }
}

// Markdown tables: header row + dash/colon separator row + data rows
fn table_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)((?:^[ \t]*\|.+\|[ \t]*\n)(?:^[ \t]*\|[-:\s|]+\|[ \t]*\n)(?:^[ \t]*\|.+\|[ \t]*\n?)+)",
        )
        .expect("table regex is valid")
    })
}

fn split_table_row(line: &str) -> Vec<String> {
    line.trim()
        .trim_matches('|')
        .split('|')
        .map(|cell| cell.trim().to_string())
        .collect()
}

/// Parse one markdown table into a card table element.
fn parse_md_table(table_text: &str) -> Option<Value> {
    let lines: Vec<&str> = table_text
        .trim()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.len() < 3 {
        return None;
    }

    let headers = split_table_row(lines[0]);
    let rows: Vec<Vec<String>> = lines[2..].iter().map(|l| split_table_row(l)).collect();

    let columns: Vec<Value> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            json!({
                "tag": "column",
                "name": format!("c{}", i),
                "display_name": h,
                "width": "auto",
            })
        })
        .collect();

    let row_objects: Vec<Value> = rows
        .iter()
        .map(|row| {
            let mut obj = serde_json::Map::new();
            for i in 0..headers.len() {
                let cell = row.get(i).cloned().unwrap_or_default();
                obj.insert(format!("c{}", i), Value::String(cell));
            }
            Value::Object(obj)
        })
        .collect();

    Some(json!({
        "tag": "table",
        "page_size": rows.len() + 1,
        "columns": columns,
        "rows": row_objects,
    }))
}

/// Split content into markdown + table card elements, preserving order.
fn build_card_elements(content: &str) -> Vec<Value> {
    let mut elements = Vec::new();
    let mut last_end = 0;

    for m in table_re().find_iter(content) {
        let before = content[last_end..m.start()].trim();
        if !before.is_empty() {
            elements.push(json!({"tag": "markdown", "content": before}));
        }
        let element = parse_md_table(m.as_str())
            .unwrap_or_else(|| json!({"tag": "markdown", "content": m.as_str()}));
        elements.push(element);
        last_end = m.end();
    }

    let remaining = content[last_end..].trim();
    if !remaining.is_empty() {
        elements.push(json!({"tag": "markdown", "content": remaining}));
    }

    if elements.is_empty() {
        elements.push(json!({"tag": "markdown", "content": content}));
    }
    elements
}

fn render_card(content: &str) -> Value {
    json!({
        "config": {"wide_screen_mode": true},
        "elements": build_card_elements(content),
    })
}

struct TenantToken {
    value: String,
    expires_at: Instant,
}

/// Shared adapter core. The websocket thread and the channel both hold this
/// through an `Arc`; every event handler the thread submits runs against it
/// on the main scheduler.
pub(crate) struct FeishuWorker {
    config: FeishuConfig,
    inbound_tx: mpsc::Sender<InboundMessage>,
    http: reqwest::Client,
    api_base: String,
    seen_messages: Mutex<IndexSet<String>>,
    token: Mutex<Option<TenantToken>>,
}

impl FeishuWorker {
    fn new(config: FeishuConfig, inbound_tx: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            config,
            inbound_tx,
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            api_base: FEISHU_BASE.to_string(),
            seen_messages: Mutex::new(IndexSet::new()),
            token: Mutex::new(None),
        }
    }

    async fn tenant_token(&self) -> Result<String> {
        {
            let guard = self.token.lock().await;
            if let Some(token) = guard.as_ref()
                && token.expires_at > Instant::now() + Duration::from_secs(TOKEN_EXPIRY_MARGIN_S)
            {
                return Ok(token.value.clone());
            }
        }

        let url = format!("{}/open-apis/auth/v3/tenant_access_token/internal", self.api_base);
        let resp: Value = self
            .http
            .post(&url)
            .json(&json!({
                "app_id": self.config.app_id,
                "app_secret": self.config.app_secret,
            }))
            .send()
            .await?
            .json()
            .await
            .context("Failed to parse tenant token response")?;

        if resp.get("code").and_then(Value::as_i64) != Some(0) {
            bail!(
                "Feishu tenant token request failed: {}",
                resp.get("msg").and_then(Value::as_str).unwrap_or("unknown")
            );
        }
        let value = resp
            .get("tenant_access_token")
            .and_then(Value::as_str)
            .context("Tenant token response missing token")?
            .to_string();
        let expire_s = resp.get("expire").and_then(Value::as_u64).unwrap_or(7200);

        *self.token.lock().await = Some(TenantToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(expire_s),
        });
        Ok(value)
    }

    /// Fetch the long-connection websocket endpoint for this app.
    async fn discover_endpoint(&self) -> Result<String> {
        let url = format!("{}/callback/ws/endpoint", self.api_base);
        let resp: Value = self
            .http
            .post(&url)
            .json(&json!({
                "AppID": self.config.app_id,
                "AppSecret": self.config.app_secret,
            }))
            .send()
            .await?
            .json()
            .await
            .context("Failed to parse ws endpoint response")?;

        if resp.get("code").and_then(Value::as_i64) != Some(0) {
            bail!(
                "Feishu ws endpoint request failed: {}",
                resp.get("msg").and_then(Value::as_str).unwrap_or("unknown")
            );
        }
        resp.get("data")
            .and_then(|d| d.get("URL"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .context("Feishu ws endpoint response missing URL")
    }

    /// Best-effort "seen" acknowledgement. Failures are logged, never surfaced.
    async fn add_reaction(&self, message_id: &str) {
        let result: Result<()> = async {
            let token = self.tenant_token().await?;
            let url = format!(
                "{}/open-apis/im/v1/messages/{}/reactions",
                self.api_base, message_id
            );
            let resp: Value = self
                .http
                .post(&url)
                .bearer_auth(token)
                .json(&json!({"reaction_type": {"emoji_type": ACK_EMOJI}}))
                .send()
                .await?
                .json()
                .await?;
            if resp.get("code").and_then(Value::as_i64) != Some(0) {
                bail!(
                    "code={}, msg={}",
                    resp.get("code").and_then(Value::as_i64).unwrap_or(-1),
                    resp.get("msg").and_then(Value::as_str).unwrap_or("unknown")
                );
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => debug!("Added {} reaction to message {}", ACK_EMOJI, message_id),
            Err(e) => warn!("Failed to add reaction: {}", e),
        }
    }

    /// Returns true when the id was already seen. Inserts it otherwise and
    /// trims the cache to its bound.
    async fn is_duplicate(&self, message_id: &str) -> bool {
        let mut seen = self.seen_messages.lock().await;
        if seen.contains(message_id) {
            return true;
        }
        seen.insert(message_id.to_string());
        if seen.len() > DEDUP_HIGH_WATER {
            let keep_from = seen.len() - DEDUP_TRIM_TO;
            *seen = seen.split_off(keep_from);
        }
        false
    }

    /// Async half of the event bridge, submitted to the main scheduler by the
    /// websocket thread for every received envelope.
    async fn handle_event(&self, envelope: Value) {
        let header = envelope.get("header").cloned().unwrap_or(Value::Null);
        if header.get("event_type").and_then(Value::as_str) != Some(MESSAGE_RECEIVE_EVENT) {
            return;
        }
        if !self.config.verification_token.is_empty()
            && header.get("token").and_then(Value::as_str)
                != Some(self.config.verification_token.as_str())
        {
            warn!("Feishu event with mismatched verification token dropped");
            return;
        }

        let event = envelope.get("event").cloned().unwrap_or(Value::Null);
        let message = event.get("message").cloned().unwrap_or(Value::Null);
        let sender = event.get("sender").cloned().unwrap_or(Value::Null);

        let Some(message_id) = message.get("message_id").and_then(Value::as_str) else {
            return;
        };
        if self.is_duplicate(message_id).await {
            return;
        }

        if sender.get("sender_type").and_then(Value::as_str) == Some("bot") {
            return;
        }

        let sender_id = sender
            .get("sender_id")
            .and_then(|s| s.get("open_id"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let chat_id = message.get("chat_id").and_then(Value::as_str).unwrap_or("");
        let chat_type = message
            .get("chat_type")
            .and_then(Value::as_str)
            .unwrap_or("p2p");
        let msg_type = message
            .get("message_type")
            .and_then(Value::as_str)
            .unwrap_or("");

        self.add_reaction(message_id).await;

        let content = if msg_type == "text" {
            let raw = message.get("content").and_then(Value::as_str).unwrap_or("");
            serde_json::from_str::<Value>(raw)
                .ok()
                .and_then(|v| v.get("text").and_then(Value::as_str).map(ToString::to_string))
                .unwrap_or_else(|| raw.to_string())
        } else {
            msg_type_placeholder(msg_type)
        };
        if content.is_empty() {
            return;
        }

        // p2p chats are addressed back at the user's open id, groups at the chat id
        let reply_target = if chat_type == "group" { chat_id } else { sender_id };

        let mut metadata = HashMap::new();
        metadata.insert("message_id".to_string(), json!(message_id));
        metadata.insert("chat_type".to_string(), json!(chat_type));
        metadata.insert("msg_type".to_string(), json!(msg_type));

        forward_to_bus(
            "feishu",
            &self.config.allow_from,
            &self.inbound_tx,
            sender_id,
            reply_target,
            content,
            Vec::new(),
            metadata,
        )
        .await;
    }

    async fn send_card(&self, msg: &OutboundMessage) -> Result<()> {
        let token = self.tenant_token().await?;
        let card = render_card(&msg.content);
        let url = format!(
            "{}/open-apis/im/v1/messages?receive_id_type={}",
            self.api_base,
            receive_id_type(&msg.chat_id)
        );

        let resp: Value = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&json!({
                "receive_id": msg.chat_id,
                "msg_type": "interactive",
                "content": card.to_string(),
            }))
            .send()
            .await?
            .json()
            .await
            .context("Failed to parse Feishu send response")?;

        if resp.get("code").and_then(Value::as_i64) != Some(0) {
            bail!(
                "Failed to send Feishu message: code={}, msg={}",
                resp.get("code").and_then(Value::as_i64).unwrap_or(-1),
                resp.get("msg").and_then(Value::as_str).unwrap_or("unknown")
            );
        }
        debug!("Feishu message sent to {}", msg.chat_id);
        Ok(())
    }
}

/// Synchronous event callback invoked on the websocket thread. It must never
/// run the handler inline: events are submitted to the captured scheduler.
fn dispatch_event(worker: &Arc<FeishuWorker>, scheduler: &tokio::runtime::Handle, envelope: Value) {
    let worker = worker.clone();
    scheduler.spawn(async move {
        worker.handle_event(envelope).await;
    });
}

/// Websocket loop owned by a dedicated OS thread: endpoint discovery,
/// connect, frame pump, reconnect. Runs until `running` clears.
fn run_event_thread(
    worker: Arc<FeishuWorker>,
    scheduler: tokio::runtime::Handle,
    running: Arc<AtomicBool>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build Feishu websocket runtime: {}", e);
            return;
        }
    };

    rt.block_on(async move {
        while running.load(Ordering::SeqCst) {
            match worker.discover_endpoint().await {
                Ok(endpoint) => match connect_async(endpoint.as_str()).await {
                    Ok((ws, _)) => {
                        info!("Feishu long connection established");
                        let (mut write, mut read) = ws.split();
                        while let Some(frame) = read.next().await {
                            if !running.load(Ordering::SeqCst) {
                                return;
                            }
                            match frame {
                                Ok(Message::Text(text)) => {
                                    match serde_json::from_str::<Value>(&text) {
                                        Ok(envelope) => {
                                            dispatch_event(&worker, &scheduler, envelope);
                                        }
                                        Err(e) => {
                                            warn!("Invalid JSON from Feishu connection: {}", e);
                                        }
                                    }
                                }
                                Ok(Message::Ping(data)) => {
                                    if write.send(Message::Pong(data)).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(Message::Close(_)) => {
                                    info!("Feishu long connection closed");
                                    break;
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    warn!("Feishu websocket error: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => warn!("Feishu websocket connect failed: {}", e),
                },
                Err(e) => warn!("Feishu endpoint discovery failed: {}", e),
            }

            if running.load(Ordering::SeqCst) {
                info!(
                    "Reconnecting Feishu long connection in {} seconds...",
                    RECONNECT_DELAY_S
                );
                std::thread::sleep(Duration::from_secs(RECONNECT_DELAY_S));
            }
        }
    });
}

/// Feishu/Lark channel bridged from an SDK-style websocket thread.
///
/// The websocket loop owns its own OS thread; events cross back into the
/// cooperative scheduler through the runtime handle captured in `start()`.
pub struct FeishuChannel {
    config: FeishuConfig,
    inbound_tx: mpsc::Sender<InboundMessage>,
    running: Arc<AtomicBool>,
    worker: Arc<FeishuWorker>,
    ws_thread: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FeishuChannel {
    pub fn new(config: FeishuConfig, inbound_tx: mpsc::Sender<InboundMessage>) -> Self {
        let worker = Arc::new(FeishuWorker::new(config.clone(), inbound_tx.clone()));
        Self {
            config,
            inbound_tx,
            running: Arc::new(AtomicBool::new(false)),
            worker,
            ws_thread: std::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl BaseChannel for FeishuChannel {
    fn name(&self) -> &'static str {
        "feishu"
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
        if self.config.app_id.is_empty() || self.config.app_secret.is_empty() {
            bail!("Feishu app_id and app_secret not configured");
        }

        self.running.store(true, Ordering::SeqCst);

        // Capture the scheduler the websocket thread will submit events to
        let scheduler = tokio::runtime::Handle::current();
        let worker = self.worker.clone();
        let running = self.running.clone();

        let thread = std::thread::Builder::new()
            .name("feishu-ws".to_string())
            .spawn(move || run_event_thread(worker, scheduler, running))
            .context("Failed to spawn Feishu websocket thread")?;
        *self.ws_thread.lock().expect("ws thread lock") = Some(thread);

        info!("Feishu bot started with websocket long connection");
        info!("No public IP required - using websocket to receive events");

        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        // The websocket thread observes the flag on its next frame or
        // reconnect and winds down on its own; it is not joined here.
        self.ws_thread.lock().expect("ws thread lock").take();
        info!("Feishu bot stopped");
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        self.worker.send_card(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_worker(
        api_base: &str,
        allow: Vec<&str>,
        verification_token: &str,
    ) -> (Arc<FeishuWorker>, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let config = FeishuConfig {
            enabled: true,
            app_id: "cli_test".into(),
            app_secret: "secret".into(),
            verification_token: verification_token.into(),
            allow_from: allow.into_iter().map(String::from).collect(),
            ..Default::default()
        };
        let mut worker = FeishuWorker::new(config, tx);
        worker.api_base = api_base.to_string();
        (Arc::new(worker), rx)
    }

    fn text_event(message_id: &str, chat_type: &str, text: &str) -> Value {
        json!({
            "schema": "2.0",
            "header": {
                "event_id": "evt_1",
                "event_type": MESSAGE_RECEIVE_EVENT,
                "token": "vtok",
            },
            "event": {
                "sender": {
                    "sender_type": "user",
                    "sender_id": {"open_id": "ou_alice"},
                },
                "message": {
                    "message_id": message_id,
                    "chat_id": "oc_room",
                    "chat_type": chat_type,
                    "message_type": "text",
                    "content": json!({"text": text}).to_string(),
                },
            },
        })
    }

    async fn mount_reaction_stubs(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/open-apis/auth/v3/tenant_access_token/internal"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"code": 0, "tenant_access_token": "t-abc", "expire": 7200}),
            ))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/open-apis/im/v1/messages/.*/reactions$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0})))
            .mount(server)
            .await;
    }

    #[test]
    fn test_receive_id_type_prefix() {
        assert_eq!(receive_id_type("oc_12345"), "chat_id");
        assert_eq!(receive_id_type("ou_12345"), "open_id");
        assert_eq!(receive_id_type("anything"), "open_id");
    }

    #[test]
    fn test_placeholder_mapping() {
        assert_eq!(msg_type_placeholder("image"), "[image]");
        assert_eq!(msg_type_placeholder("sticker"), "[sticker]");
        assert_eq!(msg_type_placeholder("share_chat"), "[share_chat]");
    }

    #[test]
    fn test_parse_md_table() {
        let table = "| Name | Age |\n| --- | --- |\n| Alice | 30 |\n| Bob | 25 |\n";
        let element = parse_md_table(table).unwrap();
        assert_eq!(element["tag"], "table");
        assert_eq!(element["columns"][0]["display_name"], "Name");
        assert_eq!(element["rows"][0]["c0"], "Alice");
        assert_eq!(element["rows"][1]["c1"], "25");
    }

    #[test]
    fn test_parse_md_table_ragged_rows_padded() {
        let table = "| A | B |\n| - | - |\n| only |\n";
        let element = parse_md_table(table).unwrap();
        assert_eq!(element["rows"][0]["c0"], "only");
        assert_eq!(element["rows"][0]["c1"], "");
    }

    #[test]
    fn test_card_elements_preserve_order() {
        let content = "Intro text\n\n| H |\n| - |\n| v |\n\nClosing text";
        let elements = build_card_elements(content);
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[0]["tag"], "markdown");
        assert_eq!(elements[0]["content"], "Intro text");
        assert_eq!(elements[1]["tag"], "table");
        assert_eq!(elements[2]["content"], "Closing text");
    }

    #[test]
    fn test_card_plain_text_single_markdown() {
        let elements = build_card_elements("just prose, no tables");
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0]["tag"], "markdown");
    }

    #[test]
    fn test_render_card_shape() {
        let card = render_card("hello");
        assert_eq!(card["config"]["wide_screen_mode"], true);
        assert!(card["elements"].as_array().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_event_published_once() {
        let server = MockServer::start().await;
        mount_reaction_stubs(&server).await;
        let (worker, mut rx) = test_worker(&server.uri(), vec![], "");

        for _ in 0..5 {
            worker.handle_event(text_event("om_1", "group", "hello")).await;
        }

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.content, "hello");
        assert!(rx.try_recv().is_err());
        assert!(worker.seen_messages.lock().await.contains("om_1"));
    }

    #[tokio::test]
    async fn test_dedup_cache_trims_to_most_recent() {
        let server = MockServer::start().await;
        let (worker, _rx) = test_worker(&server.uri(), vec![], "");

        for i in 0..1500 {
            worker.is_duplicate(&format!("om_{}", i)).await;
        }

        let seen = worker.seen_messages.lock().await;
        assert_eq!(seen.len(), DEDUP_TRIM_TO + 499);
        // Most recent ids survive, oldest are gone
        assert!(seen.contains("om_1499"));
        assert!(!seen.contains("om_0"));
    }

    #[tokio::test]
    async fn test_bot_sender_filtered() {
        let server = MockServer::start().await;
        let (worker, mut rx) = test_worker(&server.uri(), vec![], "");

        let mut event = text_event("om_bot", "group", "beep");
        event["event"]["sender"]["sender_type"] = json!("bot");
        worker.handle_event(event).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_group_chat_addresses_chat_id() {
        let server = MockServer::start().await;
        mount_reaction_stubs(&server).await;
        let (worker, mut rx) = test_worker(&server.uri(), vec![], "");

        worker.handle_event(text_event("om_g", "group", "hi")).await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.chat_id, "oc_room");
        assert_eq!(msg.session_key(), "feishu:oc_room");
    }

    #[tokio::test]
    async fn test_p2p_chat_addresses_open_id() {
        let server = MockServer::start().await;
        mount_reaction_stubs(&server).await;
        let (worker, mut rx) = test_worker(&server.uri(), vec![], "");

        worker.handle_event(text_event("om_p", "p2p", "hi")).await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.chat_id, "ou_alice");
    }

    #[tokio::test]
    async fn test_non_text_message_placeholder() {
        let server = MockServer::start().await;
        mount_reaction_stubs(&server).await;
        let (worker, mut rx) = test_worker(&server.uri(), vec![], "");

        let mut event = text_event("om_img", "group", "");
        event["event"]["message"]["message_type"] = json!("image");
        worker.handle_event(event).await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.content, "[image]");
    }

    #[tokio::test]
    async fn test_verification_token_mismatch_dropped() {
        let server = MockServer::start().await;
        let (worker, mut rx) = test_worker(&server.uri(), vec![], "expected-token");

        worker.handle_event(text_event("om_v", "group", "hi")).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disallowed_sender_dropped() {
        let server = MockServer::start().await;
        mount_reaction_stubs(&server).await;
        let (worker, mut rx) = test_worker(&server.uri(), vec!["ou_bob"], "");

        worker.handle_event(text_event("om_a", "group", "hi")).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reaction_failure_never_blocks_delivery() {
        // No stubs mounted: token fetch 404s, reaction fails, message still flows
        let server = MockServer::start().await;
        let (worker, mut rx) = test_worker(&server.uri(), vec![], "");

        worker.handle_event(text_event("om_r", "group", "hi")).await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.content, "hi");
    }

    #[tokio::test]
    async fn test_send_card_posts_interactive_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/open-apis/auth/v3/tenant_access_token/internal"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"code": 0, "tenant_access_token": "t-abc", "expire": 7200}),
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/open-apis/im/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0})))
            .expect(1)
            .mount(&server)
            .await;

        let (worker, _rx) = test_worker(&server.uri(), vec![], "");
        let msg = OutboundMessage::new("feishu", "oc_room", "hello");
        worker.send_card(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_tenant_token_cached_between_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/open-apis/auth/v3/tenant_access_token/internal"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"code": 0, "tenant_access_token": "t-abc", "expire": 7200}),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let (worker, _rx) = test_worker(&server.uri(), vec![], "");
        assert_eq!(worker.tenant_token().await.unwrap(), "t-abc");
        assert_eq!(worker.tenant_token().await.unwrap(), "t-abc");
    }
}
