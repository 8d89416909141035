use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub const DEFAULT_HEARTBEAT_INTERVAL_S: u64 = 30 * 60;

/// The prompt sent to the agent on each actionable heartbeat tick.
pub const HEARTBEAT_PROMPT: &str = "Read HEARTBEAT.md in your workspace (if it exists).\nFollow any instructions or tasks listed there.\nIf nothing needs attention, reply with just: HEARTBEAT_OK";

/// Sentinel indicating the heartbeat ran but no action was needed.
pub const HEARTBEAT_OK_TOKEN: &str = "HEARTBEAT_OK";

pub type HeartbeatCallback = Arc<
    dyn Fn(String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String>> + Send>>
        + Send
        + Sync,
>;

/// True when HEARTBEAT.md has no actionable content: every non-blank line is
/// a heading, an HTML comment, or an empty/checked checkbox token.
pub fn is_heartbeat_empty(content: Option<&str>) -> bool {
    let Some(content) = content else { return true };

    let skip_tokens = ["- [ ]", "* [ ]", "- [x]", "* [x]"];
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty()
            || line.starts_with('#')
            || line.starts_with("<!--")
            || skip_tokens.contains(&line)
        {
            continue;
        }
        return false;
    }
    true
}

/// Sentinel match is case-insensitive and ignores underscores.
fn response_is_ok(response: &str) -> bool {
    let needle = HEARTBEAT_OK_TOKEN.replace('_', "");
    response.to_uppercase().replace('_', "").contains(&needle)
}

/// Periodic service that wakes the agent to self-service the workspace task
/// file. Scheduling is independent of the cron service.
pub struct HeartbeatService {
    workspace: PathBuf,
    on_heartbeat: Option<HeartbeatCallback>,
    interval_s: u64,
    enabled: bool,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatService {
    pub fn new(
        workspace: PathBuf,
        on_heartbeat: Option<HeartbeatCallback>,
        interval_s: u64,
        enabled: bool,
    ) -> Self {
        Self {
            workspace,
            on_heartbeat,
            interval_s,
            enabled,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.workspace.join("HEARTBEAT.md")
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> Result<()> {
        if !self.enabled {
            info!("Heartbeat disabled");
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let interval = Duration::from_secs(self.interval_s);
        let workspace = self.workspace.clone();
        let on_heartbeat = self.on_heartbeat.clone();

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                tick(&workspace, on_heartbeat.as_ref()).await;
            }
        });
        if let Some(old) = self.task.lock().await.replace(handle) {
            old.abort();
        }

        info!("Heartbeat started (every {}s)", self.interval_s);
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }

    /// Fire a heartbeat immediately, bypassing the timer and the
    /// empty-file check.
    pub async fn trigger_now(&self) -> Result<Option<String>> {
        match &self.on_heartbeat {
            Some(callback) => Ok(Some(callback(HEARTBEAT_PROMPT.to_string()).await?)),
            None => Ok(None),
        }
    }
}

fn read_heartbeat_file(workspace: &Path) -> Option<String> {
    let path = workspace.join("HEARTBEAT.md");
    if path.exists() {
        std::fs::read_to_string(&path).ok()
    } else {
        None
    }
}

async fn tick(workspace: &Path, on_heartbeat: Option<&HeartbeatCallback>) {
    let content = read_heartbeat_file(workspace);
    if is_heartbeat_empty(content.as_deref()) {
        debug!("Heartbeat: no tasks (HEARTBEAT.md empty)");
        return;
    }

    info!("Heartbeat: checking for tasks...");
    let Some(callback) = on_heartbeat else { return };
    match callback(HEARTBEAT_PROMPT.to_string()).await {
        Ok(response) => {
            if response_is_ok(&response) {
                info!("Heartbeat: OK (no action needed)");
            } else {
                info!("Heartbeat: completed task");
            }
        }
        Err(e) => error!("Heartbeat execution failed: {}", e),
    }
}
