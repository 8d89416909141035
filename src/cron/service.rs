use crate::cron::types::{CronJob, CronJobState, CronPayload, CronSchedule, CronStore};
use crate::utils::atomic_write;
use anyhow::Result;
use chrono::DateTime;
use chrono_tz::Tz;
use cron::Schedule;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Normalize a cron expression to 6+ fields (prepend "0 " for seconds if
/// 5-field), then validate it parses.
pub fn validate_cron_expr(expr: &str) -> Result<String> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    normalized
        .parse::<Schedule>()
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expr, e))?;
    Ok(normalized)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn compute_next_run(schedule: &CronSchedule, now_ms: i64) -> Option<i64> {
    match schedule {
        CronSchedule::At { at_ms } => {
            at_ms.and_then(|at| if at > now_ms { Some(at) } else { None })
        }
        CronSchedule::Every { every_ms } => every_ms.and_then(|every| {
            if every > 0 {
                Some(now_ms + every)
            } else {
                None
            }
        }),
        CronSchedule::Cron { expr, tz } => {
            let expr_str = expr.as_ref()?;
            let normalized = validate_cron_expr(expr_str).ok()?;
            let sched = normalized.parse::<Schedule>().ok()?;
            let now_sec = now_ms / 1000;
            let tz_val = match tz {
                Some(tz_str) => tz_str.parse::<Tz>().unwrap_or_else(|_| {
                    warn!("Invalid timezone '{}', falling back to UTC", tz_str);
                    Tz::UTC
                }),
                None => Tz::UTC,
            };
            let now_dt: DateTime<Tz> =
                DateTime::from_timestamp(now_sec, 0)?.with_timezone(&tz_val);
            sched.after(&now_dt).next().map(|next| next.timestamp_millis())
        }
    }
}

/// Async callback that executes a [`CronJob`] and returns an optional
/// response string.
pub type CronJobCallback = Arc<
    dyn Fn(
            CronJob,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<String>>> + Send>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Serialize)]
pub struct CronStatus {
    pub running: bool,
    pub jobs: usize,
    #[serde(rename = "nextWakeAtMs")]
    pub next_wake_at_ms: Option<i64>,
}

/// Persistent job store plus a single armed one-shot timer.
///
/// The store file is loaded once on `start()` and rewritten atomically after
/// any structural change; in-memory state is authoritative if a write fails.
#[derive(Clone)]
pub struct CronService {
    store_path: PathBuf,
    store: Arc<Mutex<Option<CronStore>>>,
    on_job: Arc<Mutex<Option<CronJobCallback>>>,
    running: Arc<AtomicBool>,
    rearm: Arc<Notify>,
    timer_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CronService {
    pub fn new(store_path: PathBuf) -> Self {
        Self {
            store_path,
            store: Arc::new(Mutex::new(None)),
            on_job: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            rearm: Arc::new(Notify::new()),
            timer_task: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn set_on_job<F>(&self, callback: F)
    where
        F: Fn(
                CronJob,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = Result<Option<String>>> + Send>,
            > + Send
            + Sync
            + 'static,
    {
        *self.on_job.lock().await = Some(Arc::new(callback));
    }

    /// Load the store from disk into memory if not already loaded.
    /// Load failures degrade to an empty store.
    async fn ensure_loaded(&self) {
        let mut guard = self.store.lock().await;
        if guard.is_some() {
            return;
        }
        let store = if self.store_path.exists() {
            match std::fs::read_to_string(&self.store_path) {
                Ok(content) => match serde_json::from_str::<CronStore>(&content) {
                    Ok(store) => store,
                    Err(e) => {
                        warn!("Failed to parse cron store, starting empty: {}", e);
                        CronStore::default()
                    }
                },
                Err(e) => {
                    warn!("Failed to read cron store, starting empty: {}", e);
                    CronStore::default()
                }
            }
        } else {
            CronStore::default()
        };
        *guard = Some(store);
    }

    /// Persist the in-memory store. Failures are logged; memory stays
    /// authoritative for the rest of the process lifetime.
    async fn save_store(&self) {
        let guard = self.store.lock().await;
        if let Some(store) = guard.as_ref() {
            match serde_json::to_string_pretty(store) {
                Ok(content) => {
                    if let Err(e) = atomic_write(&self.store_path, &content) {
                        warn!("Failed to persist cron store: {}", e);
                    }
                }
                Err(e) => warn!("Failed to serialize cron store: {}", e),
            }
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.ensure_loaded().await;
        self.recompute_next_runs().await;
        self.save_store().await;

        let service = self.clone();
        let handle = tokio::spawn(async move { service.scheduler_loop().await });
        if let Some(old) = self.timer_task.lock().await.replace(handle) {
            old.abort();
        }

        let jobs = self.store.lock().await.as_ref().map_or(0, |s| s.jobs.len());
        info!("Cron service started with {} jobs", jobs);
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.rearm.notify_one();
        if let Some(task) = self.timer_task.lock().await.take() {
            task.abort();
        }
    }

    /// Reseed `next_run_at_ms` for every enabled job from the current
    /// instant. A one-shot whose time already passed is terminalized, marked
    /// "skipped" if it never ran.
    async fn recompute_next_runs(&self) {
        let now = now_ms();
        let mut guard = self.store.lock().await;
        let Some(store) = guard.as_mut() else { return };
        for job in &mut store.jobs {
            if !job.enabled {
                continue;
            }
            let next = compute_next_run(&job.schedule, now);
            if next.is_none() && matches!(job.schedule, CronSchedule::At { .. }) {
                info!("Cron: one-shot '{}' ({}) missed its instant", job.name, job.id);
                job.enabled = false;
                if job.state.last_run_at_ms.is_none() {
                    job.state.last_status = Some("skipped".to_string());
                }
                job.updated_at_ms = now;
            }
            job.state.next_run_at_ms = next;
        }
    }

    async fn next_wake_ms(&self) -> Option<i64> {
        let guard = self.store.lock().await;
        guard.as_ref().and_then(|store| {
            store
                .jobs
                .iter()
                .filter(|j| j.enabled)
                .filter_map(|j| j.state.next_run_at_ms)
                .min()
        })
    }

    /// Single armed one-shot timer: sleep until the earliest next fire (or
    /// until a mutation re-arms), then run everything due.
    async fn scheduler_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            match self.next_wake_ms().await {
                None => {
                    // Nothing scheduled: idle until a mutation re-arms
                    self.rearm.notified().await;
                }
                Some(wake_at) => {
                    let now = now_ms();
                    if wake_at > now {
                        let delay = Duration::from_millis((wake_at - now) as u64);
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = self.rearm.notified() => continue,
                        }
                    }
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    self.run_due_jobs().await;
                    self.save_store().await;
                }
            }
        }
    }

    /// Execute every enabled job whose fire instant has passed, in
    /// submission order.
    async fn run_due_jobs(&self) {
        let now = now_ms();
        let due: Vec<CronJob> = {
            let guard = self.store.lock().await;
            guard.as_ref().map_or_else(Vec::new, |store| {
                store
                    .jobs
                    .iter()
                    .filter(|j| {
                        j.enabled && j.state.next_run_at_ms.is_some_and(|next| next <= now)
                    })
                    .cloned()
                    .collect()
            })
        };
        for job in due {
            self.execute_job(job).await;
        }
    }

    /// Run one job through the installed callback and apply its post-fire
    /// fate. The store lock is not held across the callback await.
    async fn execute_job(&self, job: CronJob) {
        let start = now_ms();
        info!("Cron: executing job '{}' ({})", job.name, job.id);

        let callback = self.on_job.lock().await.clone();
        let (status, error) = match callback {
            Some(cb) => match cb(job.clone()).await {
                Ok(_) => {
                    info!("Cron: job '{}' completed", job.name);
                    ("ok", None)
                }
                Err(e) => {
                    error!("Cron: job '{}' failed: {}", job.name, e);
                    ("error", Some(e.to_string()))
                }
            },
            None => {
                warn!("Cron: no job callback installed, marking '{}' ok", job.name);
                ("ok", None)
            }
        };
        let end = now_ms();

        let mut remove_job = false;
        let mut guard = self.store.lock().await;
        if let Some(store) = guard.as_mut() {
            if let Some(j) = store.jobs.iter_mut().find(|j| j.id == job.id) {
                j.state.last_run_at_ms = Some(start);
                j.state.last_status = Some(status.to_string());
                j.state.last_error = error;
                j.updated_at_ms = end;

                if matches!(j.schedule, CronSchedule::At { .. }) {
                    if j.delete_after_run {
                        remove_job = true;
                    } else {
                        j.enabled = false;
                        j.state.next_run_at_ms = None;
                    }
                } else {
                    // Intervals restart from fire end; missed ticks are never backfilled
                    j.state.next_run_at_ms = compute_next_run(&j.schedule, end);
                }
            }
            if remove_job {
                store.jobs.retain(|j| j.id != job.id);
            }
        }
    }

    // ---- Public API ----

    /// Jobs sorted by next fire time, nulls last.
    pub async fn list_jobs(&self, include_disabled: bool) -> Result<Vec<CronJob>> {
        self.ensure_loaded().await;
        let guard = self.store.lock().await;
        let store = guard.as_ref().expect("store loaded");
        let mut jobs: Vec<CronJob> = store
            .jobs
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.state.next_run_at_ms.unwrap_or(i64::MAX));
        Ok(jobs)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_job(
        &self,
        name: &str,
        schedule: CronSchedule,
        message: &str,
        deliver: bool,
        channel: Option<String>,
        to: Option<String>,
        delete_after_run: bool,
    ) -> Result<CronJob> {
        if let CronSchedule::Cron { expr: Some(expr), .. } = &schedule {
            validate_cron_expr(expr)?;
        }

        self.ensure_loaded().await;
        let now = now_ms();
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let job = CronJob {
            id,
            name: name.to_string(),
            enabled: true,
            state: CronJobState {
                next_run_at_ms: compute_next_run(&schedule, now),
                ..Default::default()
            },
            schedule,
            payload: CronPayload {
                kind: "agent_turn".to_string(),
                message: message.to_string(),
                deliver,
                channel,
                to,
            },
            created_at_ms: now,
            updated_at_ms: now,
            delete_after_run,
        };

        {
            let mut guard = self.store.lock().await;
            guard.as_mut().expect("store loaded").jobs.push(job.clone());
        }
        self.save_store().await;
        self.rearm.notify_one();
        info!("Cron: added job '{}' ({})", job.name, job.id);
        Ok(job)
    }

    pub async fn remove_job(&self, job_id: &str) -> Result<bool> {
        self.ensure_loaded().await;
        let removed = {
            let mut guard = self.store.lock().await;
            let store = guard.as_mut().expect("store loaded");
            let before = store.jobs.len();
            store.jobs.retain(|j| j.id != job_id);
            store.jobs.len() < before
        };
        if removed {
            self.save_store().await;
            self.rearm.notify_one();
            info!("Cron: removed job {}", job_id);
        }
        Ok(removed)
    }

    /// Enable or disable a job, reseeding or nulling its next fire time.
    pub async fn enable_job(&self, job_id: &str, enabled: bool) -> Result<Option<CronJob>> {
        self.ensure_loaded().await;
        let updated = {
            let mut guard = self.store.lock().await;
            let store = guard.as_mut().expect("store loaded");
            store.jobs.iter_mut().find(|j| j.id == job_id).map(|job| {
                let now = now_ms();
                job.enabled = enabled;
                job.updated_at_ms = now;
                job.state.next_run_at_ms = if enabled {
                    compute_next_run(&job.schedule, now)
                } else {
                    None
                };
                job.clone()
            })
        };
        if updated.is_some() {
            self.save_store().await;
            self.rearm.notify_one();
        }
        Ok(updated)
    }

    /// Manually run a job. `force` runs disabled jobs too. Returns whether
    /// the job was executed.
    pub async fn run_job(&self, job_id: &str, force: bool) -> Result<bool> {
        self.ensure_loaded().await;
        let job = {
            let guard = self.store.lock().await;
            guard
                .as_ref()
                .expect("store loaded")
                .jobs
                .iter()
                .find(|j| j.id == job_id)
                .cloned()
        };
        let Some(job) = job else { return Ok(false) };
        if !force && !job.enabled {
            return Ok(false);
        }

        self.execute_job(job).await;
        self.save_store().await;
        self.rearm.notify_one();
        Ok(true)
    }

    pub async fn status(&self) -> CronStatus {
        self.ensure_loaded().await;
        let jobs = self.store.lock().await.as_ref().map_or(0, |s| s.jobs.len());
        CronStatus {
            running: self.running.load(Ordering::SeqCst),
            jobs,
            next_wake_at_ms: self.next_wake_ms().await,
        }
    }
}
