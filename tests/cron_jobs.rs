use nanobot::cron::service::CronService;
use nanobot::cron::types::CronSchedule;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn create_test_cron_service() -> (CronService, TempDir) {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let store_path = tmp.path().join("cron_store.json");
    (CronService::new(store_path), tmp)
}

fn every(ms: i64) -> CronSchedule {
    CronSchedule::Every { every_ms: Some(ms) }
}

#[tokio::test]
async fn test_cron_add_and_list() {
    let (svc, _tmp) = create_test_cron_service();

    let job = svc
        .add_job("Test Job 1", every(3_600_000), "ping", false, None, None, false)
        .await
        .unwrap();

    let jobs = svc.list_jobs(false).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, job.id);
    assert_eq!(jobs[0].name, "Test Job 1");
    assert_eq!(jobs[0].id.len(), 8);
}

#[tokio::test]
async fn test_cron_add_multiple_and_list() {
    let (svc, _tmp) = create_test_cron_service();

    for name in ["Job 1", "Job 2", "Job 3"] {
        svc.add_job(name, every(3_600_000), "ping", false, None, None, false)
            .await
            .unwrap();
    }

    let jobs = svc.list_jobs(false).await.unwrap();
    assert_eq!(jobs.len(), 3);
}

#[tokio::test]
async fn test_cron_remove_job() {
    let (svc, _tmp) = create_test_cron_service();

    let job1 = svc
        .add_job("Job 1", every(3_600_000), "ping", false, None, None, false)
        .await
        .unwrap();
    let job2 = svc
        .add_job("Job 2", every(3_600_000), "ping", false, None, None, false)
        .await
        .unwrap();

    assert!(svc.remove_job(&job1.id).await.unwrap());

    let jobs = svc.list_jobs(true).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, job2.id);
}

#[tokio::test]
async fn test_cron_remove_nonexistent() {
    let (svc, _tmp) = create_test_cron_service();
    assert!(!svc.remove_job("nonexistent").await.unwrap());
}

#[tokio::test]
async fn test_cron_persistence_across_instances() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let store_path = tmp.path().join("cron_store.json");

    // Create service, add job, drop service
    let job_id = {
        let svc = CronService::new(store_path.clone());
        svc.add_job(
            "Persistent Job",
            every(3_600_000),
            "hourly",
            true,
            Some("discord".to_string()),
            Some("C1".to_string()),
            false,
        )
        .await
        .unwrap()
        .id
    };

    // New service from the same path sees the same state
    let svc2 = CronService::new(store_path);
    let jobs = svc2.list_jobs(true).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, job_id);
    assert_eq!(jobs[0].name, "Persistent Job");
    assert!(jobs[0].payload.deliver);
    assert_eq!(jobs[0].payload.channel.as_deref(), Some("discord"));
}

#[tokio::test]
async fn test_cron_store_file_format() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let store_path = tmp.path().join("cron_store.json");

    let svc = CronService::new(store_path.clone());
    svc.add_job("Format Check", every(60_000), "ping", false, None, None, false)
        .await
        .unwrap();

    let content = std::fs::read_to_string(&store_path).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(doc["version"], 1);
    assert!(doc["jobs"].as_array().is_some());
    assert!(content.contains("\"everyMs\""));
    assert!(content.contains("\"nextRunAtMs\""));
}

#[tokio::test]
async fn test_cron_enable_disable() {
    let (svc, _tmp) = create_test_cron_service();

    let job = svc
        .add_job("Toggle Job", every(3_600_000), "ping", false, None, None, false)
        .await
        .unwrap();

    let updated = svc.enable_job(&job.id, false).await.unwrap();
    assert!(!updated.unwrap().enabled);

    // list_jobs(false) = enabled only -> should be empty
    assert!(svc.list_jobs(false).await.unwrap().is_empty());
    assert_eq!(svc.list_jobs(true).await.unwrap().len(), 1);

    let updated = svc.enable_job(&job.id, true).await.unwrap();
    assert!(updated.unwrap().enabled);
    assert_eq!(svc.list_jobs(false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cron_manual_trigger() {
    let (svc, _tmp) = create_test_cron_service();

    let job = svc
        .add_job("Trigger Job", every(3_600_000), "ping", false, None, None, false)
        .await
        .unwrap();

    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked_clone = invoked.clone();
    let expected_id = job.id.clone();
    svc.set_on_job(move |job| {
        let invoked = invoked_clone.clone();
        let expected_id = expected_id.clone();
        Box::pin(async move {
            assert_eq!(job.id, expected_id);
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(Some("Job executed".to_string()))
        })
    })
    .await;

    assert!(svc.run_job(&job.id, true).await.unwrap());
    assert_eq!(invoked.load(Ordering::SeqCst), 1);

    let jobs = svc.list_jobs(true).await.unwrap();
    assert_eq!(jobs[0].state.last_status.as_deref(), Some("ok"));
    assert!(jobs[0].state.last_run_at_ms.is_some());
}

#[tokio::test]
async fn test_cron_run_disabled_job_needs_force() {
    let (svc, _tmp) = create_test_cron_service();

    let job = svc
        .add_job("Disabled Job", every(3_600_000), "ping", false, None, None, false)
        .await
        .unwrap();
    svc.enable_job(&job.id, false).await.unwrap();

    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked_clone = invoked.clone();
    svc.set_on_job(move |_job| {
        let invoked = invoked_clone.clone();
        Box::pin(async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
    })
    .await;

    assert!(!svc.run_job(&job.id, false).await.unwrap());
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    assert!(svc.run_job(&job.id, true).await.unwrap());
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cron_one_shot_end_to_end() {
    let (svc, _tmp) = create_test_cron_service();

    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked_clone = invoked.clone();
    svc.set_on_job(move |_job| {
        let invoked = invoked_clone.clone();
        Box::pin(async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(Some("done".to_string()))
        })
    })
    .await;

    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    let job = svc
        .add_job(
            "One Shot",
            CronSchedule::At {
                at_ms: Some(now_ms + 100),
            },
            "ping",
            false,
            None,
            None,
            false,
        )
        .await
        .unwrap();

    svc.start().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    svc.stop().await;

    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    let jobs = svc.list_jobs(true).await.unwrap();
    let fired = jobs.iter().find(|j| j.id == job.id).unwrap();
    assert!(!fired.enabled);
    assert!(fired.state.next_run_at_ms.is_none());
    assert_eq!(fired.state.last_status.as_deref(), Some("ok"));
    let last_run = fired.state.last_run_at_ms.unwrap();
    assert!((last_run - (now_ms + 100)).abs() < 200);
}

#[tokio::test]
async fn test_cron_interval_no_catchup_burst() {
    let (svc, _tmp) = create_test_cron_service();

    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked_clone = invoked.clone();
    svc.set_on_job(move |_job| {
        let invoked = invoked_clone.clone();
        Box::pin(async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
    })
    .await;

    svc.add_job("Tick", every(100), "ping", false, None, None, false)
        .await
        .unwrap();

    // Run, pause longer than several intervals, resume
    svc.start().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    svc.stop().await;
    let after_first_window = invoked.load(Ordering::SeqCst);

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    svc.start().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    svc.stop().await;

    // No backfill of the ticks missed while stopped: at most one extra fire
    // immediately after resume
    let after_resume = invoked.load(Ordering::SeqCst);
    assert!(
        after_resume <= after_first_window + 1,
        "expected no catch-up burst, got {} -> {}",
        after_first_window,
        after_resume
    );
}
