//! In-memory background job tracking with polling status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Default)]
struct JobInner {
    status: JobStatus,
    run_id: Option<i64>,
    current_provider: Option<String>,
    current_query: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

/// Shared progress handle for one background run.
///
/// Counters are atomic so worker tasks update them without contending on
/// the status lock.
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    total: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    inner: Mutex<JobInner>,
}

/// Point-in-time view of a job, served to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub run_id: Option<i64>,
    pub status: JobStatus,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub progress_percent: f64,
    pub current_provider: Option<String>,
    pub current_query: Option<String>,
    pub estimated_remaining_seconds: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            total: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            inner: Mutex::new(JobInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// Stamp the run id the first time a task reports one.
    pub fn set_run_id(&self, run_id: i64) {
        let mut inner = self.lock();
        if inner.run_id.is_none() {
            inner.run_id = Some(run_id);
        }
    }

    pub fn record_completed(&self, provider: &str, query: &str) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        inner.current_provider = Some(provider.to_string());
        inner.current_query = Some(query.to_string());
    }

    pub fn record_failed(&self, provider: &str, query: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        inner.current_provider = Some(provider.to_string());
        inner.current_query = Some(query.to_string());
    }

    pub fn status(&self) -> JobStatus {
        self.lock().status
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == JobStatus::Cancelled
    }

    /// Cooperative cancellation: only a running job can be cancelled;
    /// workers notice on their next status check.
    pub fn cancel(&self) -> bool {
        let mut inner = self.lock();
        if inner.status == JobStatus::Running {
            inner.status = JobStatus::Cancelled;
            inner.completed_at = Some(Utc::now());
            true
        } else {
            false
        }
    }

    pub fn mark_running(&self) {
        let mut inner = self.lock();
        if inner.status == JobStatus::Pending {
            inner.status = JobStatus::Running;
            inner.started_at = Some(Utc::now());
        }
    }

    /// Store the result. The status only moves to Completed from Running,
    /// so a cancelled job keeps its terminal state while still exposing
    /// whatever partial result the run produced.
    pub fn complete(&self, result: serde_json::Value) {
        let mut inner = self.lock();
        inner.result = Some(result);
        if inner.status == JobStatus::Running {
            inner.status = JobStatus::Completed;
            inner.completed_at = Some(Utc::now());
        }
    }

    pub fn fail(&self, error: String) {
        let mut inner = self.lock();
        inner.error = Some(error);
        if inner.status == JobStatus::Running {
            inner.status = JobStatus::Failed;
            inner.completed_at = Some(Utc::now());
        }
    }

    pub fn result(&self) -> Option<serde_json::Value> {
        self.lock().result.clone()
    }

    pub fn progress_percent(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let completed = self.completed.load(Ordering::Relaxed);
        (completed as f64 / total as f64 * 10_000.0).round() / 100.0
    }

    pub fn estimated_remaining_seconds(&self) -> Option<u64> {
        let completed = self.completed.load(Ordering::Relaxed);
        if completed == 0 {
            return None;
        }
        let started_at = self.lock().started_at?;
        let elapsed = (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return None;
        }
        let rate = completed as f64 / elapsed;
        let remaining = self.total.load(Ordering::Relaxed).saturating_sub(completed);
        Some((remaining as f64 / rate) as u64)
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let progress_percent = self.progress_percent();
        let estimated_remaining_seconds = self.estimated_remaining_seconds();
        let inner = self.lock();
        JobSnapshot {
            job_id: self.id,
            run_id: inner.run_id,
            status: inner.status,
            total_tasks: self.total.load(Ordering::Relaxed),
            completed_tasks: self.completed.load(Ordering::Relaxed),
            failed_tasks: self.failed.load(Ordering::Relaxed),
            progress_percent,
            current_provider: inner.current_provider.clone(),
            current_query: inner.current_query.clone(),
            estimated_remaining_seconds,
            started_at: inner.started_at,
            completed_at: inner.completed_at,
            error: inner.error.clone(),
        }
    }
}

/// Registry of background jobs, shared by the submitting side and pollers.
#[derive(Default)]
pub struct JobManager {
    jobs: RwLock<HashMap<Uuid, Arc<Job>>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_job(&self) -> Arc<Job> {
        let job = Arc::new(Job::new());
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, job.clone());
        job
    }

    /// Spawn `work` against a fresh job and return it immediately.
    ///
    /// Panics inside the work future are caught and recorded as a failure
    /// so pollers never see a job stuck in Running.
    pub fn submit<F, Fut, E>(&self, work: F) -> Arc<Job>
    where
        F: FnOnce(Arc<Job>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, E>> + Send + 'static,
        E: Display,
    {
        let job = self.create_job();
        let task_job = job.clone();
        tokio::spawn(async move {
            task_job.mark_running();
            let outcome = AssertUnwindSafe(work(task_job.clone())).catch_unwind().await;
            match outcome {
                Ok(Ok(result)) => task_job.complete(result),
                Ok(Err(e)) => task_job.fail(e.to_string()),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "job panicked".to_string());
                    warn!(job_id = %task_job.id, panic = %message, "job panicked");
                    task_job.fail(format!("panic: {message}"));
                }
            }
        });
        job
    }

    pub fn get(&self, job_id: Uuid) -> Option<Arc<Job>> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned()
    }

    pub fn get_status(&self, job_id: Uuid) -> Option<JobSnapshot> {
        self.get(job_id).map(|j| j.snapshot())
    }

    pub fn cancel(&self, job_id: Uuid) -> bool {
        self.get(job_id).map(|j| j.cancel()).unwrap_or(false)
    }

    /// Recent jobs, newest first.
    pub fn list_jobs(&self, limit: usize) -> Vec<JobSnapshot> {
        let mut jobs: Vec<Arc<Job>> = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.into_iter().take(limit).map(|j| j.snapshot()).collect()
    }

    /// Drop jobs whose completion is older than `max_age`. Returns how
    /// many were evicted.
    pub fn cleanup_old_jobs(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, job| {
            job.lock()
                .completed_at
                .map(|done| done >= cutoff)
                .unwrap_or(true)
        });
        before - jobs.len()
    }

    /// Periodic eviction sweep for finished jobs.
    pub fn spawn_eviction(self: &Arc<Self>, every: Duration, max_age: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = manager.cleanup_old_jobs(max_age);
                if evicted > 0 {
                    info!(evicted, "evicted finished jobs");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_is_zero_without_total() {
        let job = Job::new();
        assert_eq!(job.progress_percent(), 0.0);
    }

    #[test]
    fn progress_rounds_to_two_decimals() {
        let job = Job::new();
        job.set_total(3);
        job.record_completed("openai", "q");
        assert_eq!(job.progress_percent(), 33.33);
    }

    #[test]
    fn cancel_only_from_running() {
        let job = Job::new();
        assert!(!job.cancel());
        job.mark_running();
        assert!(job.cancel());
        assert_eq!(job.status(), JobStatus::Cancelled);
        // already terminal
        assert!(!job.cancel());
    }

    #[test]
    fn complete_does_not_overwrite_cancelled() {
        let job = Job::new();
        job.mark_running();
        job.cancel();
        job.complete(json!({"partial": true}));
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert_eq!(job.result(), Some(json!({"partial": true})));
    }

    #[test]
    fn run_id_is_stamped_once() {
        let job = Job::new();
        job.set_run_id(7);
        job.set_run_id(9);
        assert_eq!(job.snapshot().run_id, Some(7));
    }

    #[tokio::test]
    async fn submit_completes_job_with_result() {
        let manager = JobManager::new();
        let job = manager.submit(|_job| async { Ok::<_, String>(json!({"ok": true})) });
        for _ in 0..100 {
            if job.status().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.result(), Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn submit_records_error_on_failure() {
        let manager = JobManager::new();
        let job = manager.submit(|_job| async { Err::<serde_json::Value, _>("boom".to_string()) });
        for _ in 0..100 {
            if job.status().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.snapshot().error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn submit_catches_panics() {
        let manager = JobManager::new();
        let job = manager.submit(|_job| async {
            if true {
                panic!("kaput");
            }
            Ok::<_, String>(json!(null))
        });
        for _ in 0..100 {
            if job.status().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.snapshot().error.unwrap_or_default().contains("kaput"));
    }

    #[tokio::test]
    async fn cleanup_drops_only_old_finished_jobs() {
        let manager = JobManager::new();
        let done = manager.create_job();
        done.mark_running();
        done.complete(json!(null));
        {
            let mut inner = done.lock();
            inner.completed_at = Some(Utc::now() - chrono::Duration::hours(2));
        }
        let pending = manager.create_job();
        let evicted = manager.cleanup_old_jobs(Duration::from_secs(3600));
        assert_eq!(evicted, 1);
        assert!(manager.get(done.id).is_none());
        assert!(manager.get(pending.id).is_some());
    }

    #[tokio::test]
    async fn list_jobs_is_newest_first() {
        let manager = JobManager::new();
        let a = manager.create_job();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let b = manager.create_job();
        let listed = manager.list_jobs(10);
        assert_eq!(listed[0].job_id, b.id);
        assert_eq!(listed[1].job_id, a.id);
    }
}
