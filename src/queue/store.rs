//! Job queue with priority, timing-window, and retry scheduling.
//!
//! Shared by all dispatch loops; every operation is a single critical
//! section over the job map, so per-job updates are atomic and the
//! run-stop/job-cancel pairing can't leave an orphaned schedulable job.

use std::collections::HashMap;

use chrono::{TimeDelta, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::queue::job::{Job, JobPriority, JobStatus, retry_delay};
use crate::settings::QueueSettings;
use crate::template::Action;

/// Terminal-status tallies for one run's jobs, used to derive progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunJobTally {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RunJobTally {
    /// Terminal jobs as a share of the run's snapshot total, in percent.
    pub fn progress_pct(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let terminal = self.completed + self.failed + self.cancelled;
        ((terminal * 100) / self.total) as u8
    }

    /// Whether any job can still be dispatched or is in flight.
    pub fn has_live_jobs(&self) -> bool {
        self.completed + self.failed + self.cancelled < self.total
    }
}

/// Pending-action store for all runs.
pub struct JobQueue {
    jobs: RwLock<HashMap<Uuid, Job>>,
    settings: QueueSettings,
}

impl JobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Create one pending job per action for a run. Returns the job ids in
    /// action order — the run's job snapshot.
    pub async fn enqueue(
        &self,
        run_id: Uuid,
        udid: &str,
        actions: Vec<Action>,
        priority: JobPriority,
    ) -> Vec<Uuid> {
        let mut jobs = self.jobs.write().await;
        let mut ids = Vec::with_capacity(actions.len());
        for action in actions {
            let job = Job::new(run_id, udid, action, priority, self.settings.max_attempts);
            ids.push(job.id);
            jobs.insert(job.id, job);
        }
        ids
    }

    /// Pull the next dispatchable job for a device and flip it to
    /// `running`.
    ///
    /// Selection: highest priority first, then earliest `not_before`, among
    /// `pending`/`retrying` jobs whose window has opened. Jobs whose
    /// deadline has already passed are marked `failed` during the scan —
    /// never silently dropped — and skipped.
    pub async fn dequeue_next(&self, udid: &str) -> Option<Job> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;

        for job in jobs.values_mut() {
            if job.udid == udid
                && job.status.is_schedulable()
                && job.deadline.is_some_and(|d| d < now)
            {
                job.status = JobStatus::Failed;
                job.error_text = Some("deadline exceeded".to_string());
                tracing::warn!("Job {} missed its deadline, marking failed", job.id);
            }
        }

        let best_id = jobs
            .values()
            .filter(|j| j.udid == udid && j.status.is_schedulable() && j.not_before <= now)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.not_before.cmp(&b.not_before))
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|j| j.id)?;

        let job = jobs.get_mut(&best_id)?;
        job.status = JobStatus::Running;
        job.attempts += 1;
        Some(job.clone())
    }

    /// Mark a running job completed.
    pub async fn complete(&self, job_id: Uuid, result: serde_json::Value) -> QueueResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound { id: job_id })?;
        if job.status != JobStatus::Running {
            return Err(QueueError::JobNotRunning {
                id: job_id,
                status: job.status.to_string(),
            });
        }
        job.status = JobStatus::Completed;
        job.result = Some(result);
        Ok(())
    }

    /// Mark a running job failed, re-scheduling it with exponential backoff
    /// while attempts remain. Returns the resulting status.
    pub async fn fail(&self, job_id: Uuid, error: &str) -> QueueResult<JobStatus> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound { id: job_id })?;
        if job.status != JobStatus::Running {
            return Err(QueueError::JobNotRunning {
                id: job_id,
                status: job.status.to_string(),
            });
        }

        job.error_text = Some(error.to_string());
        if job.attempts < job.max_attempts {
            let delay = retry_delay(
                job.attempts,
                std::time::Duration::from_secs(self.settings.retry_base_secs),
                std::time::Duration::from_secs(self.settings.retry_cap_secs),
            );
            job.status = JobStatus::Retrying;
            job.not_before = Utc::now() + TimeDelta::seconds(delay.as_secs() as i64);
            tracing::info!(
                "Job {} attempt {}/{} failed, retrying in {}s: {}",
                job.id,
                job.attempts,
                job.max_attempts,
                delay.as_secs(),
                error
            );
        } else {
            job.status = JobStatus::Failed;
            tracing::warn!(
                "Job {} failed permanently after {} attempts: {}",
                job.id,
                job.attempts,
                error
            );
        }
        Ok(job.status)
    }

    /// Cancel every non-terminal job of a run in one critical section.
    /// Returns the number cancelled.
    pub async fn cancel_for_run(&self, run_id: Uuid) -> usize {
        let mut jobs = self.jobs.write().await;
        let mut cancelled = 0;
        for job in jobs.values_mut() {
            if job.run_id == run_id && !job.status.is_terminal() {
                job.status = JobStatus::Cancelled;
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Look up a job by id.
    pub async fn job(&self, job_id: Uuid) -> QueueResult<Job> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(QueueError::JobNotFound { id: job_id })
    }

    /// Snapshot of a run's jobs.
    pub async fn jobs_for_run(&self, run_id: Uuid) -> Vec<Job> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| j.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Earliest `not_before` among a device's schedulable jobs. The
    /// dispatch loop uses this to sleep through a retry backoff window
    /// instead of polling.
    pub async fn next_not_before(&self, udid: &str) -> Option<chrono::DateTime<Utc>> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| j.udid == udid && j.status.is_schedulable())
            .map(|j| j.not_before)
            .min()
    }

    /// Terminal-status tallies for a run.
    pub async fn tally_for_run(&self, run_id: Uuid) -> RunJobTally {
        let jobs = self.jobs.read().await;
        let mut tally = RunJobTally::default();
        for job in jobs.values().filter(|j| j.run_id == run_id) {
            tally.total += 1;
            match job.status {
                JobStatus::Completed => tally.completed += 1,
                JobStatus::Failed => tally.failed += 1,
                JobStatus::Cancelled => tally.cancelled += 1,
                _ => {}
            }
        }
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Action;

    fn queue() -> JobQueue {
        JobQueue::new(QueueSettings::default())
    }

    fn like() -> Action {
        Action::Like { target_list: None }
    }

    fn scroll() -> Action {
        Action::Scroll { seconds: 30 }
    }

    #[tokio::test]
    async fn test_enqueue_creates_pending_jobs() {
        let queue = queue();
        let run_id = Uuid::new_v4();
        let ids = queue
            .enqueue(run_id, "udid-1", vec![like(), scroll()], JobPriority::Normal)
            .await;

        assert_eq!(ids.len(), 2);
        let job = queue.job(ids[0]).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.run_id, run_id);
    }

    #[tokio::test]
    async fn test_dequeue_respects_priority() {
        let queue = queue();
        let run_id = Uuid::new_v4();
        queue
            .enqueue(run_id, "udid-1", vec![like()], JobPriority::Normal)
            .await;
        let urgent = queue
            .enqueue(run_id, "udid-1", vec![scroll()], JobPriority::Urgent)
            .await;

        let job = queue.dequeue_next("udid-1").await.unwrap();
        assert_eq!(job.id, urgent[0]);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_dequeue_skips_future_not_before() {
        let queue = queue();
        let run_id = Uuid::new_v4();
        let ids = queue
            .enqueue(run_id, "udid-1", vec![like()], JobPriority::Normal)
            .await;
        queue
            .jobs
            .write()
            .await
            .get_mut(&ids[0])
            .unwrap()
            .not_before = Utc::now() + TimeDelta::seconds(3600);

        assert!(queue.dequeue_next("udid-1").await.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_only_matches_device() {
        let queue = queue();
        let run_id = Uuid::new_v4();
        queue
            .enqueue(run_id, "udid-1", vec![like()], JobPriority::Normal)
            .await;

        assert!(queue.dequeue_next("udid-2").await.is_none());
        assert!(queue.dequeue_next("udid-1").await.is_some());
    }

    #[tokio::test]
    async fn test_expired_deadline_marks_failed() {
        let queue = queue();
        let run_id = Uuid::new_v4();
        let ids = queue
            .enqueue(run_id, "udid-1", vec![like()], JobPriority::Normal)
            .await;
        queue.jobs.write().await.get_mut(&ids[0]).unwrap().deadline =
            Some(Utc::now() - TimeDelta::seconds(1));

        assert!(queue.dequeue_next("udid-1").await.is_none());
        let job = queue.job(ids[0]).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_text.as_deref(), Some("deadline exceeded"));
    }

    #[tokio::test]
    async fn test_complete_requires_running() {
        let queue = queue();
        let run_id = Uuid::new_v4();
        let ids = queue
            .enqueue(run_id, "udid-1", vec![like()], JobPriority::Normal)
            .await;

        let err = queue.complete(ids[0], serde_json::json!({})).await;
        assert!(matches!(err, Err(QueueError::JobNotRunning { .. })));

        queue.dequeue_next("udid-1").await.unwrap();
        queue
            .complete(ids[0], serde_json::json!({"ok": true}))
            .await
            .unwrap();
        let job = queue.job(ids[0]).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_fail_retries_with_backoff_then_permanent() {
        let queue = queue();
        let run_id = Uuid::new_v4();
        let ids = queue
            .enqueue(run_id, "udid-1", vec![like()], JobPriority::Normal)
            .await;
        let job_id = ids[0];

        // First two failures re-schedule with growing delay
        for attempt in 1..=2u32 {
            queue
                .jobs
                .write()
                .await
                .get_mut(&job_id)
                .unwrap()
                .not_before = Utc::now();
            let job = queue.dequeue_next("udid-1").await.unwrap();
            assert_eq!(job.attempts, attempt);
            let status = queue.fail(job_id, "driver timeout").await.unwrap();
            assert_eq!(status, JobStatus::Retrying);

            let stored = queue.job(job_id).await.unwrap();
            assert!(stored.not_before > Utc::now());
        }

        // Third failure exhausts the attempt budget
        queue
            .jobs
            .write()
            .await
            .get_mut(&job_id)
            .unwrap()
            .not_before = Utc::now();
        queue.dequeue_next("udid-1").await.unwrap();
        let status = queue.fail(job_id, "driver timeout").await.unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert!(queue.dequeue_next("udid-1").await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_for_run_spares_terminal_jobs() {
        let queue = queue();
        let run_id = Uuid::new_v4();
        let ids = queue
            .enqueue(
                run_id,
                "udid-1",
                vec![like(), like(), like()],
                JobPriority::Normal,
            )
            .await;

        queue.dequeue_next("udid-1").await.unwrap();
        queue
            .complete(ids[0], serde_json::json!({}))
            .await
            .unwrap();
        queue.dequeue_next("udid-1").await.unwrap();

        let cancelled = queue.cancel_for_run(run_id).await;
        assert_eq!(cancelled, 2);

        let tally = queue.tally_for_run(run_id).await;
        assert_eq!(tally.completed, 1);
        assert_eq!(tally.cancelled, 2);
        assert!(!tally.has_live_jobs());
    }

    #[tokio::test]
    async fn test_tally_progress_pct() {
        let queue = queue();
        let run_id = Uuid::new_v4();
        let ids = queue
            .enqueue(
                run_id,
                "udid-1",
                vec![like(), like(), like(), like()],
                JobPriority::Normal,
            )
            .await;

        queue.dequeue_next("udid-1").await.unwrap();
        queue
            .complete(ids[0], serde_json::json!({}))
            .await
            .unwrap();

        let tally = queue.tally_for_run(run_id).await;
        assert_eq!(tally.progress_pct(), 25);
        assert!(tally.has_live_jobs());
    }
}
