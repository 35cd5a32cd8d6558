//! Run executor: owns the run state machine and the per-run dispatch loops.
//!
//! One loop per running run, jobs strictly sequential within it. The loop
//! paces actions with the template's interval plus bounded random jitter,
//! the primary defense against platform rate limiting. Stop requests are
//! cooperative: the loop re-checks run status before every dequeue and a
//! watch channel interrupts any in-progress pacing wait, but an action
//! already in flight on the device is allowed to finish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::{RwLock, watch};
use uuid::Uuid;

use crate::error::{RunError, RunResult};
use crate::fanout::{EventFanout, RunEvent};
use crate::queue::{JobPriority, JobQueue};
use crate::registry::{DeviceSnapshot, DeviceStatus, FleetRegistry};
use crate::run::state::{RunRecord, RunSnapshot, RunStatus};
use crate::settings::ExecutorSettings;
use crate::template::{Action, Template, map};

/// Failure modes of the on-device automation driver.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// The action failed but the device is fine; the job is retried.
    #[error("action failed: {0}")]
    Failed(String),

    /// The device or its agent is gone; fatal for the whole run.
    #[error("fatal executor error: {0}")]
    Fatal(String),
}

/// External capability that performs one job's UI automation.
///
/// Treated as opaque, possibly slow, possibly failing; the coordinator
/// never looks inside the result value.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        device: &DeviceSnapshot,
        action: &Action,
    ) -> Result<serde_json::Value, ActionError>;
}

/// Control signal observed by a run's dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunControl {
    Run,
    Pause,
    Stop,
}

/// Sequences runs against devices: start/pause/resume/stop plus the
/// dispatch loops themselves.
pub struct RunExecutor {
    runs: RwLock<HashMap<Uuid, RunRecord>>,
    /// Exclusive per-device claim: udid -> owning run. Acquired before a
    /// run goes `running`, released on its terminal transition.
    device_claims: RwLock<HashMap<String, Uuid>>,
    controls: RwLock<HashMap<Uuid, watch::Sender<RunControl>>>,
    registry: Arc<FleetRegistry>,
    queue: Arc<JobQueue>,
    fanout: Arc<EventFanout>,
    driver: Arc<dyn ActionExecutor>,
    settings: ExecutorSettings,
}

impl RunExecutor {
    pub fn new(
        registry: Arc<FleetRegistry>,
        queue: Arc<JobQueue>,
        fanout: Arc<EventFanout>,
        driver: Arc<dyn ActionExecutor>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            device_claims: RwLock::new(HashMap::new()),
            controls: RwLock::new(HashMap::new()),
            registry,
            queue,
            fanout,
            driver,
            settings,
        }
    }

    /// Start a run of `template` against a device.
    ///
    /// Validates the device synchronously (categories 1 and 2 of the error
    /// taxonomy); once this returns a run id, all further trouble is
    /// reported through run status and events only.
    pub async fn start_run(
        self: &Arc<Self>,
        template: Template,
        udid: &str,
        account_id: Option<String>,
    ) -> RunResult<Uuid> {
        let snapshot = self
            .registry
            .get_status(udid)
            .await
            .map_err(|_| RunError::DeviceNotFound {
                udid: udid.to_string(),
            })?;
        if !snapshot.dispatchable() {
            return Err(RunError::DeviceOffline {
                udid: udid.to_string(),
            });
        }

        let actions = map(&template);
        if actions.is_empty() {
            return Err(RunError::TemplateEmpty);
        }

        let mut record = RunRecord::new(template, udid, account_id);
        let run_id = record.run_id;

        {
            let mut claims = self.device_claims.write().await;
            if let Some(&holder) = claims.get(udid) {
                return Err(RunError::DeviceBusy {
                    udid: udid.to_string(),
                    run_id: holder,
                });
            }
            claims.insert(udid.to_string(), run_id);
        }

        let session = match self.registry.open_session(udid).await {
            Ok(session) => session,
            Err(_) => {
                self.device_claims.write().await.remove(udid);
                return Err(RunError::DeviceNotFound {
                    udid: udid.to_string(),
                });
            }
        };
        let _ = self
            .registry
            .set_device_status(udid, DeviceStatus::Busy)
            .await;

        let job_ids = self
            .queue
            .enqueue(run_id, udid, actions, JobPriority::Normal)
            .await;
        record.total_steps = job_ids.len() as u32;
        record.job_ids = job_ids;
        // Queued -> Running is always a legal transition
        let _ = record.transition_to(RunStatus::Running);

        tracing::info!(
            "Run {} started on device {} ({} jobs, session {})",
            run_id,
            udid,
            record.total_steps,
            session.session_id
        );

        let (tx, rx) = watch::channel(RunControl::Run);
        self.controls.write().await.insert(run_id, tx);
        self.runs.write().await.insert(run_id, record);

        let executor = Arc::clone(self);
        let udid = udid.to_string();
        tokio::spawn(async move {
            executor.dispatch_loop(run_id, udid, rx).await;
        });

        Ok(run_id)
    }

    /// Stop a run, cancelling its remaining jobs.
    ///
    /// The status transition and the job cancellation happen before the
    /// stop signal fires, and the dispatch loop re-checks status before
    /// every dequeue, so no job can be dispatched after the run is marked
    /// stopped. Stopping a terminal run returns `NotRunning`.
    pub async fn stop_run(&self, run_id: Uuid) -> RunResult<()> {
        let (udid, tally) = {
            let mut runs = self.runs.write().await;
            let record = runs
                .get_mut(&run_id)
                .ok_or(RunError::RunNotFound { id: run_id })?;
            if !matches!(record.status, RunStatus::Running | RunStatus::Paused) {
                return Err(RunError::NotRunning {
                    id: run_id,
                    status: record.status.to_string(),
                });
            }
            // Transition and cancellation form one atomic step with respect
            // to the dispatch loop.
            let _ = record.transition_to(RunStatus::Stopped);
            let cancelled = self.queue.cancel_for_run(run_id).await;
            tracing::info!("Run {} stopped, {} jobs cancelled", run_id, cancelled);
            (record.udid.clone(), self.queue.tally_for_run(run_id).await)
        };

        self.signal(run_id, RunControl::Stop).await;
        self.release_device(run_id, &udid).await;
        self.publish_terminal(run_id, false, &tally, None).await;
        Ok(())
    }

    /// Pause a running run. The current pacing wait is interrupted; an
    /// action already in flight finishes first.
    pub async fn pause_run(&self, run_id: Uuid) -> RunResult<()> {
        {
            let mut runs = self.runs.write().await;
            let record = runs
                .get_mut(&run_id)
                .ok_or(RunError::RunNotFound { id: run_id })?;
            if record.status != RunStatus::Running {
                return Err(RunError::NotRunning {
                    id: run_id,
                    status: record.status.to_string(),
                });
            }
            let _ = record.transition_to(RunStatus::Paused);
        }
        self.signal(run_id, RunControl::Pause).await;
        tracing::info!("Run {} paused", run_id);
        Ok(())
    }

    /// Resume a paused run.
    pub async fn resume_run(&self, run_id: Uuid) -> RunResult<()> {
        {
            let mut runs = self.runs.write().await;
            let record = runs
                .get_mut(&run_id)
                .ok_or(RunError::RunNotFound { id: run_id })?;
            if record.status != RunStatus::Paused {
                return Err(RunError::NotRunning {
                    id: run_id,
                    status: record.status.to_string(),
                });
            }
            let _ = record.transition_to(RunStatus::Running);
        }
        self.signal(run_id, RunControl::Run).await;
        tracing::info!("Run {} resumed", run_id);
        Ok(())
    }

    /// Point-in-time status for the control surface.
    pub async fn status(&self, run_id: Uuid) -> RunResult<RunSnapshot> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .map(RunRecord::snapshot)
            .ok_or(RunError::RunNotFound { id: run_id })
    }

    /// Snapshots of every known run.
    pub async fn list_runs(&self) -> Vec<RunSnapshot> {
        self.runs
            .read()
            .await
            .values()
            .map(RunRecord::snapshot)
            .collect()
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        run_id: Uuid,
        udid: String,
        mut control: watch::Receiver<RunControl>,
    ) {
        loop {
            // Cooperative cancellation: poll run status before each job.
            let status = match self.status(run_id).await {
                Ok(snapshot) => snapshot.status,
                Err(_) => break,
            };
            match status {
                RunStatus::Running => {}
                RunStatus::Paused => {
                    if wait_for_resume(&mut control).await {
                        continue;
                    }
                    break;
                }
                _ => break,
            }

            let Some(job) = self.queue.dequeue_next(&udid).await else {
                let tally = self.queue.tally_for_run(run_id).await;
                if !tally.has_live_jobs() {
                    self.finish_success(run_id, &udid).await;
                    break;
                }
                // Retrying jobs are waiting out their backoff window.
                let delay = self
                    .queue
                    .next_not_before(&udid)
                    .await
                    .and_then(|at| (at - Utc::now()).to_std().ok())
                    .unwrap_or(Duration::from_secs(1));
                if self.pace(&mut control, delay.max(Duration::from_millis(250))).await {
                    continue;
                }
                break;
            };

            let device = match self.registry.get_status(&udid).await {
                Ok(snapshot) if snapshot.dispatchable() => snapshot,
                _ => {
                    self.fail_run(run_id, &udid, "device disappeared mid-run")
                        .await;
                    break;
                }
            };

            match self.driver.execute(&device, &job.action).await {
                Ok(result) => {
                    if let Err(e) = self.queue.complete(job.id, result).await {
                        tracing::debug!("Job {} finished after cancellation: {}", job.id, e);
                    }
                }
                Err(ActionError::Failed(reason)) => {
                    if let Err(e) = self.queue.fail(job.id, &reason).await {
                        tracing::debug!("Job {} failed after cancellation: {}", job.id, e);
                    }
                }
                Err(ActionError::Fatal(reason)) => {
                    self.fail_run(run_id, &udid, &reason).await;
                    break;
                }
            }

            let tally = self.queue.tally_for_run(run_id).await;
            if !tally.has_live_jobs() {
                self.finish_success(run_id, &udid).await;
                break;
            }

            // Live jobs remain, so the published snapshot stays below 100%.
            self.publish_progress(run_id, job.action.kind()).await;

            if !self.pace(&mut control, self.pacing_delay(run_id).await).await {
                break;
            }
        }

        self.controls.write().await.remove(&run_id);
    }

    /// Inter-job wait: template interval plus bounded random jitter. An
    /// explicit, inspectable delay — the rate-limit defense — not an
    /// incidental one.
    async fn pacing_delay(&self, run_id: Uuid) -> Duration {
        let interval_minutes = self
            .runs
            .read()
            .await
            .get(&run_id)
            .map(|r| r.template.interval_minutes)
            .unwrap_or(0);
        let jitter_max = self.settings.jitter_max_secs;
        let jitter = if jitter_max == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_max)
        };
        Duration::from_secs(interval_minutes * 60 + jitter)
    }

    /// Cancellable wait. Returns false when the loop should exit.
    async fn pace(&self, control: &mut watch::Receiver<RunControl>, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            changed = control.changed() => match changed {
                // Pause is handled at the loop top; only stop ends the loop.
                Ok(()) => *control.borrow() != RunControl::Stop,
                Err(_) => false,
            },
        }
    }

    async fn signal(&self, run_id: Uuid, state: RunControl) {
        if let Some(tx) = self.controls.read().await.get(&run_id) {
            let _ = tx.send(state);
        }
    }

    async fn publish_progress(&self, run_id: Uuid, last_action: &str) {
        let tally = self.queue.tally_for_run(run_id).await;
        let snapshot = {
            let mut runs = self.runs.write().await;
            let Some(record) = runs.get_mut(&run_id) else {
                return;
            };
            if record.status.is_terminal() {
                return;
            }
            let step = (tally.completed + tally.failed + tally.cancelled) as u32;
            record.record_progress(tally.progress_pct(), step, Some(last_action.to_string()));
            record.snapshot()
        };

        let data = serde_json::to_value(&snapshot).unwrap_or_default();
        self.fanout
            .publish(run_id, RunEvent::job_update(run_id, data))
            .await;
    }

    async fn finish_success(&self, run_id: Uuid, udid: &str) {
        let tally = self.queue.tally_for_run(run_id).await;
        {
            let mut runs = self.runs.write().await;
            let Some(record) = runs.get_mut(&run_id) else {
                return;
            };
            // A stop/error that raced the last job wins; nothing to do.
            if record.status != RunStatus::Running {
                return;
            }
            let step = (tally.completed + tally.failed + tally.cancelled) as u32;
            record.record_progress(tally.progress_pct(), step, None);
            if let Err(e) = record.transition_to(RunStatus::Success) {
                tracing::error!("Run {} could not finish: {}", run_id, e);
                return;
            }
        }

        tracing::info!(
            "Run {} finished: {} completed, {} failed",
            run_id,
            tally.completed,
            tally.failed
        );
        self.release_device(run_id, udid).await;
        self.publish_terminal(run_id, true, &tally, None).await;
    }

    async fn fail_run(&self, run_id: Uuid, udid: &str, reason: &str) {
        let tally = {
            let mut runs = self.runs.write().await;
            let Some(record) = runs.get_mut(&run_id) else {
                return;
            };
            if record.status.is_terminal() {
                return;
            }
            record.error_text = Some(reason.to_string());
            let _ = record.transition_to(RunStatus::Error);
            let cancelled = self.queue.cancel_for_run(run_id).await;
            tracing::error!(
                "Run {} failed: {} ({} jobs cancelled)",
                run_id,
                reason,
                cancelled
            );
            self.queue.tally_for_run(run_id).await
        };

        self.release_device(run_id, udid).await;
        self.publish_terminal(run_id, false, &tally, Some(reason)).await;
    }

    async fn publish_terminal(
        &self,
        run_id: Uuid,
        success: bool,
        tally: &crate::queue::RunJobTally,
        error: Option<&str>,
    ) {
        let status = match self.status(run_id).await {
            Ok(snapshot) => snapshot.status.to_string(),
            Err(_) => return,
        };
        self.fanout
            .publish(
                run_id,
                RunEvent::broadcast(
                    run_id,
                    serde_json::json!({
                        "success": success,
                        "status": status,
                        "completed": tally.completed,
                        "failed": tally.failed,
                        "cancelled": tally.cancelled,
                        "error": error,
                    }),
                ),
            )
            .await;
        Arc::clone(&self.fanout).schedule_prune(run_id);
    }

    async fn release_device(&self, run_id: Uuid, udid: &str) {
        {
            let mut claims = self.device_claims.write().await;
            if claims.get(udid) == Some(&run_id) {
                claims.remove(udid);
            }
        }
        self.registry.close_session(udid).await;
        if let Ok(snapshot) = self.registry.get_status(udid).await {
            if snapshot.device.status == DeviceStatus::Busy {
                let _ = self
                    .registry
                    .set_device_status(udid, DeviceStatus::Connected)
                    .await;
            }
        }
    }
}

/// Block until a paused run is resumed. Returns false on stop (or when the
/// control channel is gone).
async fn wait_for_resume(control: &mut watch::Receiver<RunControl>) -> bool {
    loop {
        if control.changed().await.is_err() {
            return false;
        }
        match *control.borrow() {
            RunControl::Run => return true,
            RunControl::Pause => continue,
            RunControl::Stop => return false,
        }
    }
}
