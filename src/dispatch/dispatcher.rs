//! Dispatcher — enforces the concurrency ceiling and supervises workers.
//!
//! Admission: a job either takes a free slot, joins the bounded FIFO queue,
//! or is rejected with backpressure. One supervisor task per active worker
//! drives launch, readiness, cancellation, and deadline enforcement, then
//! records the outcome through the job manager. Slots are released only after
//! the worker's resources are reclaimed, so the ceiling counts real workers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::Bridge;
use crate::config::OrchestratorConfig;
use crate::dispatch::runtime::{
    ContainerRuntime, ExitStatus, SignalKind, WorkerHandle, WorkerSpec,
};
use crate::error::{DispatchError, JobError, RuntimeError};
use crate::job::manager::{JobManager, READY_PHASE};
use crate::job::model::{FailureKind, JobFailure, JobOrigin, JobStatus, ScanJob};

/// How a supervised worker ended.
#[derive(Debug)]
enum WorkerOutcome {
    /// Job was already terminal; nothing left to record.
    AlreadySettled,
    /// Worker exited zero. The job is only genuinely done if the agent
    /// recorded a terminal state first.
    Succeeded,
    /// Worker exited non-zero (or could not be waited on).
    Crashed { code: i64 },
    /// Never reported ready within the startup window.
    StartupTimedOut,
    /// Ran past the job's maximum duration.
    DeadlineExceeded,
    /// Stopped on a cancel request; the worker is confirmed down.
    Cancelled,
    /// Worker could never be started.
    LaunchFailed { reason: String },
}

struct ActiveWorker {
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct DispatchState {
    active: HashMap<Uuid, ActiveWorker>,
    queue: VecDeque<Uuid>,
}

/// Worker admission and supervision.
pub struct Dispatcher {
    config: OrchestratorConfig,
    manager: JobManager,
    runtime: Arc<dyn ContainerRuntime>,
    bridge: Option<Arc<Bridge>>,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(
        config: OrchestratorConfig,
        manager: JobManager,
        runtime: Arc<dyn ContainerRuntime>,
        bridge: Option<Arc<Bridge>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            manager,
            runtime,
            bridge,
            state: Mutex::new(DispatchState::default()),
        })
    }

    /// Admit a job: start a worker if a slot is free, queue it if the queue
    /// has room, otherwise reject with backpressure. The caller decides what
    /// rejection means for the job record.
    pub async fn launch(self: &Arc<Self>, job_id: Uuid) -> Result<(), DispatchError> {
        let mut state = self.state.lock().await;

        if state.active.contains_key(&job_id) || state.queue.contains(&job_id) {
            return Err(DispatchError::AlreadyDispatched { id: job_id });
        }

        if state.active.len() < self.config.max_concurrent {
            self.start_supervised(&mut state, job_id);
            Ok(())
        } else if state.queue.len() < self.config.queue_capacity() {
            state.queue.push_back(job_id);
            debug!(job_id = %job_id, depth = state.queue.len(), "Job queued for a worker slot");
            Ok(())
        } else {
            Err(DispatchError::Backpressure {
                id: job_id,
                active: state.active.len(),
                queued: state.queue.len(),
                max: self.config.max_concurrent,
            })
        }
    }

    /// Relay a cancel request: nudge the job's supervisor if it has a worker,
    /// or retire it straight from the queue if it never started one.
    pub async fn notify_cancel(&self, job_id: Uuid) {
        let was_queued = {
            let mut state = self.state.lock().await;
            if let Some(worker) = state.active.get(&job_id) {
                let _ = worker.stop_tx.try_send(());
                false
            } else if let Some(pos) = state.queue.iter().position(|id| *id == job_id) {
                state.queue.remove(pos);
                true
            } else {
                false
            }
        };

        if was_queued {
            // No worker ever existed, so the job can be cancelled on the spot.
            match self.manager.mark_cancelled(job_id).await {
                Ok(()) | Err(JobError::InvalidTransition { .. }) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "Could not cancel queued job"),
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn queued_count(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Stop every worker and drain the queue. Queued jobs are left Pending
    /// for a later restart to pick up.
    pub async fn shutdown(&self) {
        let workers: Vec<(Uuid, mpsc::Sender<()>, JoinHandle<()>)> = {
            let mut state = self.state.lock().await;
            state.queue.clear();
            state
                .active
                .drain()
                .map(|(id, w)| (id, w.stop_tx, w.task))
                .collect()
        };

        if workers.is_empty() {
            return;
        }
        info!(count = workers.len(), "Stopping active workers");

        for (job_id, stop_tx, _) in &workers {
            debug!(job_id = %job_id, "Signalling worker stop");
            let _ = stop_tx.try_send(());
        }
        for (job_id, _, task) in workers {
            if let Err(e) = task.await {
                warn!(job_id = %job_id, error = %e, "Supervisor task did not finish cleanly");
            }
        }
    }

    /// Insert the job into the active set and spawn its supervisor. Must be
    /// called with the state lock held so the entry exists before the task
    /// can observe its own slot.
    fn start_supervised(self: &Arc<Self>, state: &mut DispatchState, job_id: Uuid) {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            this.supervise(job_id, stop_rx).await;
        });
        state.active.insert(job_id, ActiveWorker { stop_tx, task });
    }

    async fn supervise(self: Arc<Self>, job_id: Uuid, mut stop_rx: mpsc::Receiver<()>) {
        let outcome = self.run_worker(job_id, &mut stop_rx).await;
        debug!(job_id = %job_id, ?outcome, "Worker finished");
        self.settle(job_id, outcome).await;
        self.sync_external(job_id).await;
        self.release_slot(job_id).await;
    }

    /// Launch and watch one worker. Always reclaims the container before
    /// returning, whatever the outcome.
    async fn run_worker(&self, job_id: Uuid, stop_rx: &mut mpsc::Receiver<()>) -> WorkerOutcome {
        let job = match self.manager.get(job_id).await {
            Ok(job) => job,
            Err(e) => {
                return WorkerOutcome::LaunchFailed {
                    reason: e.to_string(),
                };
            }
        };
        if job.status.is_terminal() {
            return WorkerOutcome::AlreadySettled;
        }
        if job.cancel_requested {
            return WorkerOutcome::Cancelled;
        }

        if let Err(e) = self.manager.transition_to_launching(job_id).await {
            return WorkerOutcome::LaunchFailed {
                reason: e.to_string(),
            };
        }

        let spec = self.worker_spec(&job);
        let handle = match self.runtime.launch(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                return WorkerOutcome::LaunchFailed {
                    reason: e.to_string(),
                };
            }
        };
        info!(job_id = %job_id, container = %handle.id, "Worker launched");

        if let Err(e) = self.manager.record_worker_ref(job_id, &handle.id).await {
            warn!(job_id = %job_id, error = %e, "Could not record worker ref");
        }

        let outcome = self.watch_worker(&job, &handle, stop_rx).await;

        if let Err(e) = self.runtime.remove(&handle).await {
            warn!(job_id = %job_id, container = %handle.id, error = %e, "Worker cleanup failed");
        }
        outcome
    }

    /// Supervision proper: wait for readiness within the startup window, then
    /// watch the worker until exit, cancel, or the job deadline.
    async fn watch_worker(
        &self,
        job: &ScanJob,
        handle: &WorkerHandle,
        stop_rx: &mut mpsc::Receiver<()>,
    ) -> WorkerOutcome {
        let wait_fut = self.runtime.wait(handle);
        tokio::pin!(wait_fut);

        let startup_deadline = tokio::time::Instant::now() + self.config.startup_window;
        loop {
            tokio::select! {
                exit = &mut wait_fut => return exit_outcome(exit),
                _ = stop_rx.recv() => {
                    self.stop_worker(handle).await;
                    return WorkerOutcome::Cancelled;
                }
                _ = tokio::time::sleep(self.config.ready_poll_interval) => {}
            }

            match self.manager.get(job.id).await {
                Ok(current) => {
                    if current.status.is_terminal() {
                        self.stop_worker(handle).await;
                        return WorkerOutcome::AlreadySettled;
                    }
                    if current.cancel_requested {
                        self.stop_worker(handle).await;
                        return WorkerOutcome::Cancelled;
                    }
                    if current.status == JobStatus::Running {
                        break;
                    }
                    if current.progress.phase == READY_PHASE {
                        match self.manager.transition_to_running(job.id).await {
                            Ok(_) => {
                                info!(job_id = %job.id, "Worker ready, scan running");
                                break;
                            }
                            Err(e) => {
                                warn!(job_id = %job.id, error = %e, "Could not move job to running")
                            }
                        }
                    }
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "Readiness poll failed"),
            }

            if tokio::time::Instant::now() >= startup_deadline {
                warn!(job_id = %job.id, window = ?self.config.startup_window, "Worker missed startup window");
                self.stop_worker(handle).await;
                return WorkerOutcome::StartupTimedOut;
            }
        }

        let max_duration = if job.config.max_duration_secs > 0 {
            Duration::from_secs(job.config.max_duration_secs)
        } else {
            self.config.default_max_duration
        };
        let deadline = tokio::time::Instant::now() + max_duration;

        loop {
            tokio::select! {
                exit = &mut wait_fut => return exit_outcome(exit),
                _ = stop_rx.recv() => {
                    self.stop_worker(handle).await;
                    return WorkerOutcome::Cancelled;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(job_id = %job.id, ?max_duration, "Scan exceeded its deadline");
                    self.stop_worker(handle).await;
                    return WorkerOutcome::DeadlineExceeded;
                }
                _ = tokio::time::sleep(self.config.supervise_poll_interval) => {}
            }

            // The cancel flag can be set by a control plane we never hear
            // from directly, so poll the record as well.
            match self.manager.get(job.id).await {
                Ok(current) if current.cancel_requested && current.status.is_active() => {
                    self.stop_worker(handle).await;
                    return WorkerOutcome::Cancelled;
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "Supervision poll failed"),
            }
        }
    }

    /// Graceful stop, escalating to a kill if the worker outlives the grace
    /// period.
    async fn stop_worker(&self, handle: &WorkerHandle) {
        if let Err(e) = self.runtime.signal(handle, SignalKind::Graceful).await {
            warn!(container = %handle.id, error = %e, "Graceful stop failed");
        }
        let stopped = tokio::time::timeout(self.config.grace_period, self.runtime.wait(handle));
        if stopped.await.is_err() {
            if let Err(e) = self.runtime.signal(handle, SignalKind::Force).await {
                warn!(container = %handle.id, error = %e, "Force kill failed");
            }
            let _ =
                tokio::time::timeout(self.config.grace_period, self.runtime.wait(handle)).await;
        }
    }

    /// Translate the outcome into the job's terminal record. A race with a
    /// natural terminal write is resolved in the record's favour.
    async fn settle(&self, job_id: Uuid, outcome: WorkerOutcome) {
        let result = match outcome {
            WorkerOutcome::AlreadySettled => Ok(()),
            WorkerOutcome::Succeeded => self.confirm_completed(job_id).await,
            WorkerOutcome::Crashed { code } => {
                self.fail_if_active(
                    job_id,
                    FailureKind::WorkerCrashed,
                    format!("Worker exited with code {code}"),
                )
                .await
            }
            WorkerOutcome::StartupTimedOut => {
                self.fail_if_active(
                    job_id,
                    FailureKind::StartupTimeout,
                    format!(
                        "Worker not ready within {}s",
                        self.config.startup_window.as_secs()
                    ),
                )
                .await
            }
            WorkerOutcome::DeadlineExceeded => {
                self.fail_if_active(
                    job_id,
                    FailureKind::ScanTimeout,
                    "Scan exceeded its maximum duration".to_string(),
                )
                .await
            }
            WorkerOutcome::Cancelled => match self.manager.mark_cancelled(job_id).await {
                Ok(()) => Ok(()),
                // Natural completion or failure won the race.
                Err(JobError::InvalidTransition { .. }) => Ok(()),
                Err(e) => Err(e),
            },
            WorkerOutcome::LaunchFailed { reason } => {
                self.fail_if_active(job_id, FailureKind::DispatchFailed, reason)
                    .await
            }
        };

        if let Err(e) = result {
            error!(job_id = %job_id, error = %e, "Could not settle job");
        }
    }

    /// A zero exit only counts if the agent recorded a terminal state. A
    /// worker that saw the cancel flag in the store stops without one; that
    /// is obedience, not a protocol violation.
    async fn confirm_completed(&self, job_id: Uuid) -> Result<(), JobError> {
        let job = self.manager.get(job_id).await?;
        if job.status.is_terminal() {
            return Ok(());
        }
        if job.cancel_requested {
            return match self.manager.mark_cancelled(job_id).await {
                Ok(()) => Ok(()),
                Err(JobError::InvalidTransition { .. }) => Ok(()),
                Err(e) => Err(e),
            };
        }
        self.fail_if_active(
            job_id,
            FailureKind::ProtocolViolation,
            "Worker exited cleanly without recording an outcome".to_string(),
        )
        .await
    }

    async fn fail_if_active(
        &self,
        job_id: Uuid,
        kind: FailureKind,
        message: String,
    ) -> Result<(), JobError> {
        match self.manager.fail(job_id, JobFailure::new(kind, message)).await {
            Ok(()) => Ok(()),
            // First terminal write wins; a late failure report is dropped.
            Err(JobError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Mirror terminal external-platform jobs through the bridge. Sync
    /// failures are logged, never reflected back into the job record.
    async fn sync_external(&self, job_id: Uuid) {
        let Some(bridge) = &self.bridge else { return };

        match self.manager.get(job_id).await {
            Ok(job) if job.origin == JobOrigin::ExternalPlatform && job.status.is_terminal() => {
                if let Err(e) = bridge.sync(&job).await {
                    error!(job_id = %job_id, error = %e, "External platform sync failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "Could not load job for sync"),
        }
    }

    /// Free the slot and promote the next queued job, FIFO.
    async fn release_slot(self: &Arc<Self>, job_id: Uuid) {
        let mut state = self.state.lock().await;
        state.active.remove(&job_id);
        if let Some(next) = state.queue.pop_front() {
            debug!(job_id = %next, "Promoting queued job to a worker slot");
            self.start_supervised(&mut state, next);
        }
    }

    fn worker_spec(&self, job: &ScanJob) -> WorkerSpec {
        let mut spec = WorkerSpec::new(job.id, &self.config.worker_image)
            .with_env("SCANFORGE_JOB_ID", job.id.to_string())
            .with_env("SCANFORGE_TARGET_URL", &job.config.target)
            .with_env("SCANFORGE_SCAN_LEVEL", job.config.level.as_str())
            .with_env("SCANFORGE_DB_PATH", &self.config.db_path);
        if let Some(scope) = &job.config.scope {
            spec = spec.with_env("SCANFORGE_SCAN_SCOPE", scope);
        }
        spec
    }
}

fn exit_outcome(exit: Result<ExitStatus, RuntimeError>) -> WorkerOutcome {
    match exit {
        Ok(status) if status.success() => WorkerOutcome::Succeeded,
        Ok(status) => WorkerOutcome::Crashed { code: status.code },
        Err(e) => {
            warn!(error = %e, "Wait on worker failed");
            WorkerOutcome::Crashed { code: -1 }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::bridge::{ExternalScanRecord, SyncTarget};
    use crate::error::BridgeError;
    use crate::job::model::{ScanConfig, ScanLevel, ScanResult, ScanSummary};
    use crate::store::MemoryJobStore;

    /// In-memory runtime: `wait` blocks until a test sets the exit code.
    #[derive(Default)]
    struct FakeRuntime {
        fail_launch: AtomicBool,
        launched: StdMutex<Vec<Uuid>>,
        signals: StdMutex<Vec<(String, SignalKind)>>,
        exits: StdMutex<HashMap<String, i64>>,
        removed: StdMutex<Vec<String>>,
    }

    impl FakeRuntime {
        fn container_for(job_id: Uuid) -> String {
            format!("c-{job_id}")
        }

        fn set_exit(&self, job_id: Uuid, code: i64) {
            self.exits
                .lock()
                .unwrap()
                .insert(Self::container_for(job_id), code);
        }

        fn launched_count(&self) -> usize {
            self.launched.lock().unwrap().len()
        }

        fn signals_for(&self, job_id: Uuid) -> Vec<SignalKind> {
            let container = Self::container_for(job_id);
            self.signals
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| *id == container)
                .map(|(_, kind)| *kind)
                .collect()
        }

        fn was_removed(&self, job_id: Uuid) -> bool {
            self.removed
                .lock()
                .unwrap()
                .contains(&Self::container_for(job_id))
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerHandle, RuntimeError> {
            if self.fail_launch.load(Ordering::SeqCst) {
                return Err(RuntimeError::Launch("docker unavailable".into()));
            }
            self.launched.lock().unwrap().push(spec.job_id);
            Ok(WorkerHandle {
                id: Self::container_for(spec.job_id),
                name: spec.name.clone(),
            })
        }

        async fn signal(&self, handle: &WorkerHandle, kind: SignalKind) -> Result<(), RuntimeError> {
            self.signals.lock().unwrap().push((handle.id.clone(), kind));
            Ok(())
        }

        async fn wait(&self, handle: &WorkerHandle) -> Result<ExitStatus, RuntimeError> {
            loop {
                if let Some(code) = self.exits.lock().unwrap().get(&handle.id).copied() {
                    return Ok(ExitStatus { code });
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn remove(&self, handle: &WorkerHandle) -> Result<(), RuntimeError> {
            self.removed.lock().unwrap().push(handle.id.clone());
            Ok(())
        }
    }

    struct CountingTarget(Arc<AtomicUsize>);

    #[async_trait]
    impl SyncTarget for CountingTarget {
        async fn upsert(&self, _record: &ExternalScanRecord) -> Result<(), BridgeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        manager: JobManager,
        runtime: Arc<FakeRuntime>,
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent: 3,
            queue_factor: 2,
            startup_window: Duration::from_secs(5),
            ready_poll_interval: Duration::from_millis(10),
            supervise_poll_interval: Duration::from_millis(10),
            grace_period: Duration::from_millis(50),
            default_max_duration: Duration::from_secs(5),
            ..OrchestratorConfig::default()
        }
    }

    fn harness_with(config: OrchestratorConfig, bridge: Option<Arc<Bridge>>) -> Harness {
        let manager = JobManager::new(Arc::new(MemoryJobStore::new()));
        let runtime = Arc::new(FakeRuntime::default());
        let dispatcher = Dispatcher::new(
            config,
            manager.clone(),
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            bridge,
        );
        Harness {
            dispatcher,
            manager,
            runtime,
        }
    }

    fn harness(config: OrchestratorConfig) -> Harness {
        harness_with(config, None)
    }

    async fn new_job(h: &Harness, origin: JobOrigin) -> Uuid {
        h.manager
            .create(
                ScanConfig::new("https://example.com", ScanLevel::Light),
                "tenant-1",
                origin,
            )
            .await
            .unwrap()
            .id
    }

    async fn wait_for_status(h: &Harness, id: Uuid, status: JobStatus) -> ScanJob {
        for _ in 0..1000 {
            let job = h.manager.get(id).await.unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never reached {status}");
    }

    /// Play the agent's side of the launch handshake.
    async fn bring_to_running(h: &Harness, id: Uuid) {
        wait_for_status(h, id, JobStatus::Launching).await;
        for _ in 0..100 {
            if h.manager.signal_ready(id).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        wait_for_status(h, id, JobStatus::Running).await;
    }

    fn sample_result() -> ScanResult {
        ScanResult {
            summary: ScanSummary {
                high: 0,
                medium: 0,
                low: 1,
                informational: 2,
                score: 97,
            },
            alerts: vec![],
            report_ref: None,
        }
    }

    #[tokio::test]
    async fn admission_splits_into_active_queued_and_rejected() {
        let h = harness(test_config());

        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(new_job(&h, JobOrigin::Native).await);
        }

        let mut rejected = 0;
        for id in &ids {
            match h.dispatcher.launch(*id).await {
                Ok(()) => {}
                Err(DispatchError::Backpressure {
                    active, queued, max, ..
                }) => {
                    assert_eq!(active, 3);
                    assert_eq!(queued, 6);
                    assert_eq!(max, 3);
                    rejected += 1;
                }
                Err(e) => panic!("unexpected admission error: {e}"),
            }
        }

        assert_eq!(rejected, 1);
        assert_eq!(h.dispatcher.active_count().await, 3);
        assert_eq!(h.dispatcher.queued_count().await, 6);

        // Only the active set gets a container.
        for _ in 0..100 {
            if h.runtime.launched_count() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.runtime.launched_count(), 3);
    }

    #[tokio::test]
    async fn double_launch_is_rejected() {
        let h = harness(test_config());
        let id = new_job(&h, JobOrigin::Native).await;

        h.dispatcher.launch(id).await.unwrap();
        assert!(matches!(
            h.dispatcher.launch(id).await,
            Err(DispatchError::AlreadyDispatched { .. })
        ));
    }

    #[tokio::test]
    async fn successful_worker_completes_and_frees_the_slot() {
        let h = harness(test_config());
        let id = new_job(&h, JobOrigin::Native).await;
        h.dispatcher.launch(id).await.unwrap();

        bring_to_running(&h, id).await;
        h.manager.complete(id, sample_result()).await.unwrap();
        h.runtime.set_exit(id, 0);

        let job = wait_for_status(&h, id, JobStatus::Completed).await;
        assert!(job.result.is_some());

        for _ in 0..100 {
            if h.dispatcher.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.dispatcher.active_count().await, 0);
        assert!(h.runtime.was_removed(id));
    }

    #[tokio::test]
    async fn slot_release_promotes_queued_job_fifo() {
        let mut config = test_config();
        config.max_concurrent = 1;
        let h = harness(config);

        let first = new_job(&h, JobOrigin::Native).await;
        let second = new_job(&h, JobOrigin::Native).await;
        h.dispatcher.launch(first).await.unwrap();
        h.dispatcher.launch(second).await.unwrap();
        assert_eq!(h.dispatcher.queued_count().await, 1);

        bring_to_running(&h, first).await;
        h.manager.complete(first, sample_result()).await.unwrap();
        h.runtime.set_exit(first, 0);

        // The queued job inherits the freed slot.
        wait_for_status(&h, second, JobStatus::Launching).await;
        assert_eq!(h.dispatcher.queued_count().await, 0);
        assert_eq!(h.dispatcher.active_count().await, 1);
    }

    #[tokio::test]
    async fn clean_exit_without_outcome_is_protocol_violation() {
        let h = harness(test_config());
        let id = new_job(&h, JobOrigin::Native).await;
        h.dispatcher.launch(id).await.unwrap();

        bring_to_running(&h, id).await;
        h.runtime.set_exit(id, 0);

        let job = wait_for_status(&h, id, JobStatus::Failed).await;
        assert_eq!(job.error.unwrap().kind, FailureKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn nonzero_exit_is_worker_crashed() {
        let h = harness(test_config());
        let id = new_job(&h, JobOrigin::Native).await;
        h.dispatcher.launch(id).await.unwrap();

        bring_to_running(&h, id).await;
        h.runtime.set_exit(id, 137);

        let job = wait_for_status(&h, id, JobStatus::Failed).await;
        let error = job.error.unwrap();
        assert_eq!(error.kind, FailureKind::WorkerCrashed);
        assert!(error.message.contains("137"));
        assert!(h.runtime.was_removed(id));
    }

    #[tokio::test]
    async fn missed_startup_window_fails_with_startup_timeout() {
        let mut config = test_config();
        config.startup_window = Duration::from_millis(50);
        let h = harness(config);

        let id = new_job(&h, JobOrigin::Native).await;
        h.dispatcher.launch(id).await.unwrap();
        // Agent never signals ready.

        let job = wait_for_status(&h, id, JobStatus::Failed).await;
        assert_eq!(job.error.unwrap().kind, FailureKind::StartupTimeout);
        assert!(h.runtime.signals_for(id).contains(&SignalKind::Graceful));
        assert!(h.runtime.was_removed(id));
    }

    #[tokio::test]
    async fn deadline_exceeded_fails_with_scan_timeout() {
        let mut config = test_config();
        config.default_max_duration = Duration::from_millis(100);
        let h = harness(config);

        let id = new_job(&h, JobOrigin::Native).await;
        h.dispatcher.launch(id).await.unwrap();
        bring_to_running(&h, id).await;
        // Worker never exits on its own.

        let job = wait_for_status(&h, id, JobStatus::Failed).await;
        assert_eq!(job.error.unwrap().kind, FailureKind::ScanTimeout);
        assert!(h.runtime.signals_for(id).contains(&SignalKind::Force));
    }

    #[tokio::test]
    async fn cancel_stops_running_worker() {
        let h = harness(test_config());
        let id = new_job(&h, JobOrigin::Native).await;
        h.dispatcher.launch(id).await.unwrap();
        bring_to_running(&h, id).await;

        h.manager.request_cancel(id).await.unwrap();
        h.dispatcher.notify_cancel(id).await;

        let job = wait_for_status(&h, id, JobStatus::Cancelled).await;
        assert!(job.result.is_none());
        assert!(job.error.is_none());
        assert!(h.runtime.signals_for(id).contains(&SignalKind::Graceful));
        assert!(h.runtime.was_removed(id));
    }

    #[tokio::test]
    async fn store_only_cancel_with_clean_exit_reaches_cancelled() {
        let h = harness(test_config());
        let id = new_job(&h, JobOrigin::Native).await;
        h.dispatcher.launch(id).await.unwrap();
        bring_to_running(&h, id).await;

        // The flag lands in the store with no nudge to the dispatcher; the
        // worker sees it on its own poll and exits clean without a terminal
        // write, before the supervisor's next cancel check.
        h.manager.request_cancel(id).await.unwrap();
        h.runtime.set_exit(id, 0);

        let job = wait_for_status(&h, id, JobStatus::Cancelled).await;
        assert!(job.result.is_none());
        assert!(job.error.is_none());
        assert!(h.runtime.was_removed(id));
    }

    #[tokio::test]
    async fn cancel_retires_queued_job_without_a_worker() {
        let mut config = test_config();
        config.max_concurrent = 1;
        let h = harness(config);

        let first = new_job(&h, JobOrigin::Native).await;
        let second = new_job(&h, JobOrigin::Native).await;
        h.dispatcher.launch(first).await.unwrap();
        h.dispatcher.launch(second).await.unwrap();

        h.manager.request_cancel(second).await.unwrap();
        h.dispatcher.notify_cancel(second).await;

        let job = wait_for_status(&h, second, JobStatus::Cancelled).await;
        assert!(job.worker_ref.is_none());
        assert_eq!(h.dispatcher.queued_count().await, 0);
    }

    #[tokio::test]
    async fn cancel_requested_before_dispatch_skips_the_worker() {
        let h = harness(test_config());
        let id = new_job(&h, JobOrigin::Native).await;
        h.manager.request_cancel(id).await.unwrap();

        h.dispatcher.launch(id).await.unwrap();

        wait_for_status(&h, id, JobStatus::Cancelled).await;
        assert_eq!(h.runtime.launched_count(), 0);
    }

    #[tokio::test]
    async fn launch_failure_fails_the_job() {
        let h = harness(test_config());
        h.runtime.fail_launch.store(true, Ordering::SeqCst);

        let id = new_job(&h, JobOrigin::Native).await;
        h.dispatcher.launch(id).await.unwrap();

        let job = wait_for_status(&h, id, JobStatus::Failed).await;
        assert_eq!(job.error.unwrap().kind, FailureKind::DispatchFailed);
    }

    #[tokio::test]
    async fn terminal_external_job_is_synced_through_bridge() {
        let synced = Arc::new(AtomicUsize::new(0));
        let bridge = Arc::new(Bridge::new(
            Box::new(CountingTarget(Arc::clone(&synced))),
            3,
            Duration::from_millis(1),
        ));
        let h = harness_with(test_config(), Some(bridge));

        let id = new_job(&h, JobOrigin::ExternalPlatform).await;
        h.dispatcher.launch(id).await.unwrap();
        bring_to_running(&h, id).await;
        h.manager.complete(id, sample_result()).await.unwrap();
        h.runtime.set_exit(id, 0);

        wait_for_status(&h, id, JobStatus::Completed).await;
        for _ in 0..100 {
            if synced.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(synced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn native_terminal_job_is_not_synced() {
        let synced = Arc::new(AtomicUsize::new(0));
        let bridge = Arc::new(Bridge::new(
            Box::new(CountingTarget(Arc::clone(&synced))),
            3,
            Duration::from_millis(1),
        ));
        let h = harness_with(test_config(), Some(bridge));

        let id = new_job(&h, JobOrigin::Native).await;
        h.dispatcher.launch(id).await.unwrap();
        bring_to_running(&h, id).await;
        h.manager.complete(id, sample_result()).await.unwrap();
        h.runtime.set_exit(id, 0);

        wait_for_status(&h, id, JobStatus::Completed).await;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(synced.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_workers_and_drains_queue() {
        let mut config = test_config();
        config.max_concurrent = 1;
        let h = harness(config);

        let first = new_job(&h, JobOrigin::Native).await;
        let second = new_job(&h, JobOrigin::Native).await;
        h.dispatcher.launch(first).await.unwrap();
        h.dispatcher.launch(second).await.unwrap();
        bring_to_running(&h, first).await;

        h.dispatcher.shutdown().await;

        assert_eq!(h.dispatcher.active_count().await, 0);
        assert_eq!(h.dispatcher.queued_count().await, 0);
        // The active worker was cancelled; the queued one stays Pending.
        assert_eq!(
            h.manager.get(first).await.unwrap().status,
            JobStatus::Cancelled
        );
        assert_eq!(
            h.manager.get(second).await.unwrap().status,
            JobStatus::Pending
        );
    }
}
