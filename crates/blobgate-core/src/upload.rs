//! Asynchronous upload coordination.
//!
//! The [`UploadCoordinator`] owns the job table and a fixed pool of worker
//! tasks. Synchronous uploads write through the blob store on the request
//! task. Asynchronous uploads are queued on a bounded channel and completed
//! by a worker. Either way, at most one write per key is in flight: a second
//! submission for a key whose job is `Pending` or `InProgress` is rejected
//! with [`GatewayError::Conflict`].
//!
//! Job state transitions performed by workers are compare-and-set on
//! `(key, ticket, expected state)`, so a worker never clobbers a job that was
//! replaced by a newer submission.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blobstore::BlobStore;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};

/// Error message recorded for queued uploads dropped at shutdown.
pub const SHUTDOWN_ERROR: &str = "shutdown";

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle state of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// A write to the blob store is running.
    InProgress,
    /// The write succeeded.
    Completed,
    /// The write failed.
    Failed,
}

impl JobState {
    /// Whether a write for the job may still happen.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// One upload submission.
#[derive(Debug, Clone)]
pub struct UploadJob {
    /// Storage key being written.
    pub key: String,
    /// Identity of this submission.
    pub ticket: Uuid,
    /// Current state.
    pub state: JobState,
    /// Failure message, set when `state` is [`JobState::Failed`].
    pub error: Option<String>,
    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl UploadJob {
    fn new(key: &str, state: JobState) -> Self {
        Self {
            key: key.to_owned(),
            ticket: Uuid::new_v4(),
            state,
            error: None,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// How an accepted upload was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The blob was written before returning (201).
    Created,
    /// The blob will be written in the background (202).
    Accepted,
}

/// What readers of a key should see given its upload job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// No write is pending; consult the blob store.
    Visible,
    /// A write is pending or running; the key must look absent.
    Hidden,
    /// The last async write failed. Reported once, then forgotten.
    Failed(String),
}

/// Sizing of the worker pool and job table.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorOptions {
    /// Number of worker tasks.
    pub workers: usize,
    /// Capacity of the async upload queue.
    pub queue_capacity: usize,
    /// How long finished jobs are kept.
    pub retention: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            retention: Duration::from_secs(600),
        }
    }
}

impl From<&GatewayConfig> for CoordinatorOptions {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            workers: config.upload_workers,
            queue_capacity: config.upload_queue_capacity,
            retention: config.job_retention(),
        }
    }
}

#[derive(Debug)]
struct UploadTask {
    key: String,
    ticket: Uuid,
    content: Bytes,
}

#[derive(Debug)]
struct JobTable {
    jobs: DashMap<String, UploadJob>,
    retention: Duration,
}

impl JobTable {
    /// Insert a fresh job for `key` unless an active one exists.
    fn claim(&self, key: &str, state: JobState) -> GatewayResult<Uuid> {
        let job = UploadJob::new(key, state);
        let ticket = job.ticket;
        match self.jobs.entry(key.to_owned()) {
            Entry::Occupied(mut entry) => {
                if entry.get().state.is_active() {
                    return Err(GatewayError::Conflict(format!(
                        "an upload to {key} is already in progress"
                    )));
                }
                entry.insert(job);
            }
            Entry::Vacant(entry) => {
                entry.insert(job);
            }
        }
        Ok(ticket)
    }

    /// Compare-and-set the state of `key`'s job.
    fn transition(&self, key: &str, ticket: Uuid, from: JobState, to: JobState) -> bool {
        let Some(mut job) = self.jobs.get_mut(key) else {
            return false;
        };
        if job.ticket != ticket || job.state != from {
            return false;
        }
        job.state = to;
        true
    }

    fn finish(&self, key: &str, ticket: Uuid, from: JobState, error: Option<String>) -> bool {
        let Some(mut job) = self.jobs.get_mut(key) else {
            return false;
        };
        if job.ticket != ticket || job.state != from {
            return false;
        }
        job.state = if error.is_some() {
            JobState::Failed
        } else {
            JobState::Completed
        };
        job.error = error;
        job.finished_at = Some(Utc::now());
        true
    }

    fn release(&self, key: &str, ticket: Uuid) {
        self.jobs.remove_if(key, |_, job| job.ticket == ticket);
    }

    fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let before = self.jobs.len();
        self.jobs.retain(|_, job| match job.finished_at {
            Some(finished) => now.signed_duration_since(finished) < retention,
            None => true,
        });
        before.saturating_sub(self.jobs.len())
    }
}

/// An in-flight synchronous write. The claim is released when this drops,
/// including when the request future is cancelled mid-write.
struct SyncClaim<'a> {
    table: &'a JobTable,
    key: &'a str,
    ticket: Uuid,
}

impl Drop for SyncClaim<'_> {
    fn drop(&mut self) {
        self.table.release(self.key, self.ticket);
    }
}

/// Coordinates sync and async uploads over a shared [`BlobStore`].
///
/// Must be created inside a tokio runtime: [`UploadCoordinator::start`]
/// spawns the worker pool and the retention sweeper.
pub struct UploadCoordinator {
    store: Arc<dyn BlobStore>,
    table: Arc<JobTable>,
    queue: mpsc::Sender<UploadTask>,
    receiver: Arc<Mutex<mpsc::Receiver<UploadTask>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for UploadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadCoordinator")
            .field("store", &self.store)
            .field("job_count", &self.table.jobs.len())
            .field("retention", &self.table.retention)
            .finish_non_exhaustive()
    }
}

impl UploadCoordinator {
    /// Spawn the worker pool and sweeper and return the coordinator.
    #[must_use]
    pub fn start(store: Arc<dyn BlobStore>, options: CoordinatorOptions) -> Self {
        let workers = options.workers.max(1);
        let (queue, receiver) = mpsc::channel(options.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let (shutdown_tx, _) = watch::channel(false);
        let table = Arc::new(JobTable {
            jobs: DashMap::new(),
            retention: options.retention,
        });

        let mut tasks = Vec::with_capacity(workers + 1);
        for id in 0..workers {
            tasks.push(tokio::spawn(run_worker(
                id,
                Arc::clone(&store),
                Arc::clone(&table),
                Arc::clone(&receiver),
                shutdown_tx.subscribe(),
            )));
        }
        tasks.push(tokio::spawn(run_sweeper(
            Arc::clone(&table),
            shutdown_tx.subscribe(),
        )));

        info!(
            workers,
            queue_capacity = options.queue_capacity,
            retention_secs = options.retention.as_secs(),
            "upload coordinator started"
        );

        Self {
            store,
            table,
            queue,
            receiver,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }

    /// The blob store uploads are written to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Submit an upload of `content` to `key`.
    ///
    /// With `run_async == false` the write happens before this returns. With
    /// `run_async == true` the job is queued and this returns immediately.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Conflict`] if a write to `key` is still in flight.
    /// - [`GatewayError::Unavailable`] if the async queue is full or closed.
    /// - The mapped blob store error for a failed synchronous write.
    pub async fn submit(
        &self,
        key: &str,
        content: Bytes,
        run_async: bool,
    ) -> GatewayResult<SubmitOutcome> {
        if run_async {
            self.submit_async(key, content)
        } else {
            self.submit_sync(key, content).await
        }
    }

    async fn submit_sync(&self, key: &str, content: Bytes) -> GatewayResult<SubmitOutcome> {
        let claim = SyncClaim {
            table: &self.table,
            key,
            ticket: self.table.claim(key, JobState::InProgress)?,
        };
        let size = content.len();
        let result = self.store.put(key, content).await;
        drop(claim);
        match result {
            Ok(()) => {
                debug!(key, size, "stored upload");
                Ok(SubmitOutcome::Created)
            }
            Err(e) => {
                warn!(key, error = %e, "upload failed");
                Err(e.into())
            }
        }
    }

    fn submit_async(&self, key: &str, content: Bytes) -> GatewayResult<SubmitOutcome> {
        let ticket = self.table.claim(key, JobState::Pending)?;
        let task = UploadTask {
            key: key.to_owned(),
            ticket,
            content,
        };
        match self.queue.try_send(task) {
            Ok(()) => {
                debug!(key, %ticket, "queued async upload");
                Ok(SubmitOutcome::Accepted)
            }
            Err(e) => {
                self.table.release(key, ticket);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "upload queue is full",
                    mpsc::error::TrySendError::Closed(_) => "upload coordinator is shutting down",
                };
                warn!(key, reason, "rejected async upload");
                Err(GatewayError::Unavailable(reason.to_owned()))
            }
        }
    }

    /// How a read or delete of `key` should treat its upload job.
    ///
    /// Completed jobs are evicted here. A failed job is evicted and its error
    /// is returned exactly once.
    pub fn visibility(&self, key: &str) -> Visibility {
        let state = self.table.jobs.get(key).map(|job| job.state);
        match state {
            None => Visibility::Visible,
            Some(JobState::Pending | JobState::InProgress) => Visibility::Hidden,
            Some(JobState::Completed) => {
                self.table
                    .jobs
                    .remove_if(key, |_, job| job.state == JobState::Completed);
                Visibility::Visible
            }
            Some(JobState::Failed) => {
                match self
                    .table
                    .jobs
                    .remove_if(key, |_, job| job.state == JobState::Failed)
                {
                    Some((_, job)) => Visibility::Failed(
                        job.error.unwrap_or_else(|| "upload failed".to_owned()),
                    ),
                    None => Visibility::Visible,
                }
            }
        }
    }

    /// A snapshot of `key`'s job, if any.
    #[must_use]
    pub fn job(&self, key: &str) -> Option<UploadJob> {
        self.table.jobs.get(key).map(|job| job.clone())
    }

    /// Number of tracked jobs.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.table.jobs.len()
    }

    /// Drop finished jobs older than the retention window. Returns how many
    /// were evicted.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        self.table.evict_expired(now)
    }

    /// Stop the workers after their current task and fail queued uploads.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "upload task ended abnormally");
            }
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut dropped = 0_usize;
        while let Ok(task) = receiver.try_recv() {
            if self.table.finish(
                &task.key,
                task.ticket,
                JobState::Pending,
                Some(SHUTDOWN_ERROR.to_owned()),
            ) {
                dropped += 1;
            }
        }
        info!(dropped, "upload coordinator stopped");
    }
}

async fn run_worker(
    id: usize,
    store: Arc<dyn BlobStore>,
    table: Arc<JobTable>,
    receiver: Arc<Mutex<mpsc::Receiver<UploadTask>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker = id, "upload worker started");
    loop {
        let task = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            task = async { receiver.lock().await.recv().await } => task,
        };
        let Some(task) = task else { break };
        process_task(id, store.as_ref(), &table, task).await;
    }
    debug!(worker = id, "upload worker stopped");
}

async fn process_task(id: usize, store: &dyn BlobStore, table: &JobTable, task: UploadTask) {
    let UploadTask {
        key,
        ticket,
        content,
    } = task;
    if !table.transition(&key, ticket, JobState::Pending, JobState::InProgress) {
        debug!(worker = id, key, %ticket, "skipping superseded upload");
        return;
    }

    let size = content.len();
    let error = match store.put(&key, content).await {
        Ok(()) => {
            info!(worker = id, key, size, "async upload completed");
            None
        }
        Err(e) => {
            warn!(worker = id, key, error = %e, "async upload failed");
            Some(e.to_string())
        }
    };
    table.finish(&key, ticket, JobState::InProgress, error);
}

async fn run_sweeper(table: Arc<JobTable>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = (table.retention / 4).max(MIN_SWEEP_INTERVAL);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => {
                let evicted = table.evict_expired(Utc::now());
                if evicted > 0 {
                    debug!(evicted, "evicted finished upload jobs");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::blobstore::{BlobStoreError, InMemoryBlobStore};

    /// Store whose `put` waits until the test opens the gate.
    #[derive(Debug)]
    struct GatedStore {
        inner: InMemoryBlobStore,
        gate: Semaphore,
        fail: bool,
    }

    impl GatedStore {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: InMemoryBlobStore::default(),
                gate: Semaphore::new(0),
                fail,
            })
        }

        fn open(&self) {
            self.gate.add_permits(1_000);
        }
    }

    #[async_trait]
    impl BlobStore for GatedStore {
        async fn get(&self, key: &str) -> Result<Bytes, BlobStoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, content: Bytes) -> Result<(), BlobStoreError> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| BlobStoreError::Backend(e.to_string()))?;
            if self.fail {
                return Err(BlobStoreError::Backend("disk on fire".to_owned()));
            }
            self.inner.put(key, content).await
        }

        async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
            self.inner.exists(key).await
        }

        async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
            self.inner.delete(key).await
        }
    }

    fn options(workers: usize, queue_capacity: usize) -> CoordinatorOptions {
        CoordinatorOptions {
            workers,
            queue_capacity,
            retention: Duration::from_secs(600),
        }
    }

    async fn wait_for_state(coordinator: &UploadCoordinator, key: &str, state: JobState) {
        for _ in 0..500 {
            if coordinator.job(key).map(|job| job.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {key} never reached {state:?}");
    }

    #[tokio::test]
    async fn test_should_store_sync_upload_and_forget_job() {
        let store = Arc::new(InMemoryBlobStore::default());
        let coordinator = UploadCoordinator::start(store.clone(), options(1, 4));

        let outcome = coordinator
            .submit("packages/a", Bytes::from("lalala"), false)
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Created);
        assert_eq!(coordinator.job_count(), 0);
        assert_eq!(coordinator.visibility("packages/a"), Visibility::Visible);
        assert_eq!(store.get("packages/a").await.unwrap().as_ref(), b"lalala");
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_should_release_key_when_sync_upload_is_cancelled() {
        let store = GatedStore::new(false);
        let coordinator = UploadCoordinator::start(store.clone(), options(1, 4));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            coordinator.submit("packages/a", Bytes::from("first"), false),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(coordinator.job("packages/a").is_none());
        assert_eq!(coordinator.visibility("packages/a"), Visibility::Visible);

        store.open();
        let outcome = coordinator
            .submit("packages/a", Bytes::from("second"), false)
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Created);
        assert_eq!(store.get("packages/a").await.unwrap().as_ref(), b"second");
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_should_hide_async_upload_until_completed() {
        let store = GatedStore::new(false);
        let coordinator = UploadCoordinator::start(store.clone(), options(2, 4));

        let outcome = coordinator
            .submit("packages/a", Bytes::from("data"), true)
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Accepted);
        wait_for_state(&coordinator, "packages/a", JobState::InProgress).await;
        assert_eq!(coordinator.visibility("packages/a"), Visibility::Hidden);

        store.open();
        wait_for_state(&coordinator, "packages/a", JobState::Completed).await;
        assert_eq!(coordinator.visibility("packages/a"), Visibility::Visible);
        assert!(coordinator.job("packages/a").is_none());
        assert_eq!(store.get("packages/a").await.unwrap().as_ref(), b"data");
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_should_reject_concurrent_write_to_same_key() {
        let store = GatedStore::new(false);
        let coordinator = UploadCoordinator::start(store.clone(), options(1, 4));

        coordinator
            .submit("droplets/d", Bytes::from("one"), true)
            .await
            .unwrap();
        let err = coordinator
            .submit("droplets/d", Bytes::from("two"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
        let err = coordinator
            .submit("droplets/d", Bytes::from("two"), true)
            .await
            .unwrap_err();
        assert_eq!(err.status_code().as_u16(), 409);

        // Other keys are unaffected.
        store.open();
        coordinator
            .submit("droplets/other", Bytes::from("x"), false)
            .await
            .unwrap();
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_should_surface_async_failure_once() {
        let store = GatedStore::new(true);
        store.open();
        let coordinator = UploadCoordinator::start(store.clone(), options(1, 4));

        coordinator
            .submit("buildpacks/b", Bytes::from("x"), true)
            .await
            .unwrap();
        wait_for_state(&coordinator, "buildpacks/b", JobState::Failed).await;

        match coordinator.visibility("buildpacks/b") {
            Visibility::Failed(message) => assert!(message.contains("disk on fire")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(coordinator.visibility("buildpacks/b"), Visibility::Visible);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_should_reject_when_queue_is_full() {
        let store = GatedStore::new(false);
        let coordinator = UploadCoordinator::start(store.clone(), options(1, 1));

        coordinator
            .submit("packages/a", Bytes::from("a"), true)
            .await
            .unwrap();
        wait_for_state(&coordinator, "packages/a", JobState::InProgress).await;
        coordinator
            .submit("packages/b", Bytes::from("b"), true)
            .await
            .unwrap();

        let err = coordinator
            .submit("packages/c", Bytes::from("c"), true)
            .await
            .unwrap_err();
        assert_eq!(err.status_code().as_u16(), 503);
        assert!(coordinator.job("packages/c").is_none());

        store.open();
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_should_fail_queued_uploads_on_shutdown() {
        let store = GatedStore::new(false);
        let coordinator = UploadCoordinator::start(store.clone(), options(1, 4));

        coordinator
            .submit("packages/a", Bytes::from("a"), true)
            .await
            .unwrap();
        wait_for_state(&coordinator, "packages/a", JobState::InProgress).await;
        coordinator
            .submit("packages/b", Bytes::from("b"), true)
            .await
            .unwrap();

        tokio::join!(coordinator.shutdown(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store.open();
        });

        assert_eq!(
            coordinator.job("packages/a").map(|job| job.state),
            Some(JobState::Completed)
        );
        let queued = coordinator.job("packages/b").unwrap();
        assert_eq!(queued.state, JobState::Failed);
        assert_eq!(queued.error.as_deref(), Some(SHUTDOWN_ERROR));

        let err = coordinator
            .submit("packages/c", Bytes::from("c"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_should_evict_jobs_past_retention() {
        let store = GatedStore::new(false);
        store.open();
        let coordinator = UploadCoordinator::start(store.clone(), options(1, 4));

        coordinator
            .submit("packages/a", Bytes::from("a"), true)
            .await
            .unwrap();
        wait_for_state(&coordinator, "packages/a", JobState::Completed).await;

        assert_eq!(coordinator.evict_expired(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::seconds(601);
        assert_eq!(coordinator.evict_expired(later), 1);
        assert!(coordinator.job("packages/a").is_none());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_should_sweep_finished_jobs_in_background() {
        let store = GatedStore::new(false);
        store.open();
        let coordinator = UploadCoordinator::start(
            store.clone(),
            CoordinatorOptions {
                workers: 1,
                queue_capacity: 4,
                retention: Duration::from_millis(40),
            },
        );

        coordinator
            .submit("packages/a", Bytes::from("a"), true)
            .await
            .unwrap();
        for _ in 0..200 {
            if coordinator.job_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(coordinator.job_count(), 0);
        assert_eq!(store.get("packages/a").await.unwrap().as_ref(), b"a");
        coordinator.shutdown().await;
    }
}
