// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Thread-pool capability
//
// An `ExecutorHandle` is a bounded task pool on the tokio runtime: at most
// `max_pool_size` tasks run at once, at most `max_queue_size` wait for a slot,
// and further submissions are rejected. Pools are either borrowed from the
// manager by name or created fresh and owned by the unit that created them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::errors::ProcessingError;

/// What a unit does when its pool refuses a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectedPolicy {
    /// Fail the exchange with `RejectedExecution`.
    Abort,
    /// Run the task on the submitting task instead.
    #[default]
    CallerRuns,
    /// Drop the task; the exchange stops routing.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadPoolProfile {
    pub id: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,

    /// `None` means unbounded.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: Option<usize>,

    #[serde(default)]
    pub rejected_policy: RejectedPolicy,
}

fn default_pool_size() -> usize {
    10
}

fn default_max_pool_size() -> usize {
    20
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_max_queue_size() -> Option<usize> {
    Some(1000)
}

impl ThreadPoolProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn single_thread(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pool_size: 1,
            max_pool_size: 1,
            max_queue_size: None,
            ..Self::default()
        }
    }

    /// Number of tasks allowed to run at once.
    pub fn concurrency(&self) -> usize {
        self.max_pool_size.max(self.pool_size).max(1)
    }
}

impl Default for ThreadPoolProfile {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            pool_size: default_pool_size(),
            max_pool_size: default_max_pool_size(),
            keep_alive: default_keep_alive(),
            max_queue_size: default_max_queue_size(),
            rejected_policy: RejectedPolicy::default(),
        }
    }
}

struct ExecutorInner {
    name: String,
    profile: ThreadPoolProfile,
    permits: Arc<Semaphore>,
    pending: AtomicUsize,
    active: AtomicUsize,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ExecutorHandle {
    inner: Arc<ExecutorInner>,
}

impl ExecutorHandle {
    pub fn new(name: impl Into<String>, profile: ThreadPoolProfile) -> Self {
        let permits = Arc::new(Semaphore::new(profile.concurrency()));
        Self {
            inner: Arc::new(ExecutorInner {
                name: name.into(),
                profile,
                permits,
                pending: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn profile(&self) -> &ThreadPoolProfile {
        &self.inner.profile
    }

    pub fn rejected_policy(&self) -> RejectedPolicy {
        self.inner.profile.rejected_policy
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn ptr_eq(&self, other: &ExecutorHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Submit a task. Rejected when the pool is shut down or its queue is
    /// full.
    pub fn spawn<F>(&self, task: F) -> Result<JoinHandle<F::Output>, ProcessingError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.try_spawn(task).map_err(|(error, _)| error)
    }

    /// Like `spawn`, but hands a rejected task back to the caller so a
    /// caller-runs policy can still execute it.
    pub fn try_spawn<F>(&self, task: F) -> Result<JoinHandle<F::Output>, (ProcessingError, F)>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_shutdown() {
            return Err((ProcessingError::RejectedExecution(self.inner.name.clone()), task));
        }
        if let Some(max_queue) = self.inner.profile.max_queue_size {
            if self.inner.permits.available_permits() == 0 && self.pending_count() >= max_queue {
                return Err((ProcessingError::RejectedExecution(self.inner.name.clone()), task));
            }
        }

        let inner = self.inner.clone();
        Ok(self.inner.tracker.spawn(async move {
            let waiting = CountGuard::enter(&inner.pending);
            let permit = inner.permits.clone().acquire_owned().await.ok();
            drop(waiting);
            let _running = CountGuard::enter(&inner.active);
            let _permit = permit;
            task.await
        }))
    }

    /// Refuse new tasks; tasks already accepted run to completion.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::debug!(pool = %self.inner.name, "Shutting down executor");
            self.inner.shutdown.cancel();
            self.inner.tracker.close();
        }
    }

    /// Wait until every accepted task finished. Returns `false` on timeout.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_ok()
    }
}

impl fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("name", &self.inner.name)
            .field("profile", &self.inner.profile.id)
            .field("active", &self.active_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Thread-pool capability consumed by the reifiers.
pub trait ExecutorServiceManager: Send + Sync {
    fn new_pool(&self, name: &str, profile: &ThreadPoolProfile) -> ExecutorHandle;

    fn new_default_pool(&self, name: &str) -> ExecutorHandle {
        self.new_pool(name, &self.default_profile())
    }

    fn new_single_thread_pool(&self, name: &str) -> ExecutorHandle {
        self.new_pool(name, &ThreadPoolProfile::single_thread(name))
    }

    /// Shared pool registered under `name`.
    fn lookup_pool(&self, name: &str) -> Option<ExecutorHandle>;

    fn register_pool(&self, name: &str, pool: ExecutorHandle);

    fn profile(&self, name: &str) -> Option<ThreadPoolProfile>;

    fn default_profile(&self) -> ThreadPoolProfile;

    fn shutdown(&self, pool: &ExecutorHandle) {
        pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_runs_task() {
        let pool = ExecutorHandle::new("test", ThreadPoolProfile::new("test"));
        let handle = pool.spawn(async { 21 * 2 }).unwrap();
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let pool = ExecutorHandle::new("closing", ThreadPoolProfile::new("closing"));
        pool.shutdown();
        let result = pool.spawn(async {});
        assert!(matches!(result, Err(ProcessingError::RejectedExecution(name)) if name == "closing"));
        assert!(pool.await_termination(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_rejects_when_queue_full() {
        let profile = ThreadPoolProfile {
            pool_size: 1,
            max_pool_size: 1,
            max_queue_size: Some(1),
            ..ThreadPoolProfile::new("tiny")
        };
        let pool = ExecutorHandle::new("tiny", profile);
        let gate = Arc::new(tokio::sync::Notify::new());

        let g1 = gate.clone();
        let first = pool.spawn(async move { g1.notified().await }).unwrap();
        // let the first task take the only slot
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = pool.spawn(async {}).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(pool.spawn(async {}).is_err());

        gate.notify_one();
        first.await.unwrap();
        second.await.unwrap();
    }
}
