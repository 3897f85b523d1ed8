use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct SupervisorState {
    running: AtomicU64,
    /// Canceled when the owner asks every task to stop.
    stop: CancellationToken,
    /// Canceled once the last task is gone.
    stopped: CancellationToken,
}

impl SupervisorState {
    fn release(&self) {
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stopped.cancel();
        }
    }
}

/// Tracks the background tasks of a server or transport so that shutdown
/// can wait for all of them.
///
/// Dropping the supervisor asks its tasks to stop.
///
/// # Examples
///
/// ```rust
/// # use greetrpc::TaskSupervisor;
/// # #[tokio::main]
/// # async fn main() {
/// let supervisor = TaskSupervisor::create();
/// supervisor.spawn("ticker", async {
///     loop {
///         tokio::time::sleep(std::time::Duration::from_millis(10)).await;
///     }
/// });
/// supervisor.stop();
/// supervisor.all_stopped().await;
/// # }
/// ```
#[derive(Debug)]
pub struct TaskSupervisor(Arc<SupervisorState>);

/// Keeps its supervisor from reporting `all_stopped` while alive.
#[derive(Debug)]
pub struct TaskSupervisorGuard(Arc<SupervisorState>);

impl TaskSupervisor {
    /// Creates a supervisor. It holds one task of its own until `stop`, so
    /// `all_stopped` never resolves before `stop` is called.
    #[must_use]
    pub fn create() -> Self {
        let supervisor = Self(Arc::default());
        let guard = supervisor.start_async_task();
        tokio::spawn(async move {
            guard.stopped().await;
        });
        supervisor
    }

    pub fn stop(&self) {
        self.0.stop.cancel();
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    /// A guard that calls `stop` when dropped.
    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.0.stop.clone().drop_guard()
    }

    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    #[must_use]
    pub fn running(&self) -> u64 {
        self.0.running.load(Ordering::Acquire)
    }

    /// Registers a task. The task counts as running until the guard drops.
    #[must_use]
    pub fn start_async_task(&self) -> TaskSupervisorGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskSupervisorGuard(self.0.clone())
    }

    /// Spawns `task`, which is dropped as soon as `stop` is called.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.start_async_task();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.stopped() => tracing::debug!("{name} stopped"),
                () = task => tracing::debug!("{name} finished"),
            }
        });
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskSupervisorGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskSupervisorGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_task_supervisor() {
        let supervisor = TaskSupervisor::create();
        assert_eq!(supervisor.running(), 1);

        supervisor.stop();
        supervisor.stopped().await;
        supervisor.all_stopped().await;
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn test_spawned_task_is_dropped_on_stop() {
        let supervisor = TaskSupervisor::create();
        supervisor.spawn("forever", std::future::pending());
        supervisor.spawn("short", async {});
        assert!(supervisor.running() >= 2);

        let guard = supervisor.drop_guard();
        drop(guard);
        assert!(supervisor.is_stopping());
        tokio::time::timeout(Duration::from_secs(1), supervisor.all_stopped())
            .await
            .unwrap();
    }
}
