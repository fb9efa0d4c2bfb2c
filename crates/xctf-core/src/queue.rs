//! Task queue abstraction (§5 external interfaces: "named async tasks,
//! at-least-once delivery"). Backed by `tokio_util::task::TaskTracker`, the
//! same primitive `crates/deployer-server` uses for `state.tasks.spawn(...)`,
//! with no broker, just in-process fire-and-forget with graceful-shutdown
//! awaitability.
//!
//! At-least-once here means: a task that's already been spawned will run to
//! completion even if cancellation is requested meanwhile (the tracker only
//! refuses new spawns after `close()`); it does not retry on panic.

use std::future::Future;

use log::error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone)]
pub struct TaskQueue {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns `fut` under a name used only for log correlation; panics are
    /// caught and logged rather than silently dropped.
    pub fn spawn_named<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            if let Err(panic) = futures_util::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(fut)).await {
                error!("background task {name} panicked: {panic:?}");
            }
        });
    }

    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Stops accepting new work and waits for everything already spawned to
    /// finish, for graceful shutdown.
    pub async fn close_and_wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
