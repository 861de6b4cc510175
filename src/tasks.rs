//! Task management.
//!
//! Collects the service's long-running tasks (supervisor loop, watchdog,
//! signal handler) so the binary can poll them as one unit and wind down
//! when the first one finishes or fails.

use futures_util::{future::select_all, FutureExt, TryFutureExt};
use std::future::Future;
use tokio::task::JoinHandle;

type Task = JoinHandle<crate::Result<()>>;

/// Await a [`JoinHandle`], and map the error.
async fn mapped(handle: Task) -> crate::Result<()> {
    match handle.await {
        Ok(res) => res,
        Err(e) if !e.is_cancelled() => Err(crate::Error::Join(e)),
        Err(_) => Ok(()),
    }
}

/// The set of running service tasks.
pub struct Tasks {
    tasks: Vec<Task>,
}

impl Tasks {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Spawns a future onto the runtime and tracks it.
    pub fn spawn<E: Into<crate::Error> + Send + Sync>(
        &mut self,
        future: impl Future<Output = Result<(), E>> + Send + 'static,
    ) {
        self.tasks.push(tokio::spawn(future.map_err(Into::into)));
    }

    /// Uses [`select_all`] on the tasks, actively polling them.
    ///
    /// Returns when the first task completes, with its result; remaining
    /// tasks keep running until the caller drops the runtime.
    pub async fn select(self) -> crate::Result<()> {
        let futures = self.tasks.into_iter().map(|handle| mapped(handle).boxed());

        select_all(futures).await.0
    }
}
