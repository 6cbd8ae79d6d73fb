//! Shared cancellation and task-ownership handle threaded through Gateway and Client
//! sessions, so a single Ctrl-C/SIGTERM cascades into every spawned connection task.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Cloneable handle to the runtime's shutdown signal and its set of owned background
/// tasks. Cloning shares the same [`CancellationToken`]; each clone gets its own
/// `JoinSet` view is not meaningful, so tasks are always spawned through
/// [`AppContext::spawn`] onto the one `JoinSet` the root context owns.
pub struct AppContext {
    token: CancellationToken,
    tasks: JoinSet<()>,
}

impl AppContext {
    pub fn new() -> Self {
        Self { token: CancellationToken::new(), tasks: JoinSet::new() }
    }

    /// The root cancellation token, cancelled when [`shutdown`](Self::shutdown) runs.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawns `fut` as an owned background task. Owned tasks are awaited by
    /// [`join_all`](Self::join_all) during shutdown; a task that never observes
    /// `token()` cancellation will keep shutdown pending indefinitely.
    pub fn spawn(&mut self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.spawn(fut);
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Awaits every task spawned via [`spawn`](Self::spawn), draining the `JoinSet`.
    /// Call after [`shutdown`](Self::shutdown) to wait for a clean stop.
    pub async fn join_all(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}
