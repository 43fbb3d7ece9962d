//! Lifecycle management for the engine
//!
//! Tracks the run state, owns the cancellation token every background loop
//! listens on, and joins the loops at shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::error::{Error, Result};

use crate::state::OrchestratorState;

/// Lifecycle manager for the engine
pub struct LifecycleManager {
    /// Current state of the engine
    state: Arc<RwLock<OrchestratorState>>,

    /// Cancelled at shutdown
    shutdown: CancellationToken,

    /// Background loops by name
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(OrchestratorState::new())),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn state(&self) -> OrchestratorState {
        self.state.read().await.clone()
    }

    /// Token cancelled when shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawns a named background loop
    pub fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "Spawning background task");
        let handle = tokio::spawn(future);
        self.tasks.lock().push((name.to_string(), handle));
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Transitions to a new state
    pub async fn transition_to(&self, new_state: OrchestratorState) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.can_transition_to(&new_state) {
            return Err(Error::InvalidState(format!(
                "Cannot transition from {} to {}",
                *state, new_state
            )));
        }

        info!("State transition: {} -> {}", *state, new_state);
        if let OrchestratorState::Error(ref err) = new_state {
            error!("Engine entered error state: {}", err);
        }
        *state = new_state;

        Ok(())
    }

    /// Records a startup failure
    pub async fn handle_error(&self, error: &str) -> Result<()> {
        self.transition_to(OrchestratorState::Error(error.to_string())).await
    }

    /// Cancels every background loop and waits up to `grace` for each
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        self.transition_to(OrchestratorState::Stopping).await?;
        self.shutdown.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for (name, mut handle) in tasks {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => debug!(task = %name, "Background task exited"),
                Ok(Err(e)) => error!(task = %name, "Background task failed: {}", e),
                Err(_) => {
                    warn!(task = %name, "Background task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        self.transition_to(OrchestratorState::Stopped).await
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_transitions() {
        let lifecycle = LifecycleManager::new();
        assert!(lifecycle.state().await.is_starting());

        assert!(lifecycle.transition_to(OrchestratorState::Stopped).await.is_err());
        lifecycle.transition_to(OrchestratorState::Running).await.unwrap();
        assert!(lifecycle.state().await.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_stops_loops() {
        let lifecycle = LifecycleManager::new();
        lifecycle.transition_to(OrchestratorState::Running).await.unwrap();

        let token = lifecycle.shutdown_token();
        lifecycle.spawn("waiter", async move { token.cancelled().await });
        lifecycle.spawn("stuck", futures::future::pending::<()>());
        assert_eq!(lifecycle.task_count(), 2);

        lifecycle.shutdown(Duration::from_millis(50)).await.unwrap();
        assert!(lifecycle.state().await.is_stopped());
        assert_eq!(lifecycle.task_count(), 0);
    }
}
