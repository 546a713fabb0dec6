//! Graceful shutdown
//!
//! Background loops are spawned through [`ShutdownCoordinator::spawn`], which
//! races them against a broadcast stop signal. [`ShutdownCoordinator::shutdown`]
//! fires the signal and drains every tracked task within a grace period,
//! aborting whatever is still running when it ends.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

struct Tracked {
    name: String,
    handle: JoinHandle<()>,
}

/// Owns background tasks and stops them together
pub struct ShutdownCoordinator {
    state: RwLock<ShutdownState>,
    stop: broadcast::Sender<()>,
    grace: Duration,
    tasks: Mutex<Vec<Tracked>>,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            state: RwLock::new(ShutdownState::Running),
            stop,
            grace,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Receive the stop signal
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.stop.subscribe()
    }

    /// Run `component` in the background until it returns or shutdown begins
    pub async fn spawn<F>(&self, name: impl Into<String>, component: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut stop = self.subscribe();
        let label = name.clone();

        let handle = tokio::spawn(async move {
            debug!(component = %label, "Component started");
            tokio::select! {
                _ = component => debug!(component = %label, "Component finished"),
                _ = stop.recv() => debug!(component = %label, "Component stopped"),
            }
        });

        self.track(name, handle).await;
    }

    /// Drain `handle` on shutdown; the task must watch the stop signal (or be cancelled) itself
    pub async fn track(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(Tracked {
            name: name.into(),
            handle,
        });
    }

    /// Signal every component and wait for tracked tasks up to the grace period
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().await;
            if *state != ShutdownState::Running {
                debug!("Shutdown already requested");
                return;
            }
            *state = ShutdownState::Draining;
        }

        let tasks: Vec<Tracked> = self.tasks.lock().await.drain(..).collect();
        info!(tasks = tasks.len(), "Shutting down");

        // Err only means no component is listening
        let _ = self.stop.send(());

        let deadline = tokio::time::Instant::now() + self.grace;
        for Tracked { name, mut handle } in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => error!(component = %name, error = %e, "Task failed during shutdown"),
                Err(_) => {
                    warn!(component = %name, "Task did not stop within grace period; aborting");
                    handle.abort();
                }
            }
        }

        *self.state.write().await = ShutdownState::Stopped;
        info!("Shutdown complete");
    }

    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.state().await != ShutdownState::Running
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_spawned_component_stops_on_shutdown() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator
            .spawn("forever", std::future::pending::<()>())
            .await;
        tokio::task::yield_now().await;

        coordinator.shutdown().await;
        assert_eq!(coordinator.state().await, ShutdownState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_is_aborted() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        let stuck = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.store(true, Ordering::SeqCst);
        });
        coordinator.track("stuck", stuck).await;

        coordinator.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_second_shutdown_is_noop() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(10));
        assert!(!coordinator.is_shutting_down().await);

        coordinator.shutdown().await;
        coordinator.shutdown().await;
        assert!(coordinator.is_shutting_down().await);
    }
}
