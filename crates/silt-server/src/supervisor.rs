//! Actor Supervisor
//!
//! Composes the node's actors: run every member in parallel, capture the
//! first exit, tell everyone else to stop, join them all, and return the
//! first error. Members are (name, run future) pairs; the stop side is the
//! shared [`ShutdownHandle`], whose trigger is idempotent and safe to call
//! concurrently with any run.
//!
//! The process maps the supervisor result to its exit code: any actor error
//! means non-zero.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Broadcast stop signal. Cloning shares the trigger.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Tell every subscriber to stop. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

type RunFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// First-exit-wins actor group.
pub struct Supervisor {
    handle: ShutdownHandle,
    members: Vec<(String, RunFuture)>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            handle: ShutdownHandle::new(),
            members: Vec::new(),
        }
    }

    pub fn handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    /// Register an actor. The future should honour a receiver from
    /// [`ShutdownHandle::subscribe`] to stop promptly when told.
    pub fn add<F, E>(&mut self, name: impl Into<String>, run: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.members.push((
            name.into(),
            Box::pin(async move { run.await.map_err(|e| Box::new(e) as BoxError) }),
        ));
    }

    /// Run all members. When the first one exits, for any reason, every
    /// other member is signalled to stop, everything is joined, and the
    /// first error (if any) is returned.
    pub async fn run(self) -> Result<(), BoxError> {
        let mut set = JoinSet::new();
        for (name, run) in self.members {
            set.spawn(async move { (name, run.await) });
        }

        let mut first_error: Option<BoxError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(actor = %name, "actor exited"),
                Ok((name, Err(err))) => {
                    error!(actor = %name, error = %err, "actor failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    error!(error = %join_err, "actor panicked");
                    if first_error.is_none() {
                        first_error = Some(Box::new(join_err));
                    }
                }
            }
            // First exit stops the rest; repeated triggers are no-ops.
            self.handle.shutdown();
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves on SIGINT or SIGTERM, the way the deployment environment stops
/// a node.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct TestError(&'static str);

    async fn wait_for_stop(mut rx: watch::Receiver<bool>) -> Result<(), TestError> {
        let _ = rx.changed().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_clean_exit_stops_everyone() {
        let mut supervisor = Supervisor::new();
        let handle = supervisor.handle();
        supervisor.add("quitter", async { Ok::<(), TestError>(()) });
        supervisor.add("waiter", wait_for_stop(handle.subscribe()));

        let result = tokio::time::timeout(Duration::from_secs(2), supervisor.run())
            .await
            .expect("supervisor returns promptly");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let mut supervisor = Supervisor::new();
        let handle = supervisor.handle();
        supervisor.add("failer", async { Err(TestError("boom")) });
        supervisor.add("waiter", wait_for_stop(handle.subscribe()));
        supervisor.add("other-waiter", wait_for_stop(handle.subscribe()));

        let err = tokio::time::timeout(Duration::from_secs(2), supervisor.run())
            .await
            .expect("supervisor returns promptly")
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_external_shutdown_is_clean() {
        let mut supervisor = Supervisor::new();
        let handle = supervisor.handle();
        supervisor.add("waiter", wait_for_stop(handle.subscribe()));

        let trigger = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.shutdown();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), supervisor.run())
            .await
            .expect("supervisor returns promptly");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_shutdown());
        handle.shutdown();
        handle.shutdown();
        assert!(handle.is_shutdown());
        // Late subscribers still observe the stop state.
        assert!(*handle.subscribe().borrow());
    }
}
