//! Coordinated graceful shutdown
//!
//! Fans one stop request out per live backend, terminates the proxy
//! concurrently, joins on all the stops, then releases process-local
//! resources. Total latency is bounded by the slowest single backend
//! (or its timeout), never by the sum. A backend that fails to stop is
//! reported and does not block the rest.

use crate::spawner::Spawner;
use crate::store::Store;
use crate::supervisor::ProxySupervisor;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ShutdownCoordinator {
    store: Arc<Store>,
    spawner: Arc<dyn Spawner>,
    supervisor: Arc<ProxySupervisor>,
    pid_file: Option<PathBuf>,
    /// Per-backend cap on waiting for a stop acknowledgement
    stop_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(
        store: Arc<Store>,
        spawner: Arc<dyn Spawner>,
        supervisor: Arc<ProxySupervisor>,
        pid_file: Option<PathBuf>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            store,
            spawner,
            supervisor,
            pid_file,
            stop_timeout,
        }
    }

    /// Run the shutdown sequence to completion. Never fails; individual
    /// stop failures are logged.
    pub async fn run(self) {
        let handles = self.store.drain_handles();
        info!(backends = handles.len(), "Cleaning up per-user backends");

        // One task per backend, all issued before we wait on any of them
        let stop_tasks: Vec<_> = handles
            .into_iter()
            .map(|handle| {
                let spawner = Arc::clone(&self.spawner);
                let stop_timeout = self.stop_timeout;
                tokio::spawn(async move {
                    let user = handle.user.clone();
                    match tokio::time::timeout(stop_timeout, spawner.stop(&handle)).await {
                        Ok(Ok(())) => debug!(user = %user, "Backend stopped"),
                        Ok(Err(e)) => {
                            warn!(user = %user, error = %e, "Backend failed to stop");
                        }
                        Err(_) => {
                            warn!(
                                user = %user,
                                timeout_secs = stop_timeout.as_secs(),
                                "Backend stop timed out"
                            );
                        }
                    }
                })
            })
            .collect();

        // The proxy does not need to wait for the backends
        info!("Cleaning up proxy");
        self.supervisor.terminate().await;

        for result in join_all(stop_tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Backend stop task aborted");
            }
        }

        if let Some(ref path) = self.pid_file {
            if path.exists() {
                info!(path = %path.display(), "Cleaning up PID file");
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove PID file");
                }
            }
        }

        info!("Shutdown complete");
    }
}
