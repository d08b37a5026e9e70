//! Per-user backend spawning
//!
//! The control plane never owns a backend process directly; it goes
//! through a [`Spawner`] and holds only [`BackendHandle`]s. Variants are
//! selected by a string key from configuration through [`create`], so
//! adding a spawner means adding an arm there.

use crate::config::SpawnerConfig;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Reference to a running per-user backend.
///
/// Opaque to the orchestration core beyond the routed `url` and the
/// owning spawner's `stop` contract. Cloneable so the entity store and
/// the shutdown coordinator can both refer to the same process.
#[derive(Clone)]
pub struct BackendHandle {
    /// Owning user
    pub user: String,
    /// Target the proxy routes this user's traffic to
    pub url: String,
    /// The child process, for spawners that track one directly
    pub(crate) process: Option<Arc<Mutex<Child>>>,
}

impl BackendHandle {
    /// A handle with no process attached, for spawners that manage the
    /// backend elsewhere (and for tests).
    pub fn detached(user: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            url: url.into(),
            process: None,
        }
    }

    fn local(user: impl Into<String>, url: impl Into<String>, child: Child) -> Self {
        Self {
            user: user.into(),
            url: url.into(),
            process: Some(Arc::new(Mutex::new(child))),
        }
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("user", &self.user)
            .field("url", &self.url)
            .finish()
    }
}

/// Lifecycle contract for per-user backends.
///
/// `stop` must be idempotent and must eventually resolve even if the
/// backend is already gone.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, user: &str) -> anyhow::Result<BackendHandle>;
    async fn stop(&self, handle: &BackendHandle) -> anyhow::Result<()>;
}

/// Build the configured spawner variant
pub fn create(config: &SpawnerConfig) -> anyhow::Result<Arc<dyn Spawner>> {
    match config.kind.as_str() {
        "local" => Ok(Arc::new(LocalProcessSpawner::new(config)?)),
        other => anyhow::bail!("unknown spawner kind: {}", other),
    }
}

/// Spawns each user's backend as a local child process.
///
/// Ports are handed out sequentially from `port_base`; the backend
/// learns its user and port from the environment.
pub struct LocalProcessSpawner {
    argv: Vec<String>,
    working_dir: Option<String>,
    grace_period: Duration,
    next_port: AtomicU16,
}

impl LocalProcessSpawner {
    pub fn new(config: &SpawnerConfig) -> anyhow::Result<Self> {
        let argv = shell_words::split(&config.command)
            .map_err(|e| anyhow::anyhow!("invalid spawner command: {}", e))?;
        if argv.is_empty() {
            anyhow::bail!("spawner command is empty");
        }
        Ok(Self {
            argv,
            working_dir: config.working_dir.clone(),
            grace_period: config.shutdown_grace_period(),
            next_port: AtomicU16::new(config.port_base),
        })
    }
}

#[async_trait]
impl Spawner for LocalProcessSpawner {
    async fn spawn(&self, user: &str) -> anyhow::Result<BackendHandle> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        cmd.stdin(Stdio::null());
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.env("HUBGATE_USER", user);
        cmd.env("PORT", port.to_string());

        let child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        info!(user, pid, port, "Backend process spawned");

        let url = format!("http://127.0.0.1:{}", port);
        Ok(BackendHandle::local(user, url, child))
    }

    async fn stop(&self, handle: &BackendHandle) -> anyhow::Result<()> {
        let Some(ref process) = handle.process else {
            return Ok(());
        };
        let mut child = process.lock().await;

        if let Ok(Some(status)) = child.try_wait() {
            debug!(user = %handle.user, ?status, "Backend already exited");
            return Ok(());
        }

        if let Some(pid) = child.id() {
            info!(user = %handle.user, pid, "Sending SIGTERM to backend");
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(user = %handle.user, ?status, "Backend exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(user = %handle.user, error = %e, "Error waiting for backend to exit");
            }
            Err(_) => {
                warn!(
                    user = %handle.user,
                    grace_period_secs = self.grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                child.kill().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpawnerConfig;

    fn test_config(command: &str, port_base: u16) -> SpawnerConfig {
        let mut config = SpawnerConfig::default();
        config.command = command.to_string();
        config.port_base = port_base;
        config.shutdown_grace_secs = 1;
        config
    }

    #[test]
    fn test_create_local() {
        let spawner = create(&test_config("sleep 60", 9100));
        assert!(spawner.is_ok());
    }

    #[test]
    fn test_create_unknown_kind() {
        let mut config = test_config("sleep 60", 9100);
        config.kind = "kubernetes".to_string();
        let err = create(&config).err().unwrap();
        assert!(err.to_string().contains("unknown spawner kind"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let config = test_config("", 9100);
        assert!(LocalProcessSpawner::new(&config).is_err());
    }

    #[test]
    fn test_command_parsing_respects_quotes() {
        let config = test_config(r#"sh -c "sleep 60""#, 9100);
        let spawner = LocalProcessSpawner::new(&config).unwrap();
        assert_eq!(spawner.argv, vec!["sh", "-c", "sleep 60"]);
    }

    #[tokio::test]
    async fn test_spawn_allocates_sequential_ports() {
        let spawner = LocalProcessSpawner::new(&test_config("sleep 60", 9300)).unwrap();

        let a = spawner.spawn("ada").await.unwrap();
        let b = spawner.spawn("grace").await.unwrap();
        assert_eq!(a.url, "http://127.0.0.1:9300");
        assert_eq!(b.url, "http://127.0.0.1:9301");

        spawner.stop(&a).await.unwrap();
        spawner.stop(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let spawner = LocalProcessSpawner::new(&test_config("sleep 60", 9310)).unwrap();
        let handle = spawner.spawn("ada").await.unwrap();

        spawner.stop(&handle).await.unwrap();
        // Second stop resolves even though the backend is already gone
        spawner.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_detached_handle_is_noop() {
        let spawner = LocalProcessSpawner::new(&test_config("sleep 60", 9320)).unwrap();
        let handle = BackendHandle::detached("ada", "http://127.0.0.1:9320");
        spawner.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_short_lived_process() {
        let spawner = LocalProcessSpawner::new(&test_config("true", 9330)).unwrap();
        let handle = spawner.spawn("ada").await.unwrap();
        // Give the process a moment to exit on its own
        tokio::time::sleep(Duration::from_millis(100)).await;
        spawner.stop(&handle).await.unwrap();
    }
}
