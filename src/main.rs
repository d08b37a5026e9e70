use anyhow::Context;
use hubgate::config::{Config, DEFAULT_CONFIG};
use hubgate::hub::{PKG_NAME, VERSION};
use hubgate::orchestrator::Orchestrator;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hubgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let first = args.next();

    if first.as_deref() == Some("--generate-config") {
        let path = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config.toml"));
        return generate_config(&path);
    }

    // Load configuration
    let config_path = first
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).with_context(|| {
        format!("failed to load configuration from {}", config_path.display())
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bring-up: each phase must succeed before the next one runs
    let mut orchestrator = Orchestrator::new(config);
    orchestrator
        .validate()
        .context("configuration validation failed")?;
    orchestrator
        .init_store()
        .context("entity store initialization failed")?;
    orchestrator
        .start_proxy()
        .await
        .context("failed to start proxy")?;
    let handles = orchestrator
        .serve(shutdown_rx)
        .await
        .context("failed to assemble request surface")?;

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown; further termination signals are ignored while the
    // coordinator runs
    let _ = shutdown_tx.send(true);
    orchestrator.into_shutdown().run().await;

    // Wait for the serving tasks to wind down (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = handles.hub_task.await;
        let _ = handles.watchdog_task.await;
    })
    .await;

    Ok(())
}

fn generate_config(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("refusing to overwrite existing file {}", path.display());
    }
    std::fs::write(path, DEFAULT_CONFIG)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting control plane");
    info!(
        hub = %format!("{}:{}", config.hub.ip, config.hub.port),
        proxy = %format!("{}:{}", config.proxy.ip, config.proxy.port),
        proxy_api = %format!("{}:{}", config.proxy.api_ip, config.proxy.api_port()),
        tls = config.proxy.ssl_cert.is_some(),
        "Configured endpoints"
    );
    info!(
        watchdog_period_secs = config.proxy.check_interval_secs,
        probe_timeout_ms = config.proxy.startup_probe_timeout_ms,
        "Proxy supervision settings"
    );
    info!(
        admins = ?config.users.admins,
        authenticator = %config.users.authenticator,
        spawner = %config.spawner.kind,
        "Collaborators"
    );
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Write PID
        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}
