//! Proxy process supervision
//!
//! Owns the externally-launched reverse-proxy process: builds its launch
//! command, probes both of its endpoints to readiness with a bounded
//! retry budget, and runs the periodic watchdog that restarts the proxy
//! and replays the route table when the process dies. No other component
//! inspects the proxy process; liveness questions go through here.

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::routes::RouteClient;
use crate::store::{self, Proxy, Store};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

/// Readiness probe attempts per endpoint before the startup timeout
pub const STARTUP_PROBE_ATTEMPTS: u32 = 10;

pub struct ProxySupervisor {
    proxy: Proxy,
    /// Where the proxy sends traffic that matches no route (the hub)
    default_target: String,
    config: ProxyConfig,
    child: Mutex<Option<Child>>,
}

impl ProxySupervisor {
    pub fn new(proxy: Proxy, default_target: String, config: ProxyConfig) -> Self {
        Self {
            proxy,
            default_target,
            config,
            child: Mutex::new(None),
        }
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Launch the proxy process and wait until both of its endpoints
    /// accept connections.
    ///
    /// Each probe attempt first polls the child: a process that already
    /// exited fails immediately with `ProxyLaunch` and is not retried.
    /// Connection timeouts and refusals both count as not-yet-ready.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.child.lock().await;

        info!(
            command = %self.config.command,
            public = %self.proxy.public.bind_addr(),
            api = %self.proxy.api.bind_addr(),
            "Starting proxy"
        );
        *slot = Some(self.launch()?);

        let probe_timeout = self.config.probe_timeout();
        for endpoint in [&self.proxy.public, &self.proxy.api] {
            let addr = endpoint.connect_addr();
            for _ in 0..STARTUP_PROBE_ATTEMPTS {
                let child = slot.as_mut().expect("child installed above");
                if let Some(status) = child.try_wait()? {
                    let code = status.code().unwrap_or(-1);
                    error!(code, "Proxy exited during startup");
                    return Err(Error::ProxyLaunch { code });
                }
                if wait_up(&addr, probe_timeout).await {
                    break;
                }
            }
            // One more probe after the retry budget, in both outcomes of
            // the loop; its failure is what surfaces as the startup
            // timeout. Unlike the attempts above it is not preceded by a
            // process-liveness poll.
            if !wait_up(&addr, probe_timeout).await {
                return Err(Error::ProxyStartupTimeout { endpoint: addr });
            }
        }

        debug!("Proxy started and appears to be up");
        Ok(())
    }

    fn launch(&self) -> Result<Child> {
        let mut argv = shell_words::split(&self.config.command)
            .map_err(|e| Error::Command(e.to_string()))?;
        if argv.is_empty() {
            return Err(Error::Command("empty proxy command".to_string()));
        }

        let mut cmd = Command::new(argv.remove(0));
        cmd.args(argv)
            .arg("--ip")
            .arg(&self.proxy.public.ip)
            .arg("--port")
            .arg(self.proxy.public.port.to_string())
            .arg("--api-ip")
            .arg(&self.proxy.api.ip)
            .arg("--api-port")
            .arg(self.proxy.api.port.to_string())
            .arg("--default-target")
            .arg(&self.default_target);
        if tracing::enabled!(tracing::Level::DEBUG) {
            cmd.arg("--log-level").arg("debug");
        }
        if let Some(ref key) = self.config.ssl_key {
            cmd.arg("--ssl-key").arg(key);
        }
        if let Some(ref cert) = self.config.ssl_cert {
            cmd.arg("--ssl-cert").arg(cert);
        }
        // The token travels in the environment, never on the command
        // line, so it cannot leak through process listings.
        cmd.env("CONFIGPROXY_AUTH_TOKEN", &self.proxy.auth_token);

        let child = cmd.spawn()?;
        info!(pid = child.id().unwrap_or(0), "Proxy process spawned");
        Ok(child)
    }

    /// Whether the proxy process is currently alive
    pub async fn is_running(&self) -> bool {
        let mut slot = self.child.lock().await;
        matches!(slot.as_mut().map(|c| c.try_wait()), Some(Ok(None)))
    }

    /// Send the proxy a terminate signal without waiting for it to exit
    pub async fn terminate(&self) {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            if let Some(pid) = child.id() {
                info!(pid, "Terminating proxy");
                #[cfg(unix)]
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
                #[cfg(not(unix))]
                {
                    let _ = child.start_kill();
                }
            }
        }
    }

    /// One watchdog pass: no-op while the proxy lives; on death, restart
    /// it with the same entity (same token, same endpoints) and replay
    /// the route table. A failed restart is reported and left for the
    /// next tick.
    pub async fn tick(&self, store: &Store, routes: &RouteClient, base_url: &str) {
        let status = {
            let mut slot = self.child.lock().await;
            match slot.as_mut() {
                None => return,
                Some(child) => match child.try_wait() {
                    Ok(None) => return,
                    Ok(Some(status)) => status,
                    Err(e) => {
                        error!(error = %e, "Failed to poll proxy process");
                        return;
                    }
                },
            }
        };

        error!(code = status.code().unwrap_or(-1), "Proxy stopped");
        if let Err(e) = self.start().await {
            error!(error = %e, "Failed to restart proxy, will retry on next tick");
            return;
        }

        info!("Setting up routes on new proxy");
        match store::with_retry(|| store.list_users_with_backends()) {
            Ok(users) => {
                routes.add_all_users(base_url, &users).await;
                info!("New proxy back up, and good to go");
            }
            Err(e) => {
                error!(error = %e, "Failed to list routed users for resync");
            }
        }
    }

    /// Run the periodic watchdog until shutdown is signalled.
    ///
    /// Ticks are serialized with respect to themselves: a tick's restart
    /// attempt completes before the next tick begins.
    pub async fn run_watchdog(
        &self,
        store: &Store,
        routes: &RouteClient,
        base_url: &str,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let period = self.config.check_interval();
        info!(period_secs = period.as_secs(), "Proxy watchdog started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    self.tick(store, routes, base_url).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy watchdog shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Wait until `addr` accepts a TCP connection, up to `timeout`.
///
/// Refused connections are polled again on a fraction of the timeout;
/// the overall attempt never exceeds `timeout`.
async fn wait_up(addr: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let poll = (timeout / 10).max(Duration::from_millis(10));

    loop {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let remaining = deadline - now;

        match tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => return true,
            Ok(Err(_)) => {
                tokio::time::sleep(poll.min(remaining)).await;
            }
            Err(_) => return false,
        }
    }
}
