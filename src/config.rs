//! TOML configuration and topology validation
//!
//! One section per concern: the hub's own listener, the external proxy,
//! the entity store, users/authentication, and the backend spawner. Port
//! conflicts between the three listening roles are rejected here, before
//! any process is started.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Hub (control-plane listener) configuration
    #[serde(default)]
    pub hub: HubConfig,

    /// External reverse-proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Entity store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Users and authentication
    #[serde(default)]
    pub users: UserConfig,

    /// Per-user backend spawner
    #[serde(default)]
    pub spawner: SpawnerConfig,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HubConfig {
    /// Bind address for the hub's own listener (default: 127.0.0.1)
    #[serde(default = "default_hub_ip")]
    pub ip: String,

    /// Port for the hub's own listener (default: 8081)
    #[serde(default = "default_hub_port")]
    pub port: u16,

    /// Base URL of the entire deployment (default: "/")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// URL prefix for the hub server, under base_url. Must not be "/".
    #[serde(default = "default_hub_prefix")]
    pub prefix: String,

    /// Session-cookie signing secret. Generated fresh per run if unset.
    pub cookie_secret: Option<String>,

    /// Bearer token for the hub API. Generated fresh per run if unset.
    pub api_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Public bind address of the proxy (default: 0.0.0.0)
    #[serde(default = "default_proxy_ip")]
    pub ip: String,

    /// Public port of the proxy (default: 8000)
    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// Bind address for the proxy's control API (default: 127.0.0.1)
    #[serde(default = "default_proxy_api_ip")]
    pub api_ip: String,

    /// Port for the proxy's control API (default: public port + 1)
    pub api_port: Option<u16>,

    /// Control-API auth token. Generated fresh per run if unset.
    pub auth_token: Option<String>,

    /// Command used to launch the external proxy process. Parsed with
    /// shell quoting rules; endpoint flags are appended.
    #[serde(default = "default_proxy_command")]
    pub command: String,

    /// Path to TLS certificate for the proxy's public interface
    pub ssl_cert: Option<String>,

    /// Path to TLS key for the proxy's public interface
    pub ssl_key: Option<String>,

    /// Watchdog period in seconds (default: 10)
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Per-attempt readiness probe timeout in milliseconds (default: 1000)
    #[serde(default = "default_probe_timeout")]
    pub startup_probe_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    /// Path to the sqlite database. In-memory when unset.
    pub db_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    /// Usernames seeded as admins at startup
    #[serde(default)]
    pub admins: Vec<String>,

    /// Authenticator selector: "allow-list" (default) or "dummy"
    #[serde(default = "default_authenticator")]
    pub authenticator: String,

    /// Additional non-admin usernames accepted by the allow-list
    /// authenticator
    #[serde(default)]
    pub allow_list: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpawnerConfig {
    /// Spawner selector: "local" (default)
    #[serde(default = "default_spawner_kind")]
    pub kind: String,

    /// Command used to launch a per-user backend. Parsed with shell
    /// quoting rules; the user and port are passed in the environment.
    #[serde(default = "default_spawner_command")]
    pub command: String,

    /// First port handed out to spawned backends (default: 9100)
    #[serde(default = "default_port_base")]
    pub port_base: u16,

    /// Working directory for spawned backends
    pub working_dir: Option<String>,

    /// Grace period between SIGTERM and SIGKILL when stopping a backend
    #[serde(default = "default_grace_period")]
    pub shutdown_grace_secs: u64,

    /// How long the shutdown coordinator waits on a single backend's
    /// stop acknowledgement before giving up on it
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_hub_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_hub_port() -> u16 {
    8081
}

fn default_base_url() -> String {
    "/".to_string()
}

fn default_hub_prefix() -> String {
    "/hub/".to_string()
}

fn default_proxy_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    8000
}

fn default_proxy_api_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_command() -> String {
    "configurable-http-proxy".to_string()
}

fn default_check_interval() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_authenticator() -> String {
    "allow-list".to_string()
}

fn default_spawner_kind() -> String {
    "local".to_string()
}

fn default_spawner_command() -> String {
    "singleuser-server".to_string()
}

fn default_port_base() -> u16 {
    9100
}

fn default_grace_period() -> u64 {
    5
}

fn default_stop_timeout() -> u64 {
    20
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ip: default_hub_ip(),
            port: default_hub_port(),
            base_url: default_base_url(),
            prefix: default_hub_prefix(),
            cookie_secret: None,
            api_token: None,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ip: default_proxy_ip(),
            port: default_proxy_port(),
            api_ip: default_proxy_api_ip(),
            api_port: None,
            auth_token: None,
            command: default_proxy_command(),
            ssl_cert: None,
            ssl_key: None,
            check_interval_secs: default_check_interval(),
            startup_probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            admins: Vec::new(),
            authenticator: default_authenticator(),
            allow_list: Vec::new(),
        }
    }
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            kind: default_spawner_kind(),
            command: default_spawner_command(),
            port_base: default_port_base(),
            working_dir: None,
            shutdown_grace_secs: default_grace_period(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl ProxyConfig {
    /// Control-API port; one above the public port unless configured.
    pub fn api_port(&self) -> u16 {
        self.api_port.unwrap_or(self.port + 1)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_probe_timeout_ms)
    }
}

impl SpawnerConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Check the three listening roles for port conflicts.
    ///
    /// Runs once, synchronously, before any process or listener exists.
    pub fn validate_ports(&self) -> Result<()> {
        let hub = self.hub.port;
        let public = self.proxy.port;
        let api = self.proxy.api_port();

        if hub == public {
            return Err(Error::PortConflict {
                role_a: "hub",
                role_b: "proxy",
                port: hub,
            });
        }
        if hub == api {
            return Err(Error::PortConflict {
                role_a: "hub",
                role_b: "proxy API",
                port: hub,
            });
        }
        if public == api {
            return Err(Error::PortConflict {
                role_a: "proxy's public interface",
                role_b: "proxy API",
                port: public,
            });
        }
        Ok(())
    }

    /// The hub prefix, normalized to a slash-wrapped path under base_url.
    ///
    /// A bare "/" is rejected so the hub never shadows every route on the
    /// proxy's default target.
    pub fn hub_prefix(&self) -> Result<String> {
        let raw = self.hub.prefix.trim();
        if raw == "/" || raw.is_empty() {
            return Err(Error::InvalidPrefix(raw.to_string()));
        }
        let mut prefix = raw.to_string();
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        if !prefix.starts_with(&self.hub.base_url) {
            prefix = format!("{}/", url_path_join(&self.hub.base_url, &prefix));
        }
        Ok(prefix)
    }
}

/// Join URL path segments with exactly one slash between them.
pub fn url_path_join(base: &str, rest: &str) -> String {
    let base = base.trim_end_matches('/');
    let rest = rest.trim_start_matches('/').trim_end_matches('/');
    if rest.is_empty() {
        if base.is_empty() {
            "/".to_string()
        } else {
            base.to_string()
        }
    } else {
        format!("{}/{}", base, rest)
    }
}

/// Default configuration written by `--generate-config`
pub const DEFAULT_CONFIG: &str = r#"# hubgate configuration

[hub]
# ip = "127.0.0.1"
# port = 8081
# base_url = "/"
# prefix = "/hub/"
# cookie_secret = ""   # generated fresh per run when unset
# api_token = ""       # generated fresh per run when unset

[proxy]
# ip = "0.0.0.0"
# port = 8000
# api_ip = "127.0.0.1"
# api_port = 8001
# command = "configurable-http-proxy"
# ssl_cert = ""
# ssl_key = ""
# check_interval_secs = 10

[store]
# db_path = "hubgate.sqlite"   # in-memory when unset

[users]
# admins = ["admin"]
# authenticator = "allow-list"
# allow_list = []

[spawner]
# kind = "local"
# command = "singleuser-server"
# port_base = 9100
# shutdown_grace_secs = 5
# stop_timeout_secs = 20

# pid_file = "/var/run/hubgate.pid"
"#;
