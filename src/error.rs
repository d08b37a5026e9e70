//! Error taxonomy for the orchestration core

use thiserror::Error;

/// Errors surfaced by the control plane.
///
/// Startup-phase errors (`PortConflict`, `InvalidPrefix`, `ProxyLaunch`,
/// `ProxyStartupTimeout`, and `Persistence` during bring-up) abort the
/// process with a non-zero exit. Steady-state errors stay inside the
/// component that produced them.
#[derive(Debug, Error)]
pub enum Error {
    /// Two roles were configured to listen on the same port.
    #[error("the {role_a} and {role_b} cannot both listen on port {port}")]
    PortConflict {
        role_a: &'static str,
        role_b: &'static str,
        port: u16,
    },

    /// A configured URL prefix is unusable (e.g. a bare "/").
    #[error("invalid URL prefix: {0:?}")]
    InvalidPrefix(String),

    /// The configured proxy command could not be parsed or executed.
    #[error("invalid proxy command: {0}")]
    Command(String),

    /// The proxy process exited while we were still probing it.
    #[error("proxy failed to start with exit code {code}")]
    ProxyLaunch { code: i32 },

    /// A proxy endpoint never accepted connections within the probe budget.
    #[error("proxy endpoint {endpoint} never became reachable")]
    ProxyStartupTimeout { endpoint: String },

    /// The entity store failed underneath us.
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// A proxy route-table call failed.
    #[error("route API error: {0}")]
    RouteApi(#[from] reqwest::Error),

    /// A per-user backend did not acknowledge its stop request.
    #[error("backend for {user} failed to stop: {reason}")]
    BackendStop { user: String, reason: String },

    #[error("configuration error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error is retried once before surfacing during
    /// steady-state operation (store calls from the watchdog and the
    /// request surface).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Persistence(_))
    }
}
