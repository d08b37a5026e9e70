//! Lifecycle orchestration
//!
//! The only component that calls the others. Bring-up is a linear state
//! machine with no backward transitions:
//!
//! `Unconfigured -> Validated -> StoreInitialized -> ProxyStarting ->
//! ProxyUp -> Serving`
//!
//! The hub's own listener is never bound before the proxy is confirmed
//! reachable, and the proxy is never launched before the entity store
//! holds its token and endpoints. Any failure on the way up is fatal:
//! the process exits without ever exposing a request surface.

use crate::auth;
use crate::config::Config;
use crate::error::Result;
use crate::hub::HubServer;
use crate::routes::RouteClient;
use crate::shutdown::ShutdownCoordinator;
use crate::spawner::{self, Spawner};
use crate::store::{new_token, random_hex, Endpoint, Hub, Proxy, Store};
use crate::supervisor::ProxySupervisor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Bring-up phases, in order. `Serving` is the only steady state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unconfigured,
    Validated,
    StoreInitialized,
    ProxyStarting,
    ProxyUp,
    Serving,
}

/// Background tasks running while in the `Serving` phase
pub struct ServeHandles {
    pub hub_task: JoinHandle<()>,
    pub watchdog_task: JoinHandle<()>,
}

/// Explicit context threaded through the bring-up phases.
///
/// Each phase method checks its precondition, does its work, and
/// advances `phase`; the fields it populates are the inputs of the
/// phases after it.
pub struct Orchestrator {
    config: Config,
    phase: Phase,
    prefix: Option<String>,
    store: Option<Arc<Store>>,
    hub: Option<Hub>,
    proxy: Option<Proxy>,
    supervisor: Option<Arc<ProxySupervisor>>,
    routes: Option<Arc<RouteClient>>,
    spawner: Option<Arc<dyn Spawner>>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            phase: Phase::Unconfigured,
            prefix: None,
            store: None,
            hub: None,
            proxy: None,
            supervisor: None,
            routes: None,
            spawner: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn store(&self) -> Option<&Arc<Store>> {
        self.store.as_ref()
    }

    fn expect_phase(&self, expected: Phase) {
        assert_eq!(
            self.phase, expected,
            "lifecycle phases must run in order (in {:?}, expected {:?})",
            self.phase, expected
        );
    }

    /// Check the configured topology. No side effects; nothing has been
    /// started yet when this fails.
    pub fn validate(&mut self) -> Result<()> {
        self.expect_phase(Phase::Unconfigured);

        self.config.validate_ports()?;
        let prefix = self.config.hub_prefix()?;
        info!(prefix = %prefix, "Topology validated");

        self.prefix = Some(prefix);
        self.phase = Phase::Validated;
        Ok(())
    }

    /// Open the entity store and commit the Hub and Proxy singletons and
    /// the seeded admins. The proxy's auth token is generated here,
    /// before any process exists that could need it.
    pub fn init_store(&mut self) -> Result<()> {
        self.expect_phase(Phase::Validated);

        let store = match self.config.store.db_path {
            Some(ref path) => Store::open(path)?,
            None => Store::open_in_memory()?,
        };

        let prefix = self.prefix.clone().expect("set during validation");
        let hub_endpoint =
            Endpoint::new(self.config.hub.ip.clone(), self.config.hub.port).with_base_path(prefix);
        let cookie_secret = self
            .config
            .hub
            .cookie_secret
            .clone()
            .unwrap_or_else(|| random_hex(64));
        let hub = store.create_hub(hub_endpoint, cookie_secret)?;

        let public = Endpoint::new(self.config.proxy.ip.clone(), self.config.proxy.port);
        let api = Endpoint::new(self.config.proxy.api_ip.clone(), self.config.proxy.api_port())
            .with_base_path("/api/routes/");
        let auth_token = self
            .config
            .proxy
            .auth_token
            .clone()
            .unwrap_or_else(new_token);
        let proxy = store.create_proxy(public, api, auth_token)?;

        let admins = store.seed_admins(&self.config.users.admins)?;
        info!(admins = admins.len(), "Entity store initialized");

        self.store = Some(Arc::new(store));
        self.hub = Some(hub);
        self.proxy = Some(proxy);
        self.phase = Phase::StoreInitialized;
        Ok(())
    }

    /// Launch the external proxy and wait for it to come up. On failure
    /// the hub listener is never bound.
    pub async fn start_proxy(&mut self) -> Result<()> {
        self.expect_phase(Phase::StoreInitialized);
        self.phase = Phase::ProxyStarting;

        let proxy = self.proxy.clone().expect("set during store init");
        let hub = self.hub.as_ref().expect("set during store init");
        let supervisor = Arc::new(ProxySupervisor::new(
            proxy.clone(),
            hub.endpoint.url(),
            self.config.proxy.clone(),
        ));
        supervisor.start().await?;

        self.routes = Some(Arc::new(RouteClient::new(&proxy)));
        self.supervisor = Some(supervisor);
        self.phase = Phase::ProxyUp;
        Ok(())
    }

    /// Assemble the request surface, bind the hub endpoint, and arm the
    /// watchdog.
    pub async fn serve(&mut self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<ServeHandles> {
        self.expect_phase(Phase::ProxyUp);

        let store = Arc::clone(self.store.as_ref().expect("set during store init"));
        let routes = Arc::clone(self.routes.as_ref().expect("set during proxy start"));
        let supervisor = Arc::clone(self.supervisor.as_ref().expect("set during proxy start"));
        let hub = self.hub.as_ref().expect("set during store init");

        let spawner = spawner::create(&self.config.spawner)?;
        let authenticator = auth::create(&self.config.users)?;

        let api_token = self.config.hub.api_token.clone().unwrap_or_else(|| {
            let token = new_token();
            info!(token = %token, "Generated hub API token (configure api_token to set a fixed value)");
            token
        });

        let hub_server = HubServer::new(
            hub.endpoint.bind_addr(),
            self.prefix.clone().expect("set during validation"),
            self.config.hub.base_url.clone(),
            Arc::clone(&store),
            Arc::clone(&spawner),
            authenticator,
            Arc::clone(&routes),
            api_token,
            shutdown_rx.clone(),
        );
        let hub_task = tokio::spawn(async move {
            if let Err(e) = hub_server.run().await {
                error!(error = %e, "Hub server error");
            }
        });

        let base_url = self.config.hub.base_url.clone();
        let watchdog_supervisor = Arc::clone(&supervisor);
        let watchdog_store = Arc::clone(&store);
        let watchdog_routes = Arc::clone(&routes);
        let watchdog_task = tokio::spawn(async move {
            watchdog_supervisor
                .run_watchdog(&watchdog_store, &watchdog_routes, &base_url, shutdown_rx)
                .await;
        });

        self.spawner = Some(spawner);
        self.phase = Phase::Serving;
        info!("Serving");
        Ok(ServeHandles {
            hub_task,
            watchdog_task,
        })
    }

    /// Hand everything the shutdown sequence needs to the coordinator
    pub fn into_shutdown(self) -> ShutdownCoordinator {
        self.expect_phase(Phase::Serving);

        ShutdownCoordinator::new(
            self.store.expect("set during store init"),
            self.spawner.expect("set during serve"),
            self.supervisor.expect("set during proxy start"),
            self.config.pid_file.as_ref().map(PathBuf::from),
            self.config.spawner.stop_timeout(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        toml::from_str("").unwrap()
    }

    #[test]
    fn test_validate_advances_phase() {
        let mut orch = Orchestrator::new(test_config());
        assert_eq!(orch.phase(), Phase::Unconfigured);
        orch.validate().unwrap();
        assert_eq!(orch.phase(), Phase::Validated);
    }

    #[test]
    fn test_validate_rejects_port_conflict() {
        let mut config = test_config();
        config.proxy.port = config.hub.port;
        let mut orch = Orchestrator::new(config);
        assert!(orch.validate().is_err());
        assert_eq!(orch.phase(), Phase::Unconfigured);
    }

    #[test]
    #[should_panic(expected = "lifecycle phases must run in order")]
    fn test_init_store_requires_validation() {
        let mut orch = Orchestrator::new(test_config());
        let _ = orch.init_store();
    }

    #[test]
    fn test_init_store_populates_entities() {
        let mut config = test_config();
        config.users.admins = vec!["ada".to_string()];
        config.proxy.auth_token = Some("fixed-token".to_string());

        let mut orch = Orchestrator::new(config);
        orch.validate().unwrap();
        orch.init_store().unwrap();
        assert_eq!(orch.phase(), Phase::StoreInitialized);

        assert_eq!(orch.proxy.as_ref().unwrap().auth_token, "fixed-token");
        assert_eq!(
            orch.hub.as_ref().unwrap().endpoint.base_path.as_deref(),
            Some("/hub/")
        );
        assert_eq!(orch.hub.as_ref().unwrap().cookie_secret.len(), 64);

        let store = orch.store().unwrap();
        let ada = store.get_user("ada").unwrap().unwrap();
        assert!(ada.admin);
    }

    #[test]
    fn test_generated_proxy_token_is_fresh_per_run() {
        let mut orch_a = Orchestrator::new(test_config());
        orch_a.validate().unwrap();
        orch_a.init_store().unwrap();

        let mut orch_b = Orchestrator::new(test_config());
        orch_b.validate().unwrap();
        orch_b.init_store().unwrap();

        assert_ne!(
            orch_a.proxy.as_ref().unwrap().auth_token,
            orch_b.proxy.as_ref().unwrap().auth_token
        );
    }
}
