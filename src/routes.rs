//! Client for the proxy's route-table control API
//!
//! The proxy owns the route table; this client programs it. Adds and
//! removes are addressed by path prefix, so replaying them is idempotent
//! and a full resync after a proxy restart is just one add per routed
//! user.

use crate::config::url_path_join;
use crate::error::Result;
use crate::store::{Proxy, User};
use std::time::Duration;
use tracing::{debug, error, info};

/// Request timeout for control-API calls
const API_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RouteClient {
    client: reqwest::Client,
    api_url: String,
    auth_token: String,
}

impl RouteClient {
    pub fn new(proxy: &Proxy) -> Self {
        let base = proxy.api.url();
        let api_url = match proxy.api.base_path.as_deref() {
            Some(path) => format!("{}{}", base, path.trim_end_matches('/')),
            None => format!("{}/api/routes", base),
        };
        Self {
            client: reqwest::Client::builder()
                .timeout(API_TIMEOUT)
                .build()
                .expect("reqwest client with static configuration"),
            api_url,
            auth_token: proxy.auth_token.clone(),
        }
    }

    fn route_url(&self, prefix: &str) -> String {
        format!("{}/{}", self.api_url, prefix.trim_matches('/'))
    }

    /// Map a path prefix to a target endpoint
    pub async fn add_route(&self, prefix: &str, target: &str) -> Result<()> {
        debug!(prefix, target, "Adding proxy route");
        self.client
            .put(self.route_url(prefix))
            .bearer_auth(&self.auth_token)
            .json(&serde_json::json!({ "target": target }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Remove the mapping for a path prefix
    pub async fn remove_route(&self, prefix: &str) -> Result<()> {
        debug!(prefix, "Removing proxy route");
        self.client
            .delete(self.route_url(prefix))
            .bearer_auth(&self.auth_token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Route prefix owned by a user's backend
    pub fn user_prefix(base_url: &str, user: &str) -> String {
        url_path_join(base_url, &format!("user/{}", user))
    }

    /// Add the route for one user's backend
    pub async fn add_user_route(&self, base_url: &str, user: &User) -> Result<()> {
        let target = user
            .backend_url
            .as_deref()
            .unwrap_or_default();
        self.add_route(&Self::user_prefix(base_url, &user.name), target)
            .await
    }

    /// Remove the route for one user's backend
    pub async fn remove_user_route(&self, base_url: &str, user: &str) -> Result<()> {
        self.remove_route(&Self::user_prefix(base_url, user)).await
    }

    /// Replay one route per routed user. A freshly launched proxy has an
    /// empty route table, so this is the whole resynchronization step.
    /// Individual failures are reported and do not stop the rest.
    pub async fn add_all_users(&self, base_url: &str, users: &[User]) {
        for user in users {
            if let Err(e) = self.add_user_route(base_url, user).await {
                error!(user = %user.name, error = %e, "Failed to restore route");
            }
        }
        info!(count = users.len(), "Routes replayed");
    }
}
