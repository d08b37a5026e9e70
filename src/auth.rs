//! Authentication collaborators
//!
//! Consumed only by the request surface. Variants are selected by a
//! string key from configuration through [`create`].

use crate::config::UserConfig;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Returns the authenticated username on success, `None` on failure.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Option<String>;
}

/// Build the configured authenticator variant
pub fn create(config: &UserConfig) -> anyhow::Result<Arc<dyn Authenticator>> {
    match config.authenticator.as_str() {
        "allow-list" => {
            let allowed = config
                .admins
                .iter()
                .chain(config.allow_list.iter())
                .cloned()
                .collect();
            Ok(Arc::new(AllowListAuthenticator { allowed }))
        }
        "dummy" => Ok(Arc::new(DummyAuthenticator)),
        other => anyhow::bail!("unknown authenticator: {}", other),
    }
}

/// Accepts any username in the configured allow list (admins included).
/// Password is not checked; pair with a real credential check upstream.
pub struct AllowListAuthenticator {
    allowed: HashSet<String>,
}

#[async_trait]
impl Authenticator for AllowListAuthenticator {
    async fn authenticate(&self, username: &str, _password: &str) -> Option<String> {
        if self.allowed.contains(username) {
            Some(username.to_string())
        } else {
            debug!(username, "Username not in allow list");
            None
        }
    }
}

/// Accepts any non-empty username. Development only.
pub struct DummyAuthenticator;

#[async_trait]
impl Authenticator for DummyAuthenticator {
    async fn authenticate(&self, username: &str, _password: &str) -> Option<String> {
        if username.is_empty() {
            None
        } else {
            Some(username.to_string())
        }
    }
}
