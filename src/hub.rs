//! The hub's own request surface
//!
//! A small HTTP server bound on the hub endpoint once the proxy is
//! confirmed up. It wires the collaborators together: logins go through
//! the configured authenticator, and starting or stopping a user's
//! backend goes spawner -> entity store -> proxy route table. Anything
//! beyond that wiring lives outside the orchestration core.

use crate::auth::Authenticator;
use crate::routes::RouteClient;
use crate::spawner::Spawner;
use crate::store::{self, Store};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Everything a request needs, shared across connections
struct HubContext {
    store: Arc<Store>,
    spawner: Arc<dyn Spawner>,
    authenticator: Arc<dyn Authenticator>,
    routes: Arc<RouteClient>,
    api_token: String,
    prefix: String,
    base_url: String,
}

pub struct HubServer {
    bind_addr: String,
    context: Arc<HubContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HubServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bind_addr: String,
        prefix: String,
        base_url: String,
        store: Arc<Store>,
        spawner: Arc<dyn Spawner>,
        authenticator: Arc<dyn Authenticator>,
        routes: Arc<RouteClient>,
        api_token: String,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context: Arc::new(HubContext {
                store,
                spawner,
                authenticator,
                routes,
                api_token,
                prefix,
                base_url,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, prefix = %self.context.prefix, "Hub server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let ctx = Arc::clone(&context);
                                    async move { handle_request(req, ctx).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Hub connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept hub connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Hub server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    #[serde(default)]
    password: String,
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: Arc<HubContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Hub request");

    // Everything the hub serves lives under its prefix
    let Some(rest) = path.strip_prefix(ctx.prefix.as_str()).map(str::to_string) else {
        return Ok(response(StatusCode::NOT_FOUND, "not found"));
    };

    if method == Method::GET && rest == "health" {
        return Ok(response(StatusCode::OK, "ok"));
    }

    if method == Method::GET && rest == "version" {
        let version_info = serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
        });
        return Ok(json_response(StatusCode::OK, version_info.to_string()));
    }

    if method == Method::POST && rest == "login" {
        let body = req.collect().await?.to_bytes();
        return Ok(handle_login(&body, &ctx).await);
    }

    // Everything below is part of the authenticated API
    if !check_auth(&req, &ctx.api_token) {
        warn!(%path, "Unauthorized hub API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    if method == Method::GET && rest == "api/users" {
        return Ok(handle_list_users(&ctx));
    }

    if rest.starts_with("api/users/") && rest.ends_with("/server") {
        let name = rest
            .trim_start_matches("api/users/")
            .trim_end_matches("/server")
            .trim_matches('/');
        if name.is_empty() {
            return Ok(response(StatusCode::BAD_REQUEST, "missing username"));
        }
        let result = match method {
            Method::POST => handle_start_server(name, &ctx).await,
            Method::DELETE => handle_stop_server(name, &ctx).await,
            _ => response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        };
        return Ok(result);
    }

    Ok(response(StatusCode::NOT_FOUND, "not found"))
}

async fn handle_login(body: &Bytes, ctx: &HubContext) -> Response<Full<Bytes>> {
    let login: LoginRequest = match serde_json::from_slice(body) {
        Ok(login) => login,
        Err(e) => {
            return response(StatusCode::BAD_REQUEST, format!("invalid login body: {}", e));
        }
    };

    match ctx
        .authenticator
        .authenticate(&login.username, &login.password)
        .await
    {
        Some(name) => match store::with_retry(|| ctx.store.upsert_user(&name)) {
            Ok(user) => {
                info!(user = %user.name, "User authenticated");
                let body = serde_json::json!({ "name": user.name, "admin": user.admin });
                json_response(StatusCode::OK, body.to_string())
            }
            Err(e) => {
                error!(user = %name, error = %e, "Failed to persist user");
                response(StatusCode::INTERNAL_SERVER_ERROR, "store failure")
            }
        },
        None => {
            warn!(user = %login.username, "Authentication failed");
            response(StatusCode::FORBIDDEN, "authentication failed")
        }
    }
}

fn handle_list_users(ctx: &HubContext) -> Response<Full<Bytes>> {
    match store::with_retry(|| ctx.store.list_users()) {
        Ok(users) => {
            let user_list: Vec<serde_json::Value> = users
                .into_iter()
                .map(|u| {
                    serde_json::json!({
                        "name": u.name,
                        "admin": u.admin,
                        "server": u.backend_url,
                    })
                })
                .collect();
            let body = serde_json::json!({
                "users": user_list,
                "count": user_list.len(),
            });
            json_response(StatusCode::OK, body.to_string())
        }
        Err(e) => {
            error!(error = %e, "Failed to list users");
            response(StatusCode::INTERNAL_SERVER_ERROR, "store failure")
        }
    }
}

async fn handle_start_server(name: &str, ctx: &HubContext) -> Response<Full<Bytes>> {
    if ctx.store.handle(name).is_some() {
        return response(StatusCode::OK, "server already running");
    }

    if let Err(e) = store::with_retry(|| ctx.store.upsert_user(name)) {
        error!(user = name, error = %e, "Failed to persist user");
        return response(StatusCode::INTERNAL_SERVER_ERROR, "store failure");
    }

    let handle = match ctx.spawner.spawn(name).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(user = name, error = %e, "Failed to spawn backend");
            return response(StatusCode::BAD_GATEWAY, "failed to spawn backend");
        }
    };
    let url = handle.url.clone();

    if let Err(e) = store::with_retry(|| ctx.store.attach_backend(name, handle.clone())) {
        error!(user = name, error = %e, "Failed to attach backend, stopping it");
        if let Err(e) = ctx.spawner.stop(&handle).await {
            warn!(user = name, error = %e, "Backend failed to stop");
        }
        return response(StatusCode::INTERNAL_SERVER_ERROR, "store failure");
    }

    if let Err(e) = ctx
        .routes
        .add_route(&RouteClient::user_prefix(&ctx.base_url, name), &url)
        .await
    {
        error!(user = name, error = %e, "Failed to add proxy route");
        return response(StatusCode::BAD_GATEWAY, "failed to program proxy route");
    }

    info!(user = name, %url, "Backend started and routed");
    let body = serde_json::json!({ "name": name, "server": url });
    json_response(StatusCode::CREATED, body.to_string())
}

async fn handle_stop_server(name: &str, ctx: &HubContext) -> Response<Full<Bytes>> {
    let handle = match store::with_retry(|| ctx.store.detach_backend(name)) {
        Ok(Some(handle)) => handle,
        Ok(None) => return response(StatusCode::NOT_FOUND, "no server running"),
        Err(e) => {
            error!(user = name, error = %e, "Failed to detach backend");
            return response(StatusCode::INTERNAL_SERVER_ERROR, "store failure");
        }
    };

    if let Err(e) = ctx.routes.remove_user_route(&ctx.base_url, name).await {
        error!(user = name, error = %e, "Failed to remove proxy route");
    }

    // A backend that refuses to die is logged, not surfaced: the route is
    // gone and the user can start a fresh server.
    if let Err(e) = ctx.spawner.stop(&handle).await {
        warn!(user = name, error = %e, "Backend failed to stop");
    }

    info!(user = name, "Backend stopped");
    response(StatusCode::NO_CONTENT, "")
}
