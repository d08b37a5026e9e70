//! Integration tests for proxy launch, readiness probing, and the watchdog

mod common;

use common::{free_port, MockProxyApi};
use hubgate::config::ProxyConfig;
use hubgate::error::Error;
use hubgate::routes::RouteClient;
use hubgate::spawner::BackendHandle;
use hubgate::store::{Endpoint, Proxy, Store};
use hubgate::supervisor::ProxySupervisor;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

const AUTH_TOKEN: &str = "test-proxy-token";

fn proxy_entity(public_port: u16, api_port: u16) -> Proxy {
    Proxy {
        public: Endpoint::new("127.0.0.1", public_port),
        api: Endpoint::new("127.0.0.1", api_port).with_base_path("/api/routes/"),
        auth_token: AUTH_TOKEN.to_string(),
    }
}

fn supervisor(public_port: u16, api_port: u16, command: &str, probe_ms: u64) -> ProxySupervisor {
    let mut config = ProxyConfig::default();
    config.command = command.to_string();
    config.startup_probe_timeout_ms = probe_ms;
    ProxySupervisor::new(
        proxy_entity(public_port, api_port),
        "http://127.0.0.1:8081".to_string(),
        config,
    )
}

fn routed_store(users: &[(&str, &str)]) -> Store {
    let store = Store::open_in_memory().unwrap();
    for (name, url) in users {
        store.upsert_user(name).unwrap();
        store
            .attach_backend(name, BackendHandle::detached(*name, *url))
            .unwrap();
    }
    store
}

#[tokio::test]
async fn test_start_fails_fast_when_proxy_exits() {
    let public_port = free_port().await;
    let api_port = free_port().await;

    let sup = supervisor(public_port, api_port, "sh -c 'exit 17'", 100);
    match sup.start().await {
        Err(Error::ProxyLaunch { code }) => assert_eq!(code, 17),
        other => panic!("expected ProxyLaunch, got {:?}", other),
    }
    assert!(!sup.is_running().await);
}

#[tokio::test]
async fn test_start_succeeds_when_endpoints_are_up() {
    let public_port = free_port().await;
    let api_port = free_port().await;

    let _public = TcpListener::bind(("127.0.0.1", public_port)).await.unwrap();
    let _api = TcpListener::bind(("127.0.0.1", api_port)).await.unwrap();

    let sup = supervisor(public_port, api_port, "sh -c 'exec sleep 60'", 100);
    sup.start().await.unwrap();
    assert!(sup.is_running().await);

    sup.terminate().await;
}

#[tokio::test]
async fn test_start_retries_until_endpoint_appears() {
    let public_port = free_port().await;
    let api_port = free_port().await;

    let _api = TcpListener::bind(("127.0.0.1", api_port)).await.unwrap();

    // Public endpoint only starts listening after a few probe intervals
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let listener = TcpListener::bind(("127.0.0.1", public_port)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(listener);
    });

    let sup = supervisor(public_port, api_port, "sh -c 'exec sleep 60'", 100);
    let started = Instant::now();
    sup.start().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(sup.is_running().await);

    sup.terminate().await;
}

#[tokio::test]
async fn test_start_times_out_when_never_reachable() {
    let public_port = free_port().await;
    let api_port = free_port().await;

    let sup = supervisor(public_port, api_port, "sh -c 'exec sleep 60'", 50);
    let started = Instant::now();
    match sup.start().await {
        Err(Error::ProxyStartupTimeout { endpoint }) => {
            assert!(endpoint.contains(&public_port.to_string()));
        }
        other => panic!("expected ProxyStartupTimeout, got {:?}", other),
    }
    // Ten probe attempts plus the final check, 50ms each
    assert!(started.elapsed() >= Duration::from_millis(500));

    sup.terminate().await;
}

#[tokio::test]
async fn test_watchdog_tick_is_noop_while_proxy_lives() {
    let public_port = free_port().await;
    let api_port = free_port().await;

    let _public = TcpListener::bind(("127.0.0.1", public_port)).await.unwrap();
    let api = MockProxyApi::spawn(api_port, AUTH_TOKEN).await;

    let sup = supervisor(public_port, api_port, "sh -c 'exec sleep 60'", 100);
    sup.start().await.unwrap();

    let store = routed_store(&[("ada", "http://127.0.0.1:9100")]);
    let routes = RouteClient::new(sup.proxy());

    api.clear_requests();
    sup.tick(&store, &routes, "/").await;

    assert!(sup.is_running().await);
    assert_eq!(api.request_count(), 0, "a live proxy must not be restarted");

    sup.terminate().await;
}

#[tokio::test]
async fn test_watchdog_tick_without_started_proxy_is_noop() {
    let public_port = free_port().await;
    let api_port = free_port().await;
    let api = MockProxyApi::spawn(api_port, AUTH_TOKEN).await;

    let sup = supervisor(public_port, api_port, "sh -c 'exec sleep 60'", 100);
    let store = routed_store(&[]);
    let routes = RouteClient::new(sup.proxy());

    sup.tick(&store, &routes, "/").await;
    assert_eq!(api.request_count(), 0);
}

#[tokio::test]
async fn test_watchdog_restarts_and_replays_routes() {
    let public_port = free_port().await;
    let api_port = free_port().await;

    let _public = TcpListener::bind(("127.0.0.1", public_port)).await.unwrap();
    let api = MockProxyApi::spawn(api_port, AUTH_TOKEN).await;

    let sup = supervisor(public_port, api_port, "sh -c 'exec sleep 60'", 100);
    sup.start().await.unwrap();

    let store = routed_store(&[
        ("ada", "http://127.0.0.1:9100"),
        ("grace", "http://127.0.0.1:9101"),
    ]);
    let routes = RouteClient::new(sup.proxy());

    // Kill the proxy out from under the watchdog
    sup.terminate().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!sup.is_running().await);

    api.clear_requests();
    sup.tick(&store, &routes, "/").await;

    // Exactly one restart, one route-add per routed user
    assert!(sup.is_running().await);
    let requests = api.requests.lock().unwrap().clone();
    let puts: Vec<&(String, String)> = requests.iter().filter(|(m, _)| m == "PUT").collect();
    assert_eq!(puts.len(), 2);
    assert!(requests
        .iter()
        .any(|(m, p)| m == "PUT" && p == "/api/routes/user/ada"));
    assert!(requests
        .iter()
        .any(|(m, p)| m == "PUT" && p == "/api/routes/user/grace"));

    let table = api.routes();
    assert_eq!(
        table.get("/user/ada").map(String::as_str),
        Some("http://127.0.0.1:9100")
    );
    assert_eq!(
        table.get("/user/grace").map(String::as_str),
        Some("http://127.0.0.1:9101")
    );

    sup.terminate().await;
}

#[tokio::test]
async fn test_watchdog_survives_failed_restart() {
    let public_port = free_port().await;
    let api_port = free_port().await;

    let public = TcpListener::bind(("127.0.0.1", public_port)).await.unwrap();
    let _api = TcpListener::bind(("127.0.0.1", api_port)).await.unwrap();

    let sup = supervisor(public_port, api_port, "sh -c 'exec sleep 60'", 50);
    sup.start().await.unwrap();

    let store = routed_store(&[]);
    let routes = RouteClient::new(sup.proxy());

    // Take both the proxy and its public port down so the restart fails
    sup.terminate().await;
    drop(public);
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The tick's restart attempt fails; the failure is reported, not raised
    sup.tick(&store, &routes, "/").await;

    // Kill the unreachable replacement, restore the port, and let the
    // next tick try again
    sup.terminate().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let _public = TcpListener::bind(("127.0.0.1", public_port)).await.unwrap();

    sup.tick(&store, &routes, "/").await;
    assert!(sup.is_running().await);

    sup.terminate().await;
}
