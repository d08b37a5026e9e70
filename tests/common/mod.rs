//! Shared helpers for integration tests

#![allow(dead_code)]

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Grab a free loopback port
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for a port to become available (server listening)
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a simple HTTP request and get the raw response
pub async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n",
        method, path, port
    );
    if let Some(token) = token {
        request.push_str(&format!("Authorization: Bearer {}\r\n", token));
    }
    if let Some(body) = body {
        request.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ));
    } else {
        request.push_str("\r\n");
    }
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

pub async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_request(port, "GET", path, None, None).await
}

/// Stand-in for the proxy's route-table control API.
///
/// Records every request it sees and keeps a live prefix -> target table
/// so tests can assert on route adds, removes, and replays.
#[derive(Clone)]
pub struct MockProxyApi {
    pub port: u16,
    pub auth_token: String,
    pub requests: Arc<Mutex<Vec<(String, String)>>>,
    pub table: Arc<Mutex<HashMap<String, String>>>,
}

impl MockProxyApi {
    /// Bind on the given port and serve until the test ends
    pub async fn spawn(port: u16, auth_token: &str) -> Self {
        let api = Self {
            port,
            auth_token: auth_token.to_string(),
            requests: Arc::new(Mutex::new(Vec::new())),
            table: Arc::new(Mutex::new(HashMap::new())),
        };

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let server = api.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let server = server.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let server = server.clone();
                        async move { server.handle(req).await }
                    });
                    let _ = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        assert!(wait_for_port(port, Duration::from_secs(5)).await);
        api
    }

    async fn handle(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        let authorized = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth) == self.auth_token)
            .unwrap_or(false);
        if !authorized {
            return Ok(Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body(Full::new(Bytes::from("unauthorized")))
                .unwrap());
        }

        self.requests
            .lock()
            .unwrap()
            .push((method.clone(), path.clone()));

        let prefix = path
            .strip_prefix("/api/routes")
            .unwrap_or(&path)
            .to_string();

        let status = match method.as_str() {
            "PUT" => {
                let body = req.collect().await?.to_bytes();
                let target = serde_json::from_slice::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v.get("target").and_then(|t| t.as_str()).map(String::from))
                    .unwrap_or_default();
                self.table.lock().unwrap().insert(prefix, target);
                StatusCode::CREATED
            }
            "DELETE" => {
                self.table.lock().unwrap().remove(&prefix);
                StatusCode::NO_CONTENT
            }
            _ => StatusCode::METHOD_NOT_ALLOWED,
        };

        Ok(Response::builder()
            .status(status)
            .body(Full::new(Bytes::new()))
            .unwrap())
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    pub fn routes(&self) -> HashMap<String, String> {
        self.table.lock().unwrap().clone()
    }
}
