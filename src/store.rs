//! Entity store for the deployment topology
//!
//! Durable description of the hub, the proxy, and the known users lives
//! in sqlite; the live handles of running per-user backends are process
//! state and are kept in an in-memory map next to the rows. Every
//! mutation commits atomically per call.

use crate::error::{Error, Result};
use crate::spawner::BackendHandle;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// A listening socket: address, port, and an optional URL base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    pub base_path: Option<String>,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            base_path: None,
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    /// Address to bind a listener on
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Address a local client can connect to. A wildcard bind address is
    /// not connectable, so it maps to loopback.
    pub fn connect_addr(&self) -> String {
        let host = match self.ip.as_str() {
            "" | "0.0.0.0" | "::" => "127.0.0.1",
            ip => ip,
        };
        format!("{}:{}", host, self.port)
    }

    /// Root URL of this endpoint, without the base path
    pub fn url(&self) -> String {
        format!("http://{}", self.connect_addr())
    }
}

/// The control-plane server's own identity: one endpoint plus the
/// session-cookie signing secret. Immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct Hub {
    pub endpoint: Endpoint,
    pub cookie_secret: String,
}

/// The externally-launched reverse proxy: its public endpoint, its
/// control-API endpoint, and the control-API auth token. Persisted
/// before the process is launched so the token is known ahead of launch.
#[derive(Debug, Clone)]
pub struct Proxy {
    pub public: Endpoint,
    pub api: Endpoint,
    pub auth_token: String,
}

/// A known principal. `backend_url` is set while a per-user backend is
/// routed; the live process handle lives in the store's handle map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub admin: bool,
    pub backend_url: Option<String>,
}

/// Generate a fresh URL-safe token
pub fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generate a random hex secret of `len` characters
pub fn random_hex(len: usize) -> String {
    use rand::RngCore;
    let mut bytes = vec![0u8; len / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Entity store with thread-safe access
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    handles: DashMap<String, BackendHandle>,
}

impl Store {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            handles: DashMap::new(),
        };
        store.run_migrations()?;

        info!(path = %path.display(), "Entity store opened");
        Ok(store)
    }

    /// Open an in-memory store (default, and used by tests)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            handles: DashMap::new(),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            debug!(
                from = current_version,
                to = SCHEMA_VERSION,
                "Running store migrations"
            );
            if current_version < 1 {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS hub (
                        id INTEGER PRIMARY KEY CHECK (id = 1),
                        ip TEXT NOT NULL,
                        port INTEGER NOT NULL,
                        base_path TEXT,
                        cookie_secret TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS proxy (
                        id INTEGER PRIMARY KEY CHECK (id = 1),
                        public_ip TEXT NOT NULL,
                        public_port INTEGER NOT NULL,
                        api_ip TEXT NOT NULL,
                        api_port INTEGER NOT NULL,
                        api_base_path TEXT,
                        auth_token TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS users (
                        name TEXT PRIMARY KEY,
                        admin INTEGER NOT NULL DEFAULT 0,
                        backend_url TEXT,
                        created_at TEXT NOT NULL DEFAULT (datetime('now'))
                    );

                    INSERT INTO schema_migrations (version) VALUES (1);
                    "#,
                )?;
            }
        }

        Ok(())
    }

    /// Persist the hub singleton
    pub fn create_hub(&self, endpoint: Endpoint, cookie_secret: String) -> Result<Hub> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO hub (id, ip, port, base_path, cookie_secret)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![endpoint.ip, endpoint.port, endpoint.base_path, cookie_secret],
        )?;
        Ok(Hub {
            endpoint,
            cookie_secret,
        })
    }

    /// Persist the proxy singleton. Committed before the external proxy
    /// process is launched so the auth token exists ahead of launch.
    pub fn create_proxy(&self, public: Endpoint, api: Endpoint, auth_token: String) -> Result<Proxy> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO proxy
             (id, public_ip, public_port, api_ip, api_port, api_base_path, auth_token)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                public.ip,
                public.port,
                api.ip,
                api.port,
                api.base_path,
                auth_token
            ],
        )?;
        Ok(Proxy {
            public,
            api,
            auth_token,
        })
    }

    /// Seed admin users. Idempotent: existing rows are promoted to admin.
    pub fn seed_admins(&self, names: &[String]) -> Result<Vec<User>> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        for name in names {
            tx.execute(
                "INSERT INTO users (name, admin) VALUES (?1, 1)
                 ON CONFLICT(name) DO UPDATE SET admin = 1",
                params![name],
            )?;
        }
        tx.commit()?;

        Ok(names
            .iter()
            .map(|name| User {
                name: name.clone(),
                admin: true,
                backend_url: None,
            })
            .collect())
    }

    /// Fetch or create a user by name
    pub fn upsert_user(&self, name: &str) -> Result<User> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO users (name) VALUES (?1)",
            params![name],
        )?;
        conn.query_row(
            "SELECT name, admin, backend_url FROM users WHERE name = ?1",
            params![name],
            row_to_user,
        )
        .map_err(Error::from)
    }

    /// Look up a user by name
    pub fn get_user(&self, name: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT name, admin, backend_url FROM users WHERE name = ?1",
            params![name],
            row_to_user,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Attach a running backend to a user. The user row must exist.
    pub fn attach_backend(&self, name: &str, handle: BackendHandle) -> Result<()> {
        {
            let conn = self.conn.lock().expect("store mutex poisoned");
            let changed = conn.execute(
                "UPDATE users SET backend_url = ?2 WHERE name = ?1",
                params![name, handle.url],
            )?;
            if changed == 0 {
                return Err(Error::Persistence(rusqlite::Error::QueryReturnedNoRows));
            }
        }
        self.handles.insert(name.to_string(), handle);
        Ok(())
    }

    /// Clear a user's backend reference, returning the live handle if any
    pub fn detach_backend(&self, name: &str) -> Result<Option<BackendHandle>> {
        {
            let conn = self.conn.lock().expect("store mutex poisoned");
            conn.execute(
                "UPDATE users SET backend_url = NULL WHERE name = ?1",
                params![name],
            )?;
        }
        Ok(self.handles.remove(name).map(|(_, handle)| handle))
    }

    /// Users that currently have a routed backend
    pub fn list_users_with_backends(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT name, admin, backend_url FROM users
             WHERE backend_url IS NOT NULL ORDER BY name",
        )?;
        let users = stmt
            .query_map([], row_to_user)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// All known users
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt =
            conn.prepare("SELECT name, admin, backend_url FROM users ORDER BY name")?;
        let users = stmt
            .query_map([], row_to_user)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Live handle for a user's backend, if one is attached
    pub fn handle(&self, name: &str) -> Option<BackendHandle> {
        self.handles.get(name).map(|h| h.clone())
    }

    /// Remove and return every live backend handle. Used at shutdown;
    /// the durable rows are left as-is for the next run.
    pub fn drain_handles(&self) -> Vec<BackendHandle> {
        let names: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .filter_map(|name| self.handles.remove(&name).map(|(_, h)| h))
            .collect()
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> std::result::Result<User, rusqlite::Error> {
    Ok(User {
        name: row.get(0)?,
        admin: row.get::<_, i64>(1)? != 0,
        backend_url: row.get(2)?,
    })
}

/// Run a store operation, retrying once on a persistence failure.
///
/// Startup treats persistence failures as fatal; steady-state callers
/// (watchdog resync, route updates from the request surface) go through
/// this wrapper instead so a transient failure is retried before it is
/// reported.
pub fn with_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "Store operation failed, retrying once");
            op()
        }
        Err(e) => Err(e),
    }
}
