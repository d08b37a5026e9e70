//! Hubgate - control plane for a multi-user session server
//!
//! This library keeps three cooperating roles alive and correctly wired:
//! - A public reverse proxy, launched as an external process, probed to
//!   readiness with a bounded retry budget, and watched by a periodic
//!   watchdog that restarts it and replays its route table on death
//! - A hub server that owns the entity store and programs the proxy's
//!   routes as per-user backends come and go
//! - A dynamic set of per-user backend processes, spawned through a
//!   pluggable spawner and drained concurrently at shutdown
//!
//! Bring-up is strictly ordered: topology validation, entity-store
//! population, proxy launch, then the hub's own listener. A failure in
//! any earlier step means the later ones never run.

pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod orchestrator;
pub mod routes;
pub mod shutdown;
pub mod spawner;
pub mod store;
pub mod supervisor;
