//! Dockgate - An edge reverse proxy for Docker hosts
//!
//! This library provides a byte-level HTTP/1.x reverse proxy that:
//! - Routes traffic by Host header to a container of the same name
//! - Remembers container addresses for a configurable TTL
//! - Honours a static name → address override table
//! - Caches small, public HTML responses on disk and serves them directly
//! - Terminates TLS with provided or self-signed certificates
//! - Runs as several independent worker processes under a supervisor

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod head;
pub mod host;
pub mod listener;
pub mod locator;
pub mod routes;
pub mod supervisor;
pub mod tls;
pub mod worker;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
