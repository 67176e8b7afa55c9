//! Backend address resolution state
//!
//! [`RoutingCache`] remembers addresses found by the container locator for a
//! limited time. [`StaticRoutes`] is the operator-maintained override table
//! loaded at startup.

use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// A backend address resolved by the container locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub address: String,
    pub port: u16,
    pub resolved_at: Instant,
}

/// In-memory, TTL'd map from backend name to resolved address.
///
/// Each worker owns its own cache. Concurrent connections race on it with
/// last-writer-wins semantics; a stale address only costs one failed
/// connect, after which the entry is evicted.
#[derive(Debug)]
pub struct RoutingCache {
    entries: DashMap<String, RouteEntry>,
    ttl: Duration,
}

impl RoutingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a fresh route for `name`
    pub fn resolve(&self, name: &str) -> Option<(String, u16)> {
        self.resolve_at(name, Instant::now())
    }

    /// Look up a route as of `now`; an expired entry is evicted and not returned
    pub fn resolve_at(&self, name: &str, now: Instant) -> Option<(String, u16)> {
        let (address, port, fresh) = self.entries.get(name).map(|entry| {
            (
                entry.address.clone(),
                entry.port,
                !self.is_expired(&entry, now),
            )
        })?;

        if fresh {
            return Some((address, port));
        }

        // The guard above is dropped; re-check so a concurrent refresh survives
        self.entries
            .remove_if(name, |_, entry| self.is_expired(entry, now));
        debug!(name, address = %address, "Route expired");
        None
    }

    fn is_expired(&self, entry: &RouteEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.resolved_at) > self.ttl
    }

    /// Store a freshly resolved route, replacing any existing one
    pub fn record(&self, name: &str, address: &str, port: u16) {
        self.entries.insert(
            name.to_string(),
            RouteEntry {
                address: address.to_string(),
                port,
                resolved_at: Instant::now(),
            },
        );
    }

    /// Drop the route for `name` so the next request re-resolves it
    pub fn evict(&self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Static name → `address[:port]` override table
#[derive(Debug, Clone, Default)]
pub struct StaticRoutes {
    routes: HashMap<String, String>,
}

impl StaticRoutes {
    pub fn new(routes: HashMap<String, String>) -> Self {
        Self { routes }
    }

    /// Address and optional port configured for `name`.
    ///
    /// A missing or zero port means the listener's target port.
    pub fn lookup(&self, name: &str) -> Option<(String, Option<u16>)> {
        let target = self.routes.get(name)?.trim();
        if target.is_empty() {
            return None;
        }
        split_target(target)
    }

    /// Describe every entry that cannot be used
    pub fn validate(&self) -> Vec<String> {
        let mut errors: Vec<String> = self
            .routes
            .iter()
            .filter(|(_, target)| !target.trim().is_empty() && split_target(target.trim()).is_none())
            .map(|(name, target)| format!("Route '{}': invalid target '{}'", name, target))
            .collect();
        errors.sort();
        errors
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn split_target(target: &str) -> Option<(String, Option<u16>)> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        let port = Some(addr.port()).filter(|p| *p != 0);
        return Some((addr.ip().to_string(), port));
    }

    match target.rsplit_once(':') {
        Some((address, port)) if !address.contains(':') => {
            let port: u16 = port.parse().ok()?;
            if address.is_empty() {
                return None;
            }
            Some((address.to_string(), Some(port).filter(|p| *p != 0)))
        }
        Some(_) => target
            .parse::<std::net::Ipv6Addr>()
            .ok()
            .map(|ip| (ip.to_string(), None)),
        None => Some((target.to_string(), None)),
    }
}
