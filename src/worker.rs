//! State owned by one worker process and shared by its connections

use crate::cache::{CachePolicy, ResponseCache};
use crate::config::Config;
use crate::error::ProxyError;
use crate::locator::ContainerLocator;
use crate::routes::{RoutingCache, StaticRoutes};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-connection limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Idle time allowed between reads while the request head is incomplete
    pub header_timeout: Duration,
    /// Upper bound on establishing the upstream connection
    pub connect_timeout: Duration,
    /// Request body bytes accepted beyond the head budget
    pub client_max_body_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            header_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            client_max_body_size: 2 * 1024 * 1024,
        }
    }
}

/// Routing state, cache and limits for one worker.
///
/// Nothing here is shared between workers; a restarted worker starts with an
/// empty routing cache.
pub struct Worker {
    routes: RoutingCache,
    static_routes: StaticRoutes,
    locator: Arc<dyn ContainerLocator>,
    cache: Option<ResponseCache>,
    limits: Limits,
}

impl Worker {
    pub fn new(
        static_routes: StaticRoutes,
        locator: Arc<dyn ContainerLocator>,
        route_ttl: Duration,
        cache: Option<ResponseCache>,
        limits: Limits,
    ) -> Self {
        Self {
            routes: RoutingCache::new(route_ttl),
            static_routes,
            locator,
            cache,
            limits,
        }
    }

    pub fn from_config(config: &Config, locator: Arc<dyn ContainerLocator>) -> Self {
        let cache = config.cache.dir.as_ref().map(|dir| {
            ResponseCache::new(
                dir,
                CachePolicy {
                    max_age: config.cache.max_age_secs,
                    max_file_size: config.cache.max_file_size,
                },
            )
        });

        let limits = Limits {
            header_timeout: config.proxy.header_timeout(),
            connect_timeout: config.proxy.connect_timeout(),
            client_max_body_size: config.proxy.client_max_body_size,
        };

        Self::new(
            StaticRoutes::new(config.routes.clone()),
            locator,
            config.docker.route_ttl(),
            cache,
            limits,
        )
    }

    pub fn routes(&self) -> &RoutingCache {
        &self.routes
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Find the backend for `name`: routing cache, then static table, then
    /// the container locator. Located addresses are remembered.
    pub async fn resolve(&self, name: &str, target_port: u16) -> Result<(String, u16), ProxyError> {
        if let Some((address, port)) = self.routes.resolve(name).filter(|(_, p)| *p == target_port) {
            debug!(name, address = %address, port, "Route cache hit");
            return Ok((address, port));
        }

        if let Some((address, port)) = self.static_routes.lookup(name) {
            let port = port.unwrap_or(target_port);
            debug!(name, address = %address, port, "Static route");
            return Ok((address, port));
        }

        match self.locator.locate(name).await {
            Ok(address) => {
                debug!(name, address = %address, port = target_port, "Container located");
                self.routes.record(name, &address, target_port);
                Ok((address, target_port))
            }
            Err(e) => Err(ProxyError::LookupFailure {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
