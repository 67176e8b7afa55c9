//! Container address discovery
//!
//! The proxy asks a [`ContainerLocator`] for the address of the container
//! named after the requested host. The production locator inspects the
//! container through the Docker control socket.

use bollard::Docker;
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default Docker control socket
pub const DEFAULT_DOCKER_ENDPOINT: &str = "/var/run/docker.sock";

/// Upper bound on a single inspection
pub const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a container could not be located
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocateError {
    #[error("inspect: timeout")]
    Timeout,
    /// The daemon answered with an error message (e.g. no such container)
    #[error("{0}")]
    Daemon(String),
    #[error("inspect: container has no IP address")]
    NoAddress,
    #[error("inspect: {0}")]
    Transport(String),
}

/// Resolves a backend name to a container address
pub trait ContainerLocator: Send + Sync {
    fn locate<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String, LocateError>>;
}

/// Locator backed by Docker's container inspection API
pub struct DockerLocator {
    client: Docker,
    network: Option<String>,
    timeout: Duration,
}

impl DockerLocator {
    /// Connect to the Docker daemon listening on `endpoint`.
    ///
    /// `endpoint` is a socket path, optionally prefixed with `unix://`, or a
    /// `tcp://`/`http://` URL. The connection itself is established lazily
    /// on the first inspection.
    pub fn new(endpoint: &str, network: Option<String>) -> anyhow::Result<Self> {
        let timeout_secs = INSPECT_TIMEOUT.as_secs();
        let client = if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
            Docker::connect_with_http(endpoint, timeout_secs, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker at '{}': {}", endpoint, e))?
        } else {
            let socket_path = endpoint.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, timeout_secs, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker socket '{}': {}", socket_path, e))?
        };

        debug!(endpoint, network = ?network, "Docker locator configured");
        Ok(Self {
            client,
            network: network.filter(|n| !n.is_empty()),
            timeout: INSPECT_TIMEOUT,
        })
    }

    async fn inspect(&self, name: &str) -> Result<String, LocateError> {
        let info = match self.client.inspect_container(name, None).await {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError { message, .. }) => {
                return Err(LocateError::Daemon(message));
            }
            Err(e) => return Err(LocateError::Transport(e.to_string())),
        };

        let networks = info
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();

        let candidates = networks
            .iter()
            .map(|(network, endpoint)| (network.as_str(), endpoint.ip_address.as_deref()));

        select_address(candidates, self.network.as_deref()).ok_or(LocateError::NoAddress)
    }
}

impl ContainerLocator for DockerLocator {
    fn locate<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String, LocateError>> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, self.inspect(name)).await {
                Ok(result) => result,
                Err(_) => Err(LocateError::Timeout),
            }
        })
    }
}

/// Pick a container address from its networks.
///
/// The preferred network wins when it has an address; otherwise the first
/// network by name that has one.
pub fn select_address<'a>(
    networks: impl IntoIterator<Item = (&'a str, Option<&'a str>)>,
    preferred: Option<&str>,
) -> Option<String> {
    let mut usable: Vec<(&str, &str)> = networks
        .into_iter()
        .filter_map(|(network, ip)| ip.filter(|ip| !ip.is_empty()).map(|ip| (network, ip)))
        .collect();
    usable.sort_unstable();

    preferred
        .and_then(|p| usable.iter().find(|(network, _)| *network == p))
        .or_else(|| usable.first())
        .map(|(_, ip)| ip.to_string())
}
