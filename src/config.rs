use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file picked up from the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "dockgate.toml";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and process settings
    #[serde(default)]
    pub server: ServerConfig,

    /// On-disk response cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Per-connection limits and timeouts
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Container locator
    #[serde(default)]
    pub docker: DockerConfig,

    /// Static backend overrides, `name = "address[:port]"`
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Plaintext `listen:target` pairs (default: "80:80")
    #[serde(default = "default_http_ports")]
    pub http_ports: String,

    /// TLS `listen:target` pairs (default: "443:80", empty to disable)
    #[serde(default = "default_https_ports")]
    pub https_ports: String,

    /// Worker processes (default: 1), capped at the number of CPU cores
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Verbose debug logging
    #[serde(default)]
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_ports: default_http_ports(),
            https_ports: default_https_ports(),
            workers: default_workers(),
            tls_cert: None,
            tls_key: None,
            debug: false,
        }
    }
}

impl ServerConfig {
    pub fn http_mappings(&self) -> Result<Vec<PortMapping>, String> {
        PortMapping::parse_list(&self.http_ports)
    }

    pub fn https_mappings(&self) -> Result<Vec<PortMapping>, String> {
        PortMapping::parse_list(&self.https_ports)
    }

    /// Worker count actually used: at least one, never more than the cores
    pub fn worker_count(&self) -> usize {
        self.workers.clamp(1, available_cores())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Cache root; caching is disabled when unset
    pub dir: Option<PathBuf>,

    /// Seconds a stored response stays fresh (default: 120)
    #[serde(default = "default_cache_max_age")]
    pub max_age_secs: u64,

    /// Largest stored response in bytes, head included (default: 2 MiB)
    #[serde(default = "default_max_size")]
    pub max_file_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_age_secs: default_cache_max_age(),
            max_file_size: default_max_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Largest request body accepted from a client in bytes (default: 2 MiB)
    #[serde(default = "default_max_size")]
    pub client_max_body_size: u64,

    /// Upstream connect timeout in seconds (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Idle timeout while waiting for a request head, in seconds (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub header_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            client_max_body_size: default_max_size(),
            connect_timeout_secs: default_timeout_secs(),
            header_timeout_secs: default_timeout_secs(),
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker control socket or URL (default: /var/run/docker.sock)
    #[serde(default = "default_docker_endpoint")]
    pub endpoint: String,

    /// Network whose address is preferred
    pub network: Option<String>,

    /// Seconds a located address is reused (default: 3600)
    #[serde(default = "default_route_ttl")]
    pub route_ttl_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_docker_endpoint(),
            network: None,
            route_ttl_secs: default_route_ttl(),
        }
    }
}

impl DockerConfig {
    pub fn route_ttl(&self) -> Duration {
        Duration::from_secs(self.route_ttl_secs)
    }
}

/// One listener: accept on `listen`, forward to backends on `target`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub listen: u16,
    pub target: u16,
}

impl PortMapping {
    /// Parse `"80:8080"` or `"80"` (same target as listen port)
    pub fn parse(entry: &str) -> Result<Self, String> {
        let (listen, target) = entry.split_once(':').unwrap_or((entry, ""));
        let listen: u16 = listen
            .parse()
            .map_err(|_| format!("invalid listen port in '{}'", entry))?;
        let target: u16 = if target.is_empty() {
            listen
        } else {
            target
                .parse()
                .map_err(|_| format!("invalid target port in '{}'", entry))?
        };
        Ok(Self { listen, target })
    }

    /// Parse a comma-separated list; whitespace is ignored
    pub fn parse_list(list: &str) -> Result<Vec<Self>, String> {
        let compact: String = list.chars().filter(|c| !c.is_whitespace()).collect();
        compact
            .split(',')
            .filter(|entry| !entry.is_empty())
            .map(Self::parse)
            .collect()
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_ports() -> String {
    "80:80".to_string()
}

fn default_https_ports() -> String {
    "443:80".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_cache_max_age() -> u64 {
    120
}

fn default_max_size() -> u64 {
    2 * 1024 * 1024
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_route_ttl() -> u64 {
    3600
}

fn default_docker_endpoint() -> String {
    crate::locator::DEFAULT_DOCKER_ENDPOINT.to_string()
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read config '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse config '{}': {}", path.display(), e))?;
        Ok(config)
    }

    /// Resolve the full configuration: optional file, then process environment
    pub fn from_sources(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(std::env::vars());
        config.validate()?;
        Ok(config)
    }

    /// Override settings from `APP_*`/`DOCKER_*` variables.
    ///
    /// Unparseable numbers leave the current value untouched.
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "APP_HOST" => {
                    if let Some(v) = non_empty(value) {
                        self.server.bind = v;
                    }
                }
                "APP_HTTP_PORT" => self.server.http_ports = value,
                "APP_HTTPS_PORT" => self.server.https_ports = value,
                "APP_WORKER_NUM" => {
                    if let Ok(n) = value.trim().parse() {
                        self.server.workers = n;
                    }
                }
                "APP_CACHE_DIR" => self.cache.dir = non_empty(value).map(PathBuf::from),
                "APP_CACHE_MAX_AGE" => {
                    if let Ok(n) = value.trim().parse() {
                        self.cache.max_age_secs = n;
                    }
                }
                "APP_CACHE_MAX_FILE_SIZE" => {
                    if let Ok(n) = value.trim().parse() {
                        self.cache.max_file_size = n;
                    }
                }
                "APP_CLIENT_MAX_BODY_SIZE" => {
                    if let Ok(n) = value.trim().parse() {
                        self.proxy.client_max_body_size = n;
                    }
                }
                "APP_DOCKER_ROUTE_TTL" => {
                    if let Ok(n) = value.trim().parse() {
                        self.docker.route_ttl_secs = n;
                    }
                }
                "APP_PROXY_CONNECT_TIMEOUT" => {
                    if let Ok(n) = value.trim().parse() {
                        self.proxy.connect_timeout_secs = n;
                    }
                }
                "APP_SSL_CERTIFICATE" => self.server.tls_cert = non_empty(value),
                "APP_SSL_CERTIFICATE_KEY" => self.server.tls_key = non_empty(value),
                "APP_DEBUG" => self.server.debug = parse_flag(&value),
                "DOCKER_API_ENDPOINT" => {
                    if let Some(v) = non_empty(value) {
                        self.docker.endpoint = v;
                    }
                }
                "DOCKER_NETWORK_NAME" => self.docker.network = non_empty(value),
                _ => {}
            }
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.bind.parse::<IpAddr>().is_err() {
            errors.push(format!("Invalid bind address '{}'", self.server.bind));
        }

        let http = self.server.http_mappings();
        let https = self.server.https_mappings();
        for (label, mappings) in [("HTTP", &http), ("HTTPS", &https)] {
            match mappings {
                Ok(list) => {
                    for m in list.iter().filter(|m| m.listen == 0 || m.target == 0) {
                        errors.push(format!(
                            "{} ports: port must be greater than 0 in '{}:{}'",
                            label, m.listen, m.target
                        ));
                    }
                }
                Err(e) => errors.push(format!("{} ports: {}", label, e)),
            }
        }

        if matches!((&http, &https), (Ok(h), Ok(s)) if h.is_empty() && s.is_empty()) {
            errors.push("No listen ports configured".to_string());
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("TLS certificate and key must be configured together".to_string());
        }

        errors.extend(crate::routes::StaticRoutes::new(self.routes.clone()).validate());

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
http_ports = "8080:80, 8081"
https_ports = ""
workers = 1
debug = true

[cache]
dir = "/var/cache/dockgate"
max_age_secs = 300

[proxy]
client_max_body_size = 1024
connect_timeout_secs = 5

[docker]
endpoint = "tcp://127.0.0.1:2375"
network = "web"

[routes]
example_com = "192.168.1.2:80"
localhost_app = "192.168.1.3"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(
            config.server.http_mappings().unwrap(),
            vec![
                PortMapping { listen: 8080, target: 80 },
                PortMapping { listen: 8081, target: 8081 }
            ]
        );
        assert!(config.server.https_mappings().unwrap().is_empty());
        assert!(config.server.debug);
        assert_eq!(config.cache.dir, Some(PathBuf::from("/var/cache/dockgate")));
        assert_eq!(config.cache.max_age_secs, 300);
        assert_eq!(config.cache.max_file_size, 2097152);
        assert_eq!(config.proxy.client_max_body_size, 1024);
        assert_eq!(config.proxy.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.docker.network.as_deref(), Some("web"));
        assert_eq!(config.routes.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.http_ports, "80:80");
        assert_eq!(config.server.https_ports, "443:80");
        assert!(config.cache.dir.is_none());
        assert_eq!(config.cache.max_age_secs, 120);
        assert_eq!(config.proxy.client_max_body_size, 2097152);
        assert_eq!(config.proxy.header_timeout(), Duration::from_secs(30));
        assert_eq!(config.docker.endpoint, "/var/run/docker.sock");
        assert_eq!(config.docker.route_ttl(), Duration::from_secs(3600));
        assert!(config.routes.is_empty());
        assert_eq!(config.server.workers, 1);
        assert_eq!(config.server.worker_count(), 1);
    }

    #[test]
    fn test_port_mapping_parse() {
        assert_eq!(PortMapping::parse("80:8080"), Ok(PortMapping { listen: 80, target: 8080 }));
        assert_eq!(PortMapping::parse("443"), Ok(PortMapping { listen: 443, target: 443 }));
        assert!(PortMapping::parse("http:80").is_err());
        assert!(PortMapping::parse("80:x").is_err());
        assert!(PortMapping::parse("70000").is_err());
    }

    #[test]
    fn test_port_list_ignores_whitespace() {
        let list = PortMapping::parse_list(" 80 : 80 ,\t8080 ,").unwrap();
        assert_eq!(
            list,
            vec![
                PortMapping { listen: 80, target: 80 },
                PortMapping { listen: 8080, target: 8080 }
            ]
        );
        assert!(PortMapping::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config: Config = toml::from_str("[cache]\nmax_age_secs = 300\n").unwrap();
        config.apply_env(env(&[
            ("APP_HOST", "127.0.0.1"),
            ("APP_HTTP_PORT", "8080:80"),
            ("APP_HTTPS_PORT", ""),
            ("APP_CACHE_DIR", "/tmp/cache"),
            ("APP_CACHE_MAX_AGE", "60"),
            ("APP_CACHE_MAX_FILE_SIZE", "1000"),
            ("APP_CLIENT_MAX_BODY_SIZE", "2000"),
            ("APP_DOCKER_ROUTE_TTL", "10"),
            ("APP_PROXY_CONNECT_TIMEOUT", "3"),
            ("APP_SSL_CERTIFICATE", "/etc/cert.pem"),
            ("APP_SSL_CERTIFICATE_KEY", "/etc/key.pem"),
            ("APP_DEBUG", "true"),
            ("DOCKER_API_ENDPOINT", "unix:///run/docker.sock"),
            ("DOCKER_NETWORK_NAME", "web"),
            ("UNRELATED", "ignored"),
        ]));

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.http_ports, "8080:80");
        assert!(config.server.https_mappings().unwrap().is_empty());
        assert_eq!(config.cache.dir, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(config.cache.max_age_secs, 60);
        assert_eq!(config.cache.max_file_size, 1000);
        assert_eq!(config.proxy.client_max_body_size, 2000);
        assert_eq!(config.docker.route_ttl_secs, 10);
        assert_eq!(config.proxy.connect_timeout_secs, 3);
        assert_eq!(config.server.tls_cert.as_deref(), Some("/etc/cert.pem"));
        assert_eq!(config.server.tls_key.as_deref(), Some("/etc/key.pem"));
        assert!(config.server.debug);
        assert_eq!(config.docker.endpoint, "unix:///run/docker.sock");
        assert_eq!(config.docker.network.as_deref(), Some("web"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparseable_env_numbers_keep_defaults() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("APP_CACHE_MAX_AGE", "two minutes"),
            ("APP_CLIENT_MAX_BODY_SIZE", "-1"),
            ("APP_WORKER_NUM", "many"),
        ]));
        assert_eq!(config.cache.max_age_secs, 120);
        assert_eq!(config.proxy.client_max_body_size, 2097152);
        assert_eq!(config.server.workers, default_workers());
    }

    #[test]
    fn test_empty_cache_dir_disables_cache() {
        let mut config = Config::default();
        config.apply_env(env(&[("APP_CACHE_DIR", "  ")]));
        assert!(config.cache.dir.is_none());
    }

    #[test]
    fn test_worker_count_is_capped() {
        let mut server = ServerConfig::default();
        server.workers = 0;
        assert_eq!(server.worker_count(), 1);

        server.workers = 100_000;
        assert_eq!(server.worker_count(), available_cores());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[server]
bind = "not-an-ip"
http_ports = "80:0,abc"
https_ports = "443:80"
tls_cert = "/etc/cert.pem"

[routes]
broken = "10.0.0.1:http"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Invalid bind address 'not-an-ip'"));
        assert!(err.contains("HTTP ports: invalid listen port in 'abc'"));
        assert!(err.contains("TLS certificate and key must be configured together"));
        assert!(err.contains("Route 'broken'"));
    }

    #[test]
    fn test_validate_zero_port() {
        let mut config = Config::default();
        config.server.http_ports = "8080:0".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("port must be greater than 0"));
    }

    #[test]
    fn test_validate_no_ports() {
        let mut config = Config::default();
        config.server.http_ports = String::new();
        config.server.https_ports = " , ".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("No listen ports configured"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dockgate.toml");
        std::fs::write(&path, "[server]\nhttp_ports = \"8000\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.http_mappings().unwrap()[0].listen, 8000);

        std::fs::write(&path, "[server\n").unwrap();
        assert!(Config::load(&path).unwrap_err().to_string().contains("Cannot parse config"));
        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
