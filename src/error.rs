//! Connection-level failures and the plain-text responses sent for them

use std::io;
use thiserror::Error;

/// A failure that ends a single client connection.
///
/// Every variant except [`ProxyError::BodyTooLarge`] and [`ProxyError::Io`]
/// is reported to the client as an HTTP/1.0 response with
/// `Connection: close` before the socket is closed.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed head, or a head missing host, path or method
    #[error("bad request")]
    BadRequest,
    /// Head grew past the accumulation limit but looks like a real request
    #[error("request header too large")]
    HeaderTooLarge,
    /// No complete head arrived before the idle timer fired
    #[error("timed out waiting for the request head")]
    RequestTimeout,
    /// The upstream connect attempt ran out of time
    #[error("timed out connecting to the origin server")]
    UpstreamConnectTimeout,
    /// Connecting to, or exchanging data with, the upstream failed
    #[error("upstream connection to {name} ({addr}) port {port} failed: {source}")]
    UpstreamConnection {
        name: String,
        addr: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    /// The container locator could not produce an address
    #[error("failed to lookup {name}: {reason}")]
    LookupFailure { name: String, reason: String },
    /// The client sent more body bytes than allowed
    #[error("request entity too large")]
    BodyTooLarge,
    /// Client socket failure; nothing can be reported back
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Status code and reason phrase for the client-visible response
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            ProxyError::BadRequest | ProxyError::HeaderTooLarge => Some((400, "Bad Request")),
            ProxyError::RequestTimeout => Some((408, "Request Timeout")),
            ProxyError::UpstreamConnectTimeout
            | ProxyError::UpstreamConnection { .. }
            | ProxyError::LookupFailure { .. } => Some((503, "Service Unavailable")),
            ProxyError::BodyTooLarge | ProxyError::Io(_) => None,
        }
    }

    /// Human-readable body text for the client-visible response
    pub fn body(&self) -> String {
        match self {
            ProxyError::BadRequest => "Bad request".to_string(),
            ProxyError::HeaderTooLarge => "Request header too large".to_string(),
            ProxyError::RequestTimeout => {
                "Timed out while waiting for request to complete".to_string()
            }
            ProxyError::UpstreamConnectTimeout => {
                "Failed to establish connection to the origin server".to_string()
            }
            ProxyError::UpstreamConnection { name, addr, port, source } => {
                if source.kind() == io::ErrorKind::ConnectionRefused {
                    format!("Failed to connect to {} ({}) port {}", name, addr, port)
                } else {
                    format!("Service unavailable ({:?})", source.kind())
                }
            }
            ProxyError::LookupFailure { name, reason } => {
                format!("Failed to lookup {}: {}", name, reason)
            }
            ProxyError::BodyTooLarge | ProxyError::Io(_) => String::new(),
        }
    }

    /// Serialized HTTP/1.0 response, or `None` when the socket is just dropped
    pub fn to_response(&self) -> Option<Vec<u8>> {
        let (code, reason) = self.status()?;
        Some(
            format!(
                "HTTP/1.0 {} {}\r\nConnection: close\r\n\r\n{}",
                code,
                reason,
                self.body()
            )
            .into_bytes(),
        )
    }

    /// Whether this failure means the cached route for the backend is stale
    pub fn invalidates_route(&self) -> bool {
        match self {
            ProxyError::UpstreamConnectTimeout => true,
            ProxyError::UpstreamConnection { source, .. } => is_route_failure(source),
            _ => false,
        }
    }
}

/// Connect failures after which a cached backend address must be re-resolved
pub fn is_route_failure(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
            | io::ErrorKind::HostUnreachable
    )
}

/// Operator-facing description of an I/O failure for the log
pub fn describe_io_error(err: &io::Error) -> String {
    let kind = err.kind();
    let text = match kind {
        io::ErrorKind::PermissionDenied => "Permission denied",
        io::ErrorKind::AddrInUse => "Address already in use",
        io::ErrorKind::ConnectionRefused => "Connection refused by remote host",
        io::ErrorKind::ConnectionReset => "Connection reset by peer",
        io::ErrorKind::AlreadyExists => "File already exists",
        io::ErrorKind::NotFound => "No such file or directory",
        io::ErrorKind::BrokenPipe => "Broken pipe",
        io::ErrorKind::HostUnreachable => "No route to host",
        _ if err.to_string().contains("failed to lookup address") => {
            "Temporary failure in name resolution"
        }
        _ => return format!("An error occurred ({:?})", kind),
    };
    format!("{} ({:?})", text, kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_text(err: &ProxyError) -> String {
        String::from_utf8(err.to_response().unwrap()).unwrap()
    }

    #[test]
    fn test_bad_request_response() {
        assert_eq!(
            response_text(&ProxyError::BadRequest),
            "HTTP/1.0 400 Bad Request\r\nConnection: close\r\n\r\nBad request"
        );
        assert_eq!(
            response_text(&ProxyError::HeaderTooLarge),
            "HTTP/1.0 400 Bad Request\r\nConnection: close\r\n\r\nRequest header too large"
        );
    }

    #[test]
    fn test_timeout_responses() {
        assert!(response_text(&ProxyError::RequestTimeout).starts_with("HTTP/1.0 408 Request Timeout\r\n"));
        assert!(response_text(&ProxyError::UpstreamConnectTimeout)
            .ends_with("\r\n\r\nFailed to establish connection to the origin server"));
    }

    #[test]
    fn test_upstream_refused_message() {
        let err = ProxyError::UpstreamConnection {
            name: "example_com".to_string(),
            addr: "10.0.0.2".to_string(),
            port: 8080,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(err.status(), Some((503, "Service Unavailable")));
        assert_eq!(err.body(), "Failed to connect to example_com (10.0.0.2) port 8080");
        assert!(err.invalidates_route());
    }

    #[test]
    fn test_upstream_reset_keeps_route() {
        let err = ProxyError::UpstreamConnection {
            name: "example_com".to_string(),
            addr: "10.0.0.2".to_string(),
            port: 80,
            source: io::Error::from(io::ErrorKind::ConnectionReset),
        };
        assert_eq!(err.body(), "Service unavailable (ConnectionReset)");
        assert!(!err.invalidates_route());
    }

    #[test]
    fn test_lookup_failure_message() {
        let err = ProxyError::LookupFailure {
            name: "blog".to_string(),
            reason: "No such container: blog".to_string(),
        };
        assert!(response_text(&err).ends_with("Failed to lookup blog: No such container: blog"));
    }

    #[test]
    fn test_silent_errors_have_no_response() {
        assert!(ProxyError::BodyTooLarge.to_response().is_none());
        assert!(ProxyError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).to_response().is_none());
    }

    #[test]
    fn test_describe_io_error() {
        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(describe_io_error(&err), "Connection reset by peer (ConnectionReset)");

        let err = io::Error::from(io::ErrorKind::AddrInUse);
        assert_eq!(describe_io_error(&err), "Address already in use (AddrInUse)");

        let err = io::Error::from(io::ErrorKind::Interrupted);
        assert_eq!(describe_io_error(&err), "An error occurred (Interrupted)");
    }
}
