//! Backend names derived from the requested host
//!
//! The name is both the container looked up by the locator and the first
//! segment of the on-disk cache namespace, so two hosts that normalize to the
//! same name share a route and a cache directory.

/// Strip a trailing `:port` from a host header value
pub fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((domain, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => domain,
        _ => host,
    }
}

/// Normalize a host header value into a backend name.
///
/// `www.example.com:8080` becomes `example_com`.
pub fn name_from_host(host: &str) -> String {
    let domain = strip_port(host);
    let domain = match domain.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("www.") => &domain[4..],
        _ => domain,
    };

    let mut name = String::with_capacity(domain.len());
    let mut in_dots = false;
    for c in domain.chars() {
        if c == '.' {
            if !in_dots {
                name.push('_');
            }
            in_dots = true;
        } else {
            name.push(c);
            in_dots = false;
        }
    }

    urlencoding::encode(&name).into_owned()
}
