//! Raw HTTP/1.x head parsing and rewriting
//!
//! A head is parsed straight from the bytes accumulated off a socket. Header
//! lines are kept as text (one byte per character) so the head can be
//! re-serialized byte-for-byte, with forwarding headers regenerated on the way
//! through. Everything after the blank line is carried as an opaque body
//! remainder.

use chrono::Utc;
use std::collections::HashMap;

/// Blank line that ends every HTTP head
pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Identity written into regenerated `Via` headers
pub const VIA_TOKEN: &str = "dockgate";

const LINE_SEPARATOR: &str = "\r\n";

/// Response headers that are recorded but regenerated on output
const RESPONSE_REGENERATED: [&str; 3] = ["cache-control", "date", "via"];

/// Request headers that are recorded but regenerated or merged on output
const REQUEST_REGENERATED: [&str; 4] = [
    "accept-encoding",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
];

/// Hop-by-hop spoofing vectors, never recorded nor forwarded
const DROPPED: [&str; 2] = ["proxy", "upgrade-insecure-requests"];

/// Request headers `append` never rewrites verbatim
const REQUEST_PROTECTED: [&str; 4] = ["host", "x-forwarded-for", "x-forwarded-host", "x-forwarded-proto"];

/// Value recorded for one header name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Single(String),
    Multiple(Vec<String>),
}

impl HeaderValue {
    fn push(&mut self, value: String) {
        match self {
            HeaderValue::Single(first) => {
                let first = std::mem::take(first);
                *self = HeaderValue::Multiple(vec![first, value]);
            }
            HeaderValue::Multiple(values) => values.push(value),
        }
    }

    /// All values in arrival order
    pub fn values(&self) -> &[String] {
        match self {
            HeaderValue::Single(value) => std::slice::from_ref(value),
            HeaderValue::Multiple(values) => values,
        }
    }

    pub fn first(&self) -> &str {
        self.values().first().map(String::as_str).unwrap_or("")
    }

    /// Values joined with `", "`
    pub fn joined(&self) -> String {
        self.values().join(", ")
    }
}

/// Classification of the first line of a head
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: String,
        path: String,
        version: String,
    },
    Response {
        protocol: String,
        version: String,
        status: u16,
        reason: String,
    },
    Malformed,
}

impl StartLine {
    fn parse(line: &str) -> Self {
        if line.starts_with("HTTP/") {
            let line = line.replacen('/', " ", 1);
            let mut parts = line.split(' ').filter(|p| !p.is_empty());
            let protocol = parts.next().unwrap_or("").to_string();
            let version = parts.next().unwrap_or("").to_string();
            let status = parts.next().map(leading_number).unwrap_or(0);
            let reason = parts.collect::<Vec<_>>().join(" ");
            return StartLine::Response {
                protocol,
                version,
                status: u16::try_from(status).unwrap_or(0),
                reason,
            };
        }

        match line.find(" HTTP/") {
            Some(pos) if pos > 0 => {
                let (method, path) = line[..pos].split_once(' ').unwrap_or((&line[..pos], ""));
                StartLine::Request {
                    method: method.to_string(),
                    path: path.trim_start().to_string(),
                    version: line[pos + 6..].to_string(),
                }
            }
            _ => StartLine::Malformed,
        }
    }
}

/// Output lines sharing one lowercased header name
#[derive(Debug, Clone)]
struct LineGroup {
    key: Option<String>,
    lines: Vec<String>,
}

/// One parsed request or response head
#[derive(Debug, Clone)]
pub struct ParsedHead {
    start: StartLine,
    headers: HashMap<String, HeaderValue>,
    groups: Vec<LineGroup>,
    body: Vec<u8>,
}

impl ParsedHead {
    /// Parse the head at the front of `buf`.
    ///
    /// Returns `None` until the buffer holds a complete head.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let end = find_head_end(buf)?;
        let text = latin1_decode(&buf[..end]);
        let mut lines = text.split(LINE_SEPARATOR);
        let first = lines.next().unwrap_or("");

        let mut head = Self {
            start: StartLine::parse(first),
            headers: HashMap::new(),
            groups: vec![LineGroup {
                key: None,
                lines: vec![first.to_string()],
            }],
            body: buf[end + HEAD_TERMINATOR.len()..].to_vec(),
        };

        for line in lines {
            match line.find(':') {
                Some(pos) if pos > 0 => {
                    let value = &line[pos + 1..];
                    let value = value
                        .strip_prefix(|c: char| c.is_whitespace())
                        .unwrap_or(value);
                    head.ingest(&line[..pos], value);
                }
                _ => head.groups.push(LineGroup {
                    key: None,
                    lines: vec![line.to_string()],
                }),
            }
        }

        head.synthesize();
        Some(head)
    }

    fn ingest(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        if DROPPED.contains(&key.as_str()) {
            return;
        }

        match self.headers.get_mut(&key) {
            Some(existing) => existing.push(value.to_string()),
            None => {
                self.headers
                    .insert(key.clone(), HeaderValue::Single(value.to_string()));
            }
        }

        let regenerated = match self.start {
            StartLine::Response { .. } => RESPONSE_REGENERATED.contains(&key.as_str()),
            StartLine::Request { .. } => REQUEST_REGENERATED.contains(&key.as_str()),
            StartLine::Malformed => false,
        };
        if regenerated {
            return;
        }

        let line = format!("{}: {}", name, value);
        match self.group_mut(&key) {
            Some(group) => group.lines.push(line),
            None => self.groups.push(LineGroup {
                key: Some(key),
                lines: vec![line],
            }),
        }
    }

    fn synthesize(&mut self) {
        let start = self.start.clone();
        match &start {
            StartLine::Response { version, .. } => {
                let version = if version.is_empty() { "1.0" } else { version.as_str() };
                let via = format!("{} {}", version, VIA_TOKEN);
                self.set_line("date", "Date", &http_date());
                self.set_line("via", "Via", &via);
            }
            StartLine::Request { .. } => {
                if !self.headers.contains_key("x-forwarded-host") {
                    if let Some(host) = self.headers.get("host").cloned() {
                        self.headers.insert("x-forwarded-host".to_string(), host);
                    }
                }

                if self.accepts_gzip() {
                    self.set_line("accept-encoding", "Accept-Encoding", "gzip");
                }

                if let Some(forwarded_host) = self.headers.get("x-forwarded-host").map(HeaderValue::joined) {
                    self.set_line("x-forwarded-host", "X-Forwarded-Host", &forwarded_host);
                }
            }
            StartLine::Malformed => {}
        }
    }

    fn group_mut(&mut self, key: &str) -> Option<&mut LineGroup> {
        self.groups
            .iter_mut()
            .find(|g| g.key.as_deref() == Some(key))
    }

    /// Replace every output line under `key` with a single `name: value` line
    fn set_line(&mut self, key: &str, name: &str, value: &str) {
        let line = format!("{}: {}", name, value);
        match self.group_mut(key) {
            Some(group) => group.lines = vec![line],
            None => self.groups.push(LineGroup {
                key: Some(key.to_string()),
                lines: vec![line],
            }),
        }
    }

    /// Add header lines, honouring the forwarding rules for requests and the
    /// system-owned `Date`/`Via` lines for responses.
    pub fn append(&mut self, fields: &[(&str, &str)]) -> &mut Self {
        match self.start {
            StartLine::Response { .. } => {
                for (name, value) in fields {
                    let key = name.to_ascii_lowercase();
                    if key != "date" && key != "via" {
                        self.set_line(&key, name, value);
                    }
                }
            }
            StartLine::Request { .. } => {
                if let Some(value) = field(fields, "x-forwarded-for").filter(|v| !v.is_empty()) {
                    let mut chain: Vec<String> = self
                        .headers
                        .get("x-forwarded-for")
                        .map(|v| v.values().iter().filter(|s| !s.is_empty()).cloned().collect())
                        .unwrap_or_default();
                    chain.push(value.to_string());
                    let joined = chain.join(", ");

                    self.headers
                        .insert("x-forwarded-for".to_string(), HeaderValue::Single(joined.clone()));
                    self.set_line("x-forwarded-for", "X-Forwarded-For", &joined);
                }

                if let Some(value) = field(fields, "x-forwarded-proto").filter(|v| !v.is_empty()) {
                    let recorded = self
                        .headers
                        .get("x-forwarded-proto")
                        .is_some_and(|v| !v.first().is_empty());
                    if !recorded {
                        self.headers
                            .insert("x-forwarded-proto".to_string(), HeaderValue::Single(value.to_string()));
                    }

                    let proto = self
                        .headers
                        .get("x-forwarded-proto")
                        .map(|v| v.first().to_string())
                        .filter(|v| !v.is_empty())
                        .unwrap_or_else(|| "http".to_string());
                    self.set_line("x-forwarded-proto", "X-Forwarded-Proto", &proto);
                }

                for (name, value) in fields {
                    let key = name.to_ascii_lowercase();
                    if !REQUEST_PROTECTED.contains(&key.as_str()) {
                        self.set_line(&key, name, value);
                    }
                }
            }
            StartLine::Malformed => {}
        }
        self
    }

    /// Drop header line-groups by name
    pub fn remove(&mut self, names: &[&str]) -> &mut Self {
        let keys: Vec<String> = names.iter().map(|n| n.to_ascii_lowercase()).collect();
        self.groups
            .retain(|g| g.key.as_ref().map_or(true, |k| !keys.contains(k)));
        self
    }

    /// Serialize the head and the body remainder for transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        let lines: Vec<&str> = self
            .groups
            .iter()
            .flat_map(|g| g.lines.iter().map(String::as_str))
            .collect();

        let mut out = latin1_encode(&lines.join(LINE_SEPARATOR));
        out.extend_from_slice(HEAD_TERMINATOR);
        out.extend_from_slice(&self.body);
        out
    }

    pub fn start(&self) -> &StartLine {
        &self.start
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start, StartLine::Response { .. })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method.as_str()),
            _ => None,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { path, .. } => Some(path.as_str()),
            _ => None,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { version, .. } | StartLine::Response { version, .. } => Some(version.as_str()),
            StartLine::Malformed => None,
        }
    }

    /// Numeric status of a response; 0 when non-numeric
    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Host the request is addressed to (`X-Forwarded-Host`, defaulted from `Host`)
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get("x-forwarded-host")
            .map(HeaderValue::first)
            .filter(|h| !h.is_empty())
    }

    /// Recorded value for a header name, looked up case-insensitively
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    pub fn accepts_gzip(&self) -> bool {
        self.headers
            .get("accept-encoding")
            .is_some_and(|v| v.joined().to_ascii_lowercase().contains("gzip"))
    }

    /// Bytes that followed the head in the parsed buffer
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

fn field<'a>(fields: &[(&str, &'a str)], key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| *value)
}

/// Offset of the head terminator in `buf`
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}

/// Leading decimal digits of `s` as a number, 0 when there are none.
///
/// Values too large for `u64` saturate at `u64::MAX`.
pub fn leading_number(s: &str) -> u64 {
    s.trim_start()
        .bytes()
        .take_while(u8::is_ascii_digit)
        .try_fold(0u64, |acc, digit| {
            acc.checked_mul(10)?.checked_add(u64::from(digit - b'0'))
        })
        .unwrap_or(u64::MAX)
}

fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn latin1_encode(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(head: &ParsedHead) -> String {
        latin1_decode(&head.to_bytes())
    }

    #[test]
    fn test_incomplete_head_is_none() {
        assert!(ParsedHead::parse(b"GET / HTTP/1.1\r\nHost: a").is_none());
        assert!(ParsedHead::parse(b"").is_none());
    }

    #[test]
    fn test_parse_request_line() {
        let head = ParsedHead::parse(b"GET /index.html?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert!(head.is_request());
        assert_eq!(head.method(), Some("GET"));
        assert_eq!(head.path(), Some("/index.html?q=1"));
        assert_eq!(head.version(), Some("1.1"));
        assert_eq!(head.host(), Some("example.com"));
        assert_eq!(head.status(), None);
    }

    #[test]
    fn test_parse_response_line() {
        let head = ParsedHead::parse(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert!(head.is_response());
        assert_eq!(head.status(), Some(404));
        assert_eq!(head.version(), Some("1.1"));
        assert_eq!(
            head.start(),
            &StartLine::Response {
                protocol: "HTTP".to_string(),
                version: "1.1".to_string(),
                status: 404,
                reason: "Not Found".to_string(),
            }
        );
    }

    #[test]
    fn test_non_numeric_status_is_zero() {
        let head = ParsedHead::parse(b"HTTP/1.0 abc Weird\r\n\r\n").unwrap();
        assert_eq!(head.status(), Some(0));
    }

    #[test]
    fn test_malformed_start_line() {
        let head = ParsedHead::parse(b"hello there\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(head.start(), &StartLine::Malformed);
        assert_eq!(head.method(), None);
        assert_eq!(head.path(), None);
    }

    #[test]
    fn test_request_round_trip() {
        let raw = b"GET /a HTTP/1.1\r\nHost: example.com\r\nUser-Agent: curl\r\n\r\n";
        let head = ParsedHead::parse(raw).unwrap();
        let reparsed = ParsedHead::parse(&head.to_bytes()).unwrap();

        assert_eq!(reparsed.method(), Some("GET"));
        assert_eq!(reparsed.path(), Some("/a"));
        assert_eq!(reparsed.version(), Some("1.1"));
        assert_eq!(reparsed.host(), Some("example.com"));
        assert_eq!(
            text(&head),
            "GET /a HTTP/1.1\r\nHost: example.com\r\nUser-Agent: curl\r\nX-Forwarded-Host: example.com\r\n\r\n"
        );
    }

    #[test]
    fn test_forwarding_headers_regenerated_regardless_of_case() {
        let lower = ParsedHead::parse(
            b"GET / HTTP/1.1\r\nhost: a.com\r\naccept-encoding: br, GZIP\r\nx-forwarded-host: b.com\r\n\r\n",
        )
        .unwrap();
        let upper = ParsedHead::parse(
            b"GET / HTTP/1.1\r\nHOST: a.com\r\nACCEPT-ENCODING: br, GZIP\r\nX-FORWARDED-HOST: b.com\r\n\r\n",
        )
        .unwrap();

        for head in [&lower, &upper] {
            let out = text(head);
            assert!(out.contains("\r\nAccept-Encoding: gzip\r\n"));
            assert!(out.contains("\r\nX-Forwarded-Host: b.com"));
            assert!(!out.to_ascii_lowercase().contains("br, gzip"));
            assert_eq!(head.host(), Some("b.com"));
            assert!(head.accepts_gzip());
        }
    }

    #[test]
    fn test_accept_encoding_without_gzip_is_dropped() {
        let head = ParsedHead::parse(b"GET / HTTP/1.1\r\nHost: a\r\nAccept-Encoding: br\r\n\r\n").unwrap();
        assert!(!head.accepts_gzip());
        assert!(!text(&head).contains("Accept-Encoding"));
        assert_eq!(head.header("accept-encoding").unwrap().first(), "br");
    }

    #[test]
    fn test_dropped_headers() {
        let head = ParsedHead::parse(
            b"GET / HTTP/1.1\r\nHost: a\r\nProxy: evil\r\nUpgrade-Insecure-Requests: 1\r\n\r\n",
        )
        .unwrap();
        let out = text(&head);
        assert!(!out.contains("Proxy"));
        assert!(!out.contains("Upgrade-Insecure-Requests"));
        assert!(head.header("proxy").is_none());
        assert!(head.header("upgrade-insecure-requests").is_none());
    }

    #[test]
    fn test_multi_valued_headers() {
        let head = ParsedHead::parse(
            b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nContent-Type: text/html\r\nSet-Cookie: b=2\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            head.header("set-cookie"),
            Some(&HeaderValue::Multiple(vec!["a=1".to_string(), "b=2".to_string()]))
        );
        assert_eq!(head.header("Content-Type"), Some(&HeaderValue::Single("text/html".to_string())));

        let out = text(&head);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nContent-Type: text/html\r\n"));
    }

    #[test]
    fn test_response_regenerates_date_and_via() {
        let head = ParsedHead::parse(
            b"HTTP/1.1 200 OK\r\nDate: yesterday\r\nVia: 1.1 other\r\nCache-Control: no-store\r\n\r\nbody",
        )
        .unwrap();
        let out = text(&head);
        assert!(!out.contains("yesterday"));
        assert!(!out.contains("other"));
        assert!(!out.contains("Cache-Control"));
        assert!(out.contains("\r\nDate: "));
        assert!(out.contains(" GMT\r\n"));
        assert!(out.contains("\r\nVia: 1.1 dockgate\r\n\r\nbody"));
        assert_eq!(head.header("cache-control").unwrap().first(), "no-store");
    }

    #[test]
    fn test_response_append_skips_system_headers() {
        let mut head = ParsedHead::parse(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        head.append(&[("Cache-Control", "public, max-age=120"), ("Via", "spoofed"), ("date", "never")]);
        let out = text(&head);
        assert!(out.contains("\r\nCache-Control: public, max-age=120\r\n"));
        assert!(!out.contains("spoofed"));
        assert!(!out.contains("never"));
    }

    #[test]
    fn test_forwarded_for_is_joined() {
        let mut head = ParsedHead::parse(
            b"GET / HTTP/1.1\r\nHost: a\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n",
        )
        .unwrap();
        head.append(&[("X-Forwarded-For", "192.168.1.9")]);
        assert!(text(&head).contains("\r\nX-Forwarded-For: 10.0.0.1, 192.168.1.9\r\n"));
        assert_eq!(head.header("x-forwarded-for").unwrap().first(), "10.0.0.1, 192.168.1.9");
    }

    #[test]
    fn test_forwarded_for_without_prior_value() {
        let mut head = ParsedHead::parse(b"GET / HTTP/1.1\r\nHost: a\r\nX-Forwarded-For:\r\n\r\n").unwrap();
        head.append(&[("X-Forwarded-For", "192.168.1.9")]);
        let out = text(&head);
        assert!(out.contains("\r\nX-Forwarded-For: 192.168.1.9\r\n"));
        assert_eq!(out.matches("X-Forwarded-For").count(), 1);
    }

    #[test]
    fn test_forwarded_proto_keeps_recorded_value() {
        let mut head = ParsedHead::parse(
            b"GET / HTTP/1.1\r\nHost: a\r\nX-Forwarded-Proto: https\r\n\r\n",
        )
        .unwrap();
        head.append(&[("X-Forwarded-Proto", "http")]);
        assert!(text(&head).contains("\r\nX-Forwarded-Proto: https\r\n"));

        let mut head = ParsedHead::parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        head.append(&[("X-Forwarded-Proto", "https")]);
        assert!(text(&head).contains("\r\nX-Forwarded-Proto: https\r\n"));
    }

    #[test]
    fn test_request_append_protects_host() {
        let mut head = ParsedHead::parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        head.append(&[("Host", "b"), ("X-Forwarded-Host", "c"), ("X-Request-Id", "42")]);
        let out = text(&head);
        assert!(out.contains("\r\nHost: a\r\n"));
        assert!(!out.contains("Host: b"));
        assert!(!out.contains("X-Forwarded-Host: c"));
        assert!(out.contains("\r\nX-Request-Id: 42\r\n"));
    }

    #[test]
    fn test_append_replaces_group_in_place() {
        let mut head = ParsedHead::parse(
            b"HTTP/1.1 200 OK\r\nX-A: 1\r\nX-B: 2\r\nX-A: 3\r\n\r\n",
        )
        .unwrap();
        head.append(&[("X-A", "9")]);
        let out = text(&head);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\nX-A: 9\r\nX-B: 2\r\n"));
    }

    #[test]
    fn test_remove_line_groups() {
        let mut head = ParsedHead::parse(
            b"HTTP/1.1 200 OK\r\nX-Powered-By: php\r\nx-powered-by: again\r\nServer: nginx\r\n\r\n",
        )
        .unwrap();
        head.remove(&["X-Powered-By"]);
        let out = text(&head);
        assert!(!out.to_ascii_lowercase().contains("x-powered-by"));
        assert!(out.contains("Server: nginx"));
    }

    #[test]
    fn test_body_remainder_is_preserved_bytewise() {
        let mut raw = b"POST /up HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\n".to_vec();
        raw.extend_from_slice(&[0xff, 0x00, 0xe9, 0x80]);
        let head = ParsedHead::parse(&raw).unwrap();
        assert_eq!(head.body(), &[0xff, 0x00, 0xe9, 0x80]);
        assert!(head.to_bytes().ends_with(&[b'\r', b'\n', b'\r', b'\n', 0xff, 0x00, 0xe9, 0x80]));
    }

    #[test]
    fn test_latin1_header_values_survive() {
        let raw = b"HTTP/1.1 200 OK\r\nX-Name: caf\xe9\r\n\r\n";
        let head = ParsedHead::parse(raw).unwrap();
        let out = head.to_bytes();
        assert!(out.windows(10).any(|w| w == b"X-Name: ca"));
        assert!(out.contains(&0xe9));
    }

    #[test]
    fn test_leading_number() {
        assert_eq!(leading_number("120"), 120);
        assert_eq!(leading_number(" 42abc"), 42);
        assert_eq!(leading_number("abc"), 0);
        assert_eq!(leading_number(""), 0);
        assert_eq!(leading_number("18446744073709551615"), u64::MAX);
        assert_eq!(leading_number("99999999999999999999"), u64::MAX);
    }
}
