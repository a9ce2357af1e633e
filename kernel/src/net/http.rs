//! HTTP/1.0 Client
//!
//! URL parsing, response parsing and a plain-TCP GET. The HTTPS wrapper in
//! [`super::https`] reuses the same request and response handling.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::{debug, info, warn};

use super::https::Resolver;
use super::socket::{TcpStream, Transport};
use super::tcp::TcpStack;
use super::IpLayer;
use crate::time::Clock;
use crate::util::{KError, KResult};

pub const USER_AGENT: &str = "StenzelOS/1.0";

/// Teto de resposta lida de um socket
pub const MAX_RESPONSE: usize = 1024 * 1024;

/// Timeout de leitura do HTTP em texto claro
pub const RECV_TIMEOUT_MS: u32 = 5000;

/// URL Scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// HTTP Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Resposta sem cabeçalho: tudo vira corpo.
    fn headerless(body: Vec<u8>) -> Self {
        Self { status_code: 0, status_text: String::new(), headers: Vec::new(), body }
    }

    /// Get a header value by name (case-insensitive)
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Get Content-Length header
    pub fn content_length(&self) -> Option<usize> {
        self.get_header("Content-Length").and_then(|s| s.parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get_header("Content-Type")
    }

    /// Get body as string (assuming UTF-8)
    pub fn body_as_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Parsed URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Url {
    /// Parse a URL string. A missing scheme means `http`.
    pub fn parse(url: &str) -> KResult<Self> {
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else if let Some(rest) = url.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if url.contains("://") {
            return Err(KError::NotSupported);
        } else {
            (Scheme::Http, url)
        };

        // Parse host and port
        let (host_port, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = match host_port.rfind(':') {
            Some(idx) => {
                let port = host_port[idx + 1..].parse().map_err(|_| KError::Invalid)?;
                (&host_port[..idx], port)
            }
            None => (host_port, scheme.default_port()),
        };
        if host.is_empty() || port == 0 {
            return Err(KError::Invalid);
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

/// Cabeçalho de um GET HTTP/1.0 com `Connection: close`.
pub fn build_get_request(host: &str, path: &str) -> String {
    format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\nUser-Agent: {}\r\n\r\n",
        path, host, USER_AGENT
    )
}

/// Find the end of HTTP headers (\r\n\r\n)
pub(crate) fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse a full response. Bytes with no header terminator are returned as the body.
pub fn parse_response(data: &[u8]) -> KResult<HttpResponse> {
    let Some(end) = find_header_end(data) else {
        return Ok(HttpResponse::headerless(data.to_vec()));
    };
    let (status_code, status_text, headers) = parse_headers(&data[..end])?;
    Ok(HttpResponse {
        status_code,
        status_text,
        headers,
        body: data[end + 4..].to_vec(),
    })
}

/// Parse HTTP response headers
fn parse_headers(data: &[u8]) -> KResult<(u16, String, Vec<(String, String)>)> {
    let text = core::str::from_utf8(data).map_err(|_| KError::Protocol)?;
    let mut lines = text.split("\r\n");

    // Parse status line: HTTP/1.1 200 OK
    let status_line = lines.next().ok_or(KError::Protocol)?;
    let mut parts = status_line.splitn(3, ' ');

    let version = parts.next().ok_or(KError::Protocol)?;
    if !version.starts_with("HTTP/") {
        return Err(KError::Protocol);
    }
    let status_code: u16 = parts
        .next()
        .ok_or(KError::Protocol)?
        .parse()
        .map_err(|_| KError::Protocol)?;
    let status_text = parts.next().unwrap_or("").trim().to_string();

    // Parse headers
    let mut headers = Vec::new();
    for line in lines {
        if let Some(idx) = line.find(':') {
            let name = line[..idx].trim().to_string();
            let value = line[idx + 1..].trim().to_string();
            headers.push((name, value));
        }
    }

    Ok((status_code, status_text, headers))
}

/// Lê até EOF, erro ou o teto de resposta.
pub(crate) fn read_to_end<T: Transport + ?Sized>(stream: &mut T, timeout_ms: u32) -> KResult<Vec<u8>> {
    let mut response = Vec::new();
    let mut buf = [0u8; 2048];
    while response.len() < MAX_RESPONSE {
        match stream.recv(&mut buf, timeout_ms) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(KError::Timeout) if !response.is_empty() => {
                debug!("http: read timed out after {} bytes", response.len());
                break;
            }
            Err(e) => return Err(e),
        }
    }
    response.truncate(MAX_RESPONSE);
    Ok(response)
}

/// Perform a simple HTTP GET request over plain TCP
pub fn http_get<I: IpLayer, C: Clock>(
    stack: &mut TcpStack<I, C>,
    resolver: &dyn Resolver,
    url: &str,
) -> KResult<HttpResponse> {
    let url = Url::parse(url)?;
    if url.scheme != Scheme::Http {
        return Err(KError::NotSupported);
    }

    let ip = resolver.resolve(&url.host).map_err(|e| {
        warn!("http: dns resolve failed for '{}'", url.host);
        e
    })?;

    let mut stream = TcpStream::connect(stack, ip, url.port).map_err(|e| {
        warn!("http: tcp connect failed to {}:{}: {}", ip, url.port, e);
        e
    })?;

    let request = build_get_request(&url.host, &url.path);
    stream.send(request.as_bytes())?;
    let raw = read_to_end(&mut stream, RECV_TIMEOUT_MS)?;
    if let Err(e) = stream.close() {
        debug!("http: close failed: {}", e);
    }

    if raw.is_empty() {
        warn!("http: empty response from {}", url.host);
        return Err(KError::Protocol);
    }
    let response = parse_response(&raw)?;
    info!("http: {} {} ({} bytes)", response.status_code, url.host, response.body.len());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetConfig;
    use crate::testutil::{HttpApp, LoopbackPeer, ManualClock, StaticResolver, CLIENT_IP, SERVER_IP};
    use alloc::vec;

    #[test]
    fn parse_url_variants() {
        let url = Url::parse("http://example.com/index.html").unwrap();
        assert_eq!(url.scheme, Scheme::Http);
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/index.html");

        let url = Url::parse("https://example.com:8443").unwrap();
        assert_eq!(url.scheme, Scheme::Https);
        assert_eq!(url.port, 8443);
        assert_eq!(url.path, "/");

        assert_eq!(Url::parse("https://other.example/x").unwrap().port, 443);
        assert_eq!(Url::parse("example.com/a/b").unwrap().path, "/a/b");
        assert_eq!(Url::parse("ftp://example.com/"), Err(KError::NotSupported));
        assert_eq!(Url::parse("http://:80/"), Err(KError::Invalid));
        assert_eq!(Url::parse("http://host:abc/"), Err(KError::Invalid));
    }

    #[test]
    fn parse_response_splits_head_and_body() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\ncontent-length: 5\r\n\r\nnope!";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status_code, 404);
        assert_eq!(resp.status_text, "Not Found");
        assert_eq!(resp.content_type(), Some("text/plain"));
        assert_eq!(resp.content_length(), Some(5));
        assert_eq!(resp.get_header("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(resp.body_as_string(), "nope!");
    }

    #[test]
    fn headerless_response_is_all_body() {
        let resp = parse_response(b"just bytes").unwrap();
        assert_eq!(resp.status_code, 0);
        assert!(resp.headers.is_empty());
        assert_eq!(resp.body, b"just bytes");
    }

    #[test]
    fn malformed_status_line_is_rejected() {
        assert_eq!(parse_response(b"HTTP/1.0 abc\r\n\r\n"), Err(KError::Protocol));
        assert_eq!(parse_response(b"SPDY 200 OK\r\n\r\n"), Err(KError::Protocol));
    }

    #[test]
    fn request_head_layout() {
        assert_eq!(
            build_get_request("example.com", "/x"),
            "GET /x HTTP/1.0\r\nHost: example.com\r\nConnection: close\r\nUser-Agent: StenzelOS/1.0\r\n\r\n"
        );
    }

    #[test]
    fn http_get_over_loopback_tcp() {
        let clock = ManualClock::new(0);
        let mut peer = LoopbackPeer::new();
        peer.serve(SERVER_IP, 80, || HttpApp::new("HTTP/1.0 200 OK\r\nContent-Type: text/html\r\n\r\n<h1>hi</h1>"));
        let config = NetConfig { ip: CLIENT_IP, ..NetConfig::default() };
        let mut stack = TcpStack::new(config, peer, clock);
        let resolver = StaticResolver(vec![("example.com", SERVER_IP)]);

        let resp = http_get(&mut stack, &resolver, "http://example.com/").unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.content_type(), Some("text/html"));
        assert_eq!(resp.body, b"<h1>hi</h1>");

        assert_eq!(http_get(&mut stack, &resolver, "http://nowhere.example/"), Err(KError::NotFound));
        assert_eq!(http_get(&mut stack, &resolver, "https://example.com/"), Err(KError::NotSupported));
    }
}
