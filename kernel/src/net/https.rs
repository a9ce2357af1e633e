//! HTTPS GET over the kernel TCP stack and the TLS 1.2 client.
//!
//! Follows 301/302 redirects to `https://` locations, resolving and
//! connecting afresh for every hop. [`https_get_async`] runs the same request
//! on a spawned kernel task that owns everything it needs.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{debug, info, warn};
use spin::Mutex;

use super::http::{self, build_get_request, find_header_end, parse_response, HttpResponse, Scheme, Url};
use super::socket::TcpStream;
use super::tcp::TcpStack;
use super::tls::TlsConnection;
use super::{IpLayer, Ipv4Addr};
use crate::crypto::CryptoRngCore;
use crate::sync::IrqSafeMutex;
use crate::time::Clock;
use crate::util::{KError, KResult};

/// Redirects seguidos antes de desistir
pub const MAX_REDIRECTS: usize = 5;

/// Resolução de nomes (DNS).
pub trait Resolver {
    fn resolve(&self, host: &str) -> KResult<Ipv4Addr>;
}

/// Criação de tasks do kernel.
pub trait Spawner {
    fn spawn(&self, name: &str, task: Box<dyn FnOnce() + Send + 'static>) -> KResult<()>;
}

/// Uma conexão: resolve, conecta, handshake, GET, lê até o fim.
fn fetch<I, C, R>(
    stack: &mut TcpStack<I, C>,
    resolver: &dyn Resolver,
    rng: &mut R,
    host: &str,
    port: u16,
    path: &str,
) -> KResult<Vec<u8>>
where
    I: IpLayer,
    C: Clock,
    R: CryptoRngCore + ?Sized,
{
    info!("https: resolving {}", host);
    let ip = resolver.resolve(host).map_err(|e| {
        warn!("https: dns resolution failed for {}", host);
        e
    })?;
    info!("https: resolved to {}", ip);

    info!("https: connecting to {}:{}", ip, port);
    let stream = TcpStream::connect(stack, ip, port).map_err(|e| {
        warn!("https: tcp connection to {}:{} failed: {}", ip, port, e);
        e
    })?;

    info!("https: tls handshake with {}", host);
    let mut tls = TlsConnection::connect(stream, &mut *rng, host).map_err(|e| {
        warn!("https: tls handshake with {} failed: {}", host, e);
        e
    })?;
    info!("https: tls established");

    let request = build_get_request(host, path);
    if let Err(e) = tls.send(request.as_bytes()) {
        warn!("https: failed to send request: {}", e);
        return Err(e);
    }

    let mut raw = Vec::new();
    let mut buf = [0u8; 2048];
    while raw.len() < http::MAX_RESPONSE {
        match tls.recv(&mut buf) {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
            // Servidor em keep-alive: o que chegou é a resposta
            Err(KError::Timeout) if !raw.is_empty() => {
                debug!("https: read timed out after {} bytes", raw.len());
                break;
            }
            Err(e) => return Err(e),
        }
    }
    raw.truncate(http::MAX_RESPONSE);

    if let Err(e) = tls.close() {
        debug!("https: close_notify not sent: {}", e);
    }
    if let Err(e) = tls.into_inner().close() {
        debug!("https: tcp close failed: {}", e);
    }

    if raw.is_empty() {
        warn!("https: empty response");
        return Err(KError::Protocol);
    }
    Ok(raw)
}

/// GET `path` from `host:port` over TLS, following https redirects.
pub fn https_get<I, C, R>(
    stack: &mut TcpStack<I, C>,
    resolver: &dyn Resolver,
    rng: &mut R,
    host: &str,
    port: u16,
    path: &str,
) -> KResult<HttpResponse>
where
    I: IpLayer,
    C: Clock,
    R: CryptoRngCore + ?Sized,
{
    let mut host = String::from(host);
    let mut port = port;
    let mut path = String::from(path);

    for _ in 0..=MAX_REDIRECTS {
        let raw = fetch(stack, resolver, rng, &host, port, &path)?;
        if find_header_end(&raw).is_none() {
            debug!("https: response without header, returning {} bytes", raw.len());
            return parse_response(&raw);
        }
        let response = parse_response(&raw)?;
        let status = response.status_code;

        if status == 301 || status == 302 {
            if let Some(location) = response.get_header("Location") {
                info!("https: redirect {} -> {}", status, location);
                let target = match Url::parse(location) {
                    Ok(url) if url.scheme == Scheme::Https => url,
                    _ => {
                        warn!("https: non-https redirect not supported");
                        return Err(KError::NotSupported);
                    }
                };
                host = target.host;
                port = target.port;
                path = target.path;
                continue;
            }
        }

        info!("https: HTTP {}, body {} bytes", status, response.body.len());
        if !(200..400).contains(&status) {
            return Err(KError::HttpStatus);
        }
        return Ok(response);
    }

    warn!("https: more than {} redirects", MAX_REDIRECTS);
    Err(KError::Protocol)
}

/// `https_get` a partir de uma URL `https://`.
pub fn https_get_url<I, C, R>(
    stack: &mut TcpStack<I, C>,
    resolver: &dyn Resolver,
    rng: &mut R,
    url: &str,
) -> KResult<HttpResponse>
where
    I: IpLayer,
    C: Clock,
    R: CryptoRngCore + ?Sized,
{
    let url = Url::parse(url)?;
    if url.scheme != Scheme::Https {
        return Err(KError::NotSupported);
    }
    https_get(stack, resolver, rng, &url.host, url.port, &url.path)
}

/// Pedido entregue por valor à task assíncrona.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpsRequest {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl HttpsRequest {
    pub fn new(host: &str, port: u16, path: &str) -> Self {
        Self { host: String::from(host), port, path: String::from(path) }
    }
}

#[derive(Default)]
struct Completion {
    done: AtomicBool,
    result: IrqSafeMutex<Option<KResult<HttpResponse>>>,
}

/// Handle de um GET assíncrono em andamento.
pub struct AsyncHttps {
    completion: Arc<Completion>,
}

impl AsyncHttps {
    pub fn is_done(&self) -> bool {
        self.completion.done.load(Ordering::Acquire)
    }

    /// Resultado, uma única vez, quando a task terminou.
    pub fn try_take(&self) -> Option<KResult<HttpResponse>> {
        if !self.is_done() {
            return None;
        }
        self.completion.result.lock().take()
    }

    /// Espera (halt entre verificações) até o resultado chegar.
    pub fn wait<C: Clock>(self, clock: &C) -> KResult<HttpResponse> {
        loop {
            if let Some(result) = self.try_take() {
                return result;
            }
            clock.idle();
        }
    }
}

/// Roda `https_get` numa task própria. O pedido, o gerador e o acesso ao
/// stack são movidos para dentro da task.
pub fn https_get_async<S, I, C, R>(
    spawner: &S,
    stack: Arc<Mutex<TcpStack<I, C>>>,
    resolver: Arc<dyn Resolver + Send + Sync>,
    mut rng: R,
    request: HttpsRequest,
) -> KResult<AsyncHttps>
where
    S: Spawner + ?Sized,
    I: IpLayer + Send + 'static,
    C: Clock + Send + 'static,
    R: CryptoRngCore + Send + 'static,
{
    debug!("https: async GET {}:{}{}", request.host, request.port, request.path);
    let completion = Arc::new(Completion::default());
    let slot = completion.clone();

    spawner.spawn(
        "https",
        Box::new(move || {
            let result = {
                let mut stack = stack.lock();
                https_get(&mut *stack, &*resolver, &mut rng, &request.host, request.port, &request.path)
            };
            *slot.result.lock() = Some(result);
            slot.done.store(true, Ordering::Release);
        }),
    )?;
    Ok(AsyncHttps { completion })
}
