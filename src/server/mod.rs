//! HTTP front end.
//!
//! A plain `TcpListener` accept loop; each connection gets its own thread
//! because stream responses stay open for as long as the client watches.

mod dashboard;

use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::RelayError;
use crate::registry::{ChannelId, ChannelRegistry};
use crate::stream::{ChannelStream, CompositeStream, PartSource, StreamSettings, CONTENT_TYPE};

const MAX_REQUEST_BYTES: usize = 8192;

pub const CONTENT_SECURITY_POLICY: &str = "frame-ancestors 'none' https://*:32000 ;media-src 'none' ; object-src 'none' ; connect-src 'none' ; plugin-src 'none' ; frame-src 'none' ; img-src 'self' https://openlayers.org http://a.tile.openstreetmap.org http://b.tile.openstreetmap.org http://c.tile.openstreetmap.org ;";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    pub stream: StreamSettings,
    /// Public camera view embedded into `/dashboard`.
    pub dashboard: serde_json::Value,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            stream: StreamSettings::default(),
            dashboard: serde_json::json!({"cameras": [], "urls": {}}),
        }
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("http server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct RelayServer {
    cfg: ServerConfig,
    registry: Arc<ChannelRegistry>,
}

struct Shared {
    registry: Arc<ChannelRegistry>,
    stream: StreamSettings,
    dashboard_page: String,
}

impl RelayServer {
    pub fn new(cfg: ServerConfig, registry: Arc<ChannelRegistry>) -> Self {
        Self { cfg, registry }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("http server listening on {}", addr);

        let shared = Arc::new(Shared {
            registry: self.registry,
            stream: self.cfg.stream,
            dashboard_page: dashboard::render(&self.cfg.dashboard),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("http-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_server(listener, shared, shutdown_thread) {
                    log::error!("http server stopped: {}", err);
                }
            })?;

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(listener: TcpListener, shared: Arc<Shared>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                let spawned = std::thread::Builder::new()
                    .name("http-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &shared) {
                            log::debug!("connection from {} ended: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("could not spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum Route {
    Camera(ChannelId),
    /// Malformed or out-of-range camera id.
    UnknownCamera,
    AllStreams,
    Dashboard,
    Health,
    NotFound,
    MethodNotAllowed,
}

pub fn route(method: &str, path: &str, registry: &ChannelRegistry) -> Route {
    if method != "GET" {
        return Route::MethodNotAllowed;
    }
    if let Some(raw) = path.strip_prefix("/camera/") {
        return match registry.parse_id(raw) {
            Some(id) => Route::Camera(id),
            None => Route::UnknownCamera,
        };
    }
    match path {
        "/get_all_streams" => Route::AllStreams,
        "/dashboard" => Route::Dashboard,
        "/health" => Route::Health,
        _ => Route::NotFound,
    }
}

fn handle_connection(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    match route(&request.method, &request.path, &shared.registry) {
        Route::MethodNotAllowed => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        Route::NotFound => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
        Route::Health => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        Route::UnknownCamera => write_response(
            &mut stream,
            401,
            "text/html; charset=utf-8",
            &[],
            b"The URL does not exist",
        ),
        Route::Dashboard => write_response(
            &mut stream,
            200,
            "text/html; charset=utf-8",
            &[
                ("Access-Control-Allow-Origin", "*"),
                (
                    "Strict-Transport-Security",
                    "max-age=31536000; includeSubDomains",
                ),
            ],
            shared.dashboard_page.as_bytes(),
        ),
        Route::Camera(id) => {
            let view = ChannelStream::open(shared.registry.clone(), id, shared.stream.clone())?;
            serve_stream(stream, view)
        }
        Route::AllStreams => {
            let view = CompositeStream::open(shared.registry.clone(), shared.stream.clone())?;
            serve_stream(stream, view)
        }
    }
}

/// Write parts until the client goes away or the view gives up. Dropping the
/// view releases its channels.
fn serve_stream(mut stream: TcpStream, mut view: impl PartSource) -> Result<()> {
    write_stream_header(&mut stream)?;
    loop {
        let part = match view.next_part() {
            Ok(part) => part,
            Err(err) => {
                if let Some(RelayError::ProducerUnreachable { .. }) = err.downcast_ref() {
                    log::error!("{}", err);
                    return Ok(());
                }
                return Err(err);
            }
        };
        if let Err(err) = stream.write_all(&part).and_then(|_| stream.flush()) {
            log::info!("stream client disconnected: {}", err);
            return Ok(());
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        401 => "HTTP/1.1 401 Unauthorized",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", &[], body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    extra: &[(&str, &str)],
    body: &[u8],
) -> Result<()> {
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nContent-Security-Policy: {csp}\r\nConnection: close\r\n",
        status_line = status_line(status),
        content_type = content_type,
        len = body.len(),
        csp = CONTENT_SECURITY_POLICY,
    );
    for (name, value) in extra {
        header.push_str(&format!("{}: {}\r\n", name, value));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

fn write_stream_header(stream: &mut TcpStream) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Security-Policy: {csp}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line(200),
        content_type = CONTENT_TYPE,
        csp = CONTENT_SECURITY_POLICY,
    );
    stream.write_all(header.as_bytes())?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}
