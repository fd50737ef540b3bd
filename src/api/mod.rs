use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::pipeline::{PipelineCloser, SnapshotCell};
use crate::storage::{review_entries, EventSink};

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_EVENTS_LIMIT: usize = 1000;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Upper bound on `/events` rows; `?limit=N` may lower it.
    pub events_limit: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8790".to_string(),
            events_limit: DEFAULT_EVENTS_LIMIT,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Read-only view of the pipeline plus a close switch, served on loopback.
///
/// - `GET /health`
/// - `GET /state`: latest snapshot as JSON
/// - `GET /frame.jpg`: latest rendered overlay
/// - `GET /events[?limit=N]`: the newest persisted alerts, oldest first, numbered from 1
/// - `POST /close`: request pipeline shutdown
pub struct ApiServer {
    cfg: ApiConfig,
    snapshots: Arc<SnapshotCell>,
    events: Box<dyn EventSink>,
    closer: Option<PipelineCloser>,
}

struct ApiContext {
    cfg: ApiConfig,
    snapshots: Arc<SnapshotCell>,
    events: Box<dyn EventSink>,
    closer: Option<PipelineCloser>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, snapshots: Arc<SnapshotCell>, events: Box<dyn EventSink>) -> Self {
        Self {
            cfg,
            snapshots,
            events,
            closer: None,
        }
    }

    pub fn with_closer(mut self, closer: PipelineCloser) -> Self {
        self.closer = Some(closer);
        self
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        if !configured_addr.ip().is_loopback() {
            return Err(anyhow!(
                "api must bind a loopback address, got '{}'",
                configured_addr
            ));
        }
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let mut ctx = ApiContext {
            cfg: self.cfg,
            snapshots: self.snapshots,
            events: self.events,
            closer: self.closer,
        };
        let join = std::thread::Builder::new()
            .name("proximity-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &mut ctx, shutdown_thread) {
                    log::error!("proximity api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, ctx: &mut ApiContext, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, ctx) {
                    log::warn!("proximity api request rejected: {}", err);
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

fn handle_connection(mut stream: TcpStream, ctx: &mut ApiContext) -> Result<()> {
    // Accepted sockets may inherit non-blocking mode on some platforms.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    if !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("GET", "/state") => match ctx.snapshots.latest() {
            Some(snapshot) => {
                let payload = serde_json::to_vec(&*snapshot)?;
                write_response(&mut stream, 200, "application/json", &payload)
            }
            None => write_json_response(&mut stream, 503, r#"{"error":"no_frame_yet"}"#),
        },
        ("GET", "/frame.jpg") => {
            match ctx.snapshots.latest().as_ref().and_then(|s| s.jpeg.as_ref()) {
                Some(jpeg) => write_response(&mut stream, 200, "image/jpeg", jpeg),
                None => write_json_response(&mut stream, 503, r#"{"error":"no_frame_yet"}"#),
            }
        }
        ("GET", "/events") => {
            let limit = match request.query_limit() {
                Ok(limit) => limit.unwrap_or(ctx.cfg.events_limit).min(ctx.cfg.events_limit),
                Err(_) => {
                    return write_json_response(&mut stream, 400, r#"{"error":"invalid_limit"}"#);
                }
            };
            let events = ctx.events.read_events(limit)?;
            let payload = serde_json::to_vec(&review_entries(events))?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        ("POST", "/close") => match &ctx.closer {
            Some(closer) => {
                log::info!("close requested via api");
                closer.close();
                write_json_response(&mut stream, 202, r#"{"status":"closing"}"#)
            }
            None => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
        },
        (_, "/health" | "/state" | "/frame.jpg" | "/events" | "/close") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
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
    let request_line = text.split("\r\n").next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = raw_path.split_once('?').unwrap_or((raw_path, ""));
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query: query.to_string(),
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        202 => "HTTP/1.1 202 Accepted",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: String,
}

impl HttpRequest {
    fn query_limit(&self) -> Result<Option<usize>> {
        for pair in self.query.split('&') {
            if let Some(("limit", value)) = pair.split_once('=') {
                return Ok(Some(value.parse()?));
            }
        }
        Ok(None)
    }
}
