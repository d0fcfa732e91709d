//! Loopback control API.
//!
//! A small blocking HTTP/1.1 server. The accept loop runs on its own thread
//! and every connection is answered on a short-lived worker thread, so a slow
//! manual trigger never holds up `/health`. Routes:
//! - `GET /health`: liveness plus latest-frame age
//! - `GET /status`: full `ProcessorStatus`
//! - `GET /clips/stats`: clip count and most recent ids
//! - `GET /frame/latest`: latest frame as JPEG
//! - `POST /clips/trigger`: manual clip for every active round

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clip::AssemblerControl;
use crate::error::ClipError;
use crate::storage::ClipStore;

/// Bytes read for the request line and headers; bodies are never read.
const MAX_REQUEST_HEAD: u64 = 8192;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Connections answered concurrently; more get `503 busy`.
pub const MAX_IN_FLIGHT: usize = 8;

/// Frames older than this make `/health` report `stale`.
pub const STALE_FRAME_AGE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8790".to_string(),
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
    /// Stop accepting. Requests already being answered finish on their own.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api accept thread panicked"))?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Routes and replies
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Health,
    Status,
    ClipStats,
    LatestFrame,
    Trigger,
}

impl Route {
    /// Route for `method` + `path`, or the error reply for an unknown path or
    /// a known path with the wrong method.
    fn resolve(method: &str, path: &str) -> Result<Route, Reply> {
        let (route, expected) = match path {
            "/health" => (Route::Health, "GET"),
            "/status" => (Route::Status, "GET"),
            "/clips/stats" => (Route::ClipStats, "GET"),
            "/frame/latest" => (Route::LatestFrame, "GET"),
            "/clips/trigger" => (Route::Trigger, "POST"),
            _ => return Err(Reply::error(Status::NotFound, "not_found")),
        };
        if method != expected {
            return Err(Reply::error(Status::MethodNotAllowed, "method_not_allowed"));
        }
        Ok(route)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    Internal,
    Unavailable,
}

impl Status {
    fn line(self) -> &'static str {
        match self {
            Status::Ok => "200 OK",
            Status::BadRequest => "400 Bad Request",
            Status::Forbidden => "403 Forbidden",
            Status::NotFound => "404 Not Found",
            Status::MethodNotAllowed => "405 Method Not Allowed",
            Status::Internal => "500 Internal Server Error",
            Status::Unavailable => "503 Service Unavailable",
        }
    }
}

#[derive(Debug)]
struct Reply {
    status: Status,
    content_type: &'static str,
    body: Vec<u8>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

impl Reply {
    fn json<T: Serialize>(status: Status, body: &T) -> Reply {
        match serde_json::to_vec(body) {
            Ok(body) => Reply {
                status,
                content_type: "application/json",
                body,
            },
            Err(err) => {
                log::warn!("control api response not serializable: {}", err);
                Reply::error(Status::Internal, "serialization_failed")
            }
        }
    }

    fn error(status: Status, code: &'static str) -> Reply {
        Reply::json(status, &ErrorBody { error: code })
    }

    fn jpeg(body: Vec<u8>) -> Reply {
        Reply {
            status: Status::Ok,
            content_type: "image/jpeg",
            body,
        }
    }

    fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        write!(
            out,
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
            self.status.line(),
            self.content_type,
            self.body.len()
        )?;
        out.write_all(&self.body)?;
        out.flush()
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    running: bool,
    frame_age_ms: Option<u128>,
}

// ----------------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------------

pub struct ApiServer {
    cfg: ApiConfig,
    control: AssemblerControl,
    store: Arc<dyn ClipStore>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, control: AssemblerControl, store: Arc<dyn ClipStore>) -> Self {
        Self {
            cfg,
            control,
            store,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let server = Arc::new(self);
        let join = std::thread::Builder::new()
            .name("control-api".to_string())
            .spawn(move || {
                if let Err(err) = accept_loop(listener, server, &shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;
        log::info!("control api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }

    fn answer(&self, route: Route) -> Reply {
        match route {
            Route::Health => self.health(),
            Route::Status => Reply::json(Status::Ok, &self.control.status()),
            Route::ClipStats => match self.store.stats() {
                Ok(stats) => Reply::json(Status::Ok, &stats),
                Err(err) => {
                    log::warn!("clip stats unavailable: {:#}", err);
                    Reply::error(Status::Internal, "stats_unavailable")
                }
            },
            Route::LatestFrame => match self.control.latest_jpeg() {
                Ok(Some(jpeg)) => Reply::jpeg(jpeg),
                Ok(None) => Reply::error(Status::Unavailable, "no_frame_available"),
                Err(err) => {
                    log::warn!("latest frame encode failed: {:#}", err);
                    Reply::error(Status::Internal, "encode_failed")
                }
            },
            Route::Trigger => match self.control.trigger_manual_clip() {
                Ok(summary) => Reply::json(Status::Ok, &summary),
                Err(err) if err.downcast_ref::<ClipError>() == Some(&ClipError::NoFrameAvailable) => {
                    Reply::error(Status::Unavailable, "no_frame_available")
                }
                Err(err) => {
                    log::warn!("manual trigger failed: {:#}", err);
                    Reply::error(Status::Internal, "trigger_failed")
                }
            },
        }
    }

    fn health(&self) -> Reply {
        let status = self.control.status();
        let age = self.control.frame_age();
        let fresh = age.map(|a| a < STALE_FRAME_AGE).unwrap_or(false);
        let label = match (status.running, fresh) {
            (false, _) => "stopped",
            (true, true) => "ok",
            (true, false) => "stale",
        };
        Reply::json(
            Status::Ok,
            &HealthBody {
                status: label,
                running: status.running,
                frame_age_ms: age.map(|a| a.as_millis()),
            },
        )
    }
}

/// Decrements the in-flight count when a connection worker finishes.
struct InFlightSlot(Arc<AtomicUsize>);

impl InFlightSlot {
    fn claim(count: &Arc<AtomicUsize>) -> Option<InFlightSlot> {
        let claimed = count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < MAX_IN_FLIGHT).then_some(n + 1)
            })
            .is_ok();
        claimed.then(|| InFlightSlot(Arc::clone(count)))
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn accept_loop(listener: TcpListener, server: Arc<ApiServer>, shutdown: &AtomicBool) -> Result<()> {
    let in_flight = Arc::new(AtomicUsize::new(0));
    while !shutdown.load(Ordering::SeqCst) {
        let mut stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        // Accepted sockets inherit non-blocking mode on some platforms.
        stream.set_nonblocking(false)?;

        let Some(slot) = InFlightSlot::claim(&in_flight) else {
            log::warn!("control api busy; refusing connection");
            let _ = Reply::error(Status::Unavailable, "busy").write_to(&mut stream);
            continue;
        };
        let worker_server = Arc::clone(&server);
        let spawned = std::thread::Builder::new()
            .name("control-api-conn".to_string())
            .spawn(move || {
                let _slot = slot;
                if let Err(err) = serve_connection(stream, &worker_server) {
                    log::warn!("control api request failed: {}", err);
                }
            });
        if let Err(err) = spawned {
            log::warn!("control api could not spawn a connection worker: {}", err);
        }
    }
    Ok(())
}

fn serve_connection(mut stream: TcpStream, server: &ApiServer) -> Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    let reply = if local.ip().is_loopback() && !peer.ip().is_loopback() {
        Reply::error(Status::Forbidden, "forbidden")
    } else {
        match read_request_target(&stream) {
            Ok((method, path)) => match Route::resolve(&method, &path) {
                Ok(route) => server.answer(route),
                Err(reply) => reply,
            },
            Err(err) => {
                log::debug!("unparseable request from {}: {:#}", peer, err);
                Reply::error(Status::BadRequest, "bad_request")
            }
        }
    };
    reply.write_to(&mut stream)?;
    Ok(())
}

/// Method and query-less path from the request line. Headers are skipped.
fn read_request_target(stream: &TcpStream) -> Result<(String, String)> {
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
    let mut head = BufReader::new(Read::take(stream, MAX_REQUEST_HEAD));
    let mut line = String::new();
    head.read_line(&mut line)?;
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(anyhow!("malformed request line {:?}", line.trim_end()));
    };
    let path = target.split_once('?').map_or(target, |(path, _)| path);
    let request = (method.to_string(), path.to_string());

    let mut header = String::new();
    loop {
        header.clear();
        if head.read_line(&mut header)? == 0 || header.trim_end().is_empty() {
            break;
        }
    }
    Ok(request)
}
