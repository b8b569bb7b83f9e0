//! Engine status reporting and the `/health` endpoint.
//!
//! Every engine publishes its [`EngineStatus`] through its own watch channel.
//! The engine task is the only writer; the HTTP server reads the latest value
//! of each channel without waiting on the engines.

use chrono::{DateTime, Utc};
use mqbridge_client::{Classify, ErrorClass};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::engine::{EngineKind, EngineState};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Request line and headers together; nothing past this is read.
const MAX_REQUEST_HEAD_BYTES: u64 = 8192;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub name: String,
    pub kind: EngineKind,
    pub state: EngineState,
    pub started_at: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<ErrorReport>,
    pub transferred: u64,
    pub dead_lettered: u64,
    pub restarts: u64,
}

impl EngineStatus {
    fn new(name: String, kind: EngineKind) -> Self {
        Self {
            name,
            kind,
            state: EngineState::Connecting,
            started_at: Utc::now(),
            last_success: None,
            consecutive_failures: 0,
            last_error: None,
            transferred: 0,
            dead_lettered: 0,
            restarts: 0,
        }
    }
}

/// Write side of one engine's status channel.
#[derive(Clone)]
pub struct HealthReporter {
    tx: Arc<watch::Sender<EngineStatus>>,
}

impl HealthReporter {
    pub fn new(name: String, kind: EngineKind) -> (Self, watch::Receiver<EngineStatus>) {
        let (tx, rx) = watch::channel(EngineStatus::new(name, kind));
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn status(&self) -> EngineStatus {
        self.tx.borrow().clone()
    }

    pub fn set_state(&self, state: EngineState) {
        let mut previous = None;
        self.tx.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            previous = Some(status.state);
            status.state = state;
            true
        });

        if let Some(previous) = previous {
            let name = self.tx.borrow().name.clone();
            if state.is_pipeline_step() || previous.is_pipeline_step() {
                debug!("Engine {} {} -> {}", name, previous, state);
            } else {
                info!("Engine {} {} -> {}", name, previous, state);
            }
        }
    }

    /// A unit of work committed. Clears the failure streak.
    pub fn record_success(&self, transferred: usize, dead_lettered: usize) {
        self.tx.send_modify(|status| {
            status.last_success = Some(Utc::now());
            status.consecutive_failures = 0;
            status.transferred += transferred as u64;
            status.dead_lettered += dead_lettered as u64;
        });
    }

    /// Returns the length of the current failure streak.
    pub fn record_failure(&self, error: &(impl Classify + std::fmt::Display)) -> u32 {
        let mut failures = 0;
        self.tx.send_modify(|status| {
            status.consecutive_failures += 1;
            status.last_error = Some(ErrorReport {
                class: error.class(),
                message: error.to_string(),
                at: Utc::now(),
            });
            failures = status.consecutive_failures;
        });
        failures
    }

    pub fn record_restart(&self) {
        self.tx.send_modify(|status| status.restarts += 1);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub engines: Vec<EngineStatus>,
}

/// Read side of every engine's status channel.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    started_at: DateTime<Utc>,
    engines: Vec<watch::Receiver<EngineStatus>>,
}

impl StatusBoard {
    pub fn new(engines: Vec<watch::Receiver<EngineStatus>>) -> Self {
        Self {
            started_at: Utc::now(),
            engines,
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let engines: Vec<EngineStatus> = self
            .engines
            .iter()
            .map(|rx| rx.borrow().clone())
            .collect();
        let now = Utc::now();
        HealthSnapshot {
            healthy: engines.iter().all(|e| e.state != EngineState::Failed),
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            engines,
        }
    }
}

pub struct HealthServer {
    listener: TcpListener,
    board: Arc<StatusBoard>,
}

impl HealthServer {
    pub async fn bind(addr: SocketAddr, board: Arc<StatusBoard>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Health endpoint listening on {}", listener.local_addr()?);
        Ok(Self { listener, board })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves requests until `stop` turns true.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        let board = Arc::clone(&self.board);
                        tokio::spawn(async move {
                            if let Err(err) = handle_request(board, socket).await {
                                debug!("Error serving health request from {}: {}", addr, err);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("Health endpoint stopped");
                        return;
                    }
                }
            }
        }
    }
}

/// Status line and body for a request line such as `GET /health HTTP/1.1`.
fn route(request_line: &str, board: &StatusBoard) -> (&'static str, String) {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();

    match (method, path) {
        ("GET", "/health") => {
            let snapshot = board.snapshot();
            let status = if snapshot.healthy {
                "200 OK"
            } else {
                "503 Service Unavailable"
            };
            let body = serde_json::to_string(&snapshot)
                .unwrap_or_else(|e| format!(r#"{{"error":"{e}"}}"#));
            (status, body)
        }
        (_, "/health") => (
            "405 Method Not Allowed",
            r#"{"error":"method not allowed"}"#.to_string(),
        ),
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    }
}

/// Returns the request line after skipping the headers.
async fn read_request_line<R: AsyncRead + Unpin>(read: R) -> std::io::Result<String> {
    let mut reader = BufReader::new(read).take(MAX_REQUEST_HEAD_BYTES);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
            break;
        }
    }
    Ok(request_line)
}

async fn handle_request(board: Arc<StatusBoard>, socket: TcpStream) -> std::io::Result<()> {
    let (read, mut write) = socket.into_split();
    let request_line = tokio::time::timeout(REQUEST_TIMEOUT, read_request_line(read))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "request timed out"))??;

    let (status, body) = route(request_line.trim(), &board);
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    );
    write.write_all(response.as_bytes()).await?;
    write.shutdown().await?;
    Ok(())
}
