// Minimal HTTP+SSE MCP server for tests, backed by the demo tool handler

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::demo_server;

type Sessions = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Answer,
    RejectHead,
    /// Accepts every POST and never replies on the stream
    Silent,
    /// Ends the event stream as soon as a request is posted
    DropStream,
}

pub struct FakeSseServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl FakeSseServer {
    pub async fn start() -> Self {
        Self::start_with(Mode::Answer).await
    }

    /// Answers `HEAD` with 405 like FastMCP's SSE route does
    pub async fn start_rejecting_head() -> Self {
        Self::start_with(Mode::RejectHead).await
    }

    pub async fn start_silent() -> Self {
        Self::start_with(Mode::Silent).await
    }

    pub async fn start_dropping_stream() -> Self {
        Self::start_with(Mode::DropStream).await
    }

    async fn start_with(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let sessions = Arc::clone(&sessions);
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let _ = handle_connection(socket, sessions, counter, mode).await;
                });
            }
        });

        Self { addr, handle }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn sse_url(&self) -> String {
        format!("http://127.0.0.1:{}/sse", self.addr.port())
    }
}

impl Drop for FakeSseServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    sessions: Sessions,
    counter: Arc<AtomicUsize>,
    mode: Mode,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();
    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let path = target.split('?').next().unwrap_or_default();
    match (method.as_str(), path) {
        ("HEAD", "/sse") if mode != Mode::RejectHead => {
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n")
                .await?;
        }
        ("HEAD", "/sse") => {
            socket
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await?;
        }
        ("GET", "/sse") => {
            let session = counter.fetch_add(1, Ordering::SeqCst).to_string();
            let (tx, mut rx) = mpsc::unbounded_channel();
            sessions.lock().unwrap().insert(session.clone(), tx);

            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\nconnection: close\r\n\r\n")
                .await?;
            socket
                .write_all(
                    format!("event: endpoint\r\ndata: /messages/?session_id={}\r\n\r\n", session)
                        .as_bytes(),
                )
                .await?;
            socket.flush().await?;

            while let Some(message) = rx.recv().await {
                socket
                    .write_all(format!("event: message\r\ndata: {}\r\n\r\n", message).as_bytes())
                    .await?;
                socket.flush().await?;
            }
        }
        ("POST", "/messages/") => {
            let session = target
                .split("session_id=")
                .nth(1)
                .unwrap_or_default()
                .to_string();
            socket
                .write_all(b"HTTP/1.1 202 Accepted\r\ncontent-length: 8\r\nconnection: close\r\n\r\nAccepted")
                .await?;
            socket.flush().await?;

            match mode {
                Mode::Silent => return socket.shutdown().await,
                Mode::DropStream => {
                    // Dropping the sender ends the GET handler's loop
                    sessions.lock().unwrap().remove(&session);
                    return socket.shutdown().await;
                }
                Mode::Answer | Mode::RejectHead => {}
            }

            let line = String::from_utf8_lossy(&body).to_string();
            if let Some(response) = demo_server::handle_line(&line) {
                if let Some(tx) = sessions.lock().unwrap().get(&session) {
                    let _ = tx.send(response);
                }
            }
        }
        _ => {
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await?;
        }
    }

    socket.shutdown().await
}
