//! Test helpers: a tiny HTTP responder and a listener that never answers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

pub struct HttpStub {
    pub port: u16,
    log: Arc<Mutex<Vec<RecordedRequest>>>,
    down: Arc<AtomicBool>,
    server: tokio::task::AbortHandle,
}

impl HttpStub {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// "METHOD /path" for every request received so far.
    pub fn requests(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|req| format!("{} {}", req.method, req.path))
            .collect()
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.log.lock().unwrap().clone()
    }

    /// A switch that takes the server down. Connections that are already
    /// queued get closed without an answer.
    pub fn shutdown_switch(&self) -> impl Fn() + Send + Sync + 'static {
        let down = Arc::clone(&self.down);
        let server = self.server.clone();
        move || {
            down.store(true, Ordering::SeqCst);
            server.abort();
        }
    }
}

/// Serves `handler(method, path) -> (status, body)` on an ephemeral port.
pub async fn spawn_http_stub<F>(handler: F) -> HttpStub
where
    F: Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(handler);
    let accept_log = Arc::clone(&log);
    let down = Arc::new(AtomicBool::new(false));
    let accept_down = Arc::clone(&down);
    let server = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            if accept_down.load(Ordering::SeqCst) {
                break;
            }
            let handler = Arc::clone(&handler);
            let log = Arc::clone(&accept_log);
            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                let (status, body) = handler(&request.method, &request.path);
                log.lock().unwrap().push(request);
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason(status),
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    HttpStub {
        port,
        log,
        down,
        server: server.abort_handle(),
    }
}

/// Accepts connections and holds them open without ever replying.
pub async fn spawn_silent_listener() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    port
}

async fn read_request(socket: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find(&buffer, b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buffer.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    let body_end = buffer.len().min(header_end + content_length);
    let body = String::from_utf8_lossy(&buffer[header_end..body_end]).to_string();
    Some(RecordedRequest { method, path, body })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}
