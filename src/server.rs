//! HTTP front end
//!
//! Minimal HTTP/1.1 over a tokio TCP listener. One request per connection,
//! JSON in and out, permissive CORS on every response.

use crate::config::ServerConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::ChatService;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HEADER_BYTES: usize = 16 * 1024;

#[derive(Debug, Deserialize)]
struct AskRequest {
    question: Option<String>,
    session_id: Option<String>,
}

enum ReadOutcome {
    Complete(Vec<u8>),
    TooLarge,
    Empty,
}

/// Bind `config.bind` and serve until the listener fails.
pub async fn serve(service: Arc<ChatService>, config: ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(config.bind.as_str()).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    serve_on(listener, service, config).await
}

pub async fn serve_on(listener: TcpListener, service: Arc<ChatService>, config: ServerConfig) -> Result<()> {
    let config = Arc::new(config);
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("New connection from {}", addr);
        tokio::spawn(handle_connection(stream, service.clone(), config.clone()));
    }
}

async fn handle_connection(mut stream: TcpStream, service: Arc<ChatService>, config: Arc<ServerConfig>) {
    let read = timeout(READ_TIMEOUT, read_request(&mut stream, config.max_body_bytes)).await;

    let response = match read {
        Err(_) => {
            warn!("Request read timeout");
            return;
        }
        Ok(Err(e)) => {
            warn!("Failed to read from stream: {}", e);
            return;
        }
        Ok(Ok(ReadOutcome::Empty)) => return,
        Ok(Ok(ReadOutcome::TooLarge)) => {
            create_response(413, "Payload Too Large", &error_body("request body too large"))
        }
        Ok(Ok(ReadOutcome::Complete(buffer))) => match String::from_utf8(buffer) {
            Ok(request) => handle_request(&service, &request).await,
            Err(_) => create_response(400, "Bad Request", &error_body("request is not valid UTF-8")),
        },
    };

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        warn!("Failed to write response: {}", e);
    }
}

async fn read_request(stream: &mut TcpStream, max_body_bytes: usize) -> std::io::Result<ReadOutcome> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);

        match find_headers_end(&buffer) {
            Some(headers_end) => {
                let head = String::from_utf8_lossy(&buffer[..headers_end]);
                let content_length = extract_content_length(&head).unwrap_or(0);
                if content_length > max_body_bytes {
                    return Ok(ReadOutcome::TooLarge);
                }
                if buffer.len() >= headers_end + content_length {
                    break;
                }
            }
            None if buffer.len() > MAX_HEADER_BYTES => return Ok(ReadOutcome::TooLarge),
            None => {}
        }
    }

    if buffer.is_empty() {
        Ok(ReadOutcome::Empty)
    } else {
        Ok(ReadOutcome::Complete(buffer))
    }
}

/// Offset just past the blank line ending the headers.
fn find_headers_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn extract_content_length(head: &str) -> Option<usize> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Route one raw HTTP request and render the raw response.
pub async fn handle_request(service: &ChatService, request: &str) -> String {
    let (head, body) = request.split_once("\r\n\r\n").unwrap_or((request, ""));
    let request_line = head.lines().next().unwrap_or_default();
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return create_response(400, "Bad Request", &error_body("malformed request line"));
    }

    let method = parts[0];
    let path = parts[1].split('?').next().unwrap_or_default();
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    debug!("Request: {} {}", method, path);

    match (method, path) {
        ("OPTIONS", _) => create_response(204, "No Content", ""),
        ("GET", "/api/health") => create_response(200, "OK", r#"{"status":"ok"}"#),
        ("POST", "/api") => ask(service, body).await,
        ("GET", _) => match session_history_id(path) {
            Some(session_id) => session_history(service, session_id).await,
            None => not_found(),
        },
        _ => not_found(),
    }
}

async fn ask(service: &ChatService, body: &str) -> String {
    let request: AskRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(e) => {
            return create_response(400, "Bad Request", &error_body(&format!("invalid JSON body: {}", e)))
        }
    };
    let Some(question) = request.question else {
        return create_response(400, "Bad Request", &error_body("No question provided"));
    };

    match service.ask(request.session_id.as_deref(), &question).await {
        Ok(reply) => {
            let body = json!({ "answer": reply.answer, "session_id": reply.session_id });
            create_response(200, "OK", &body.to_string())
        }
        Err(e) => {
            let (status, status_text) = status_for(&e);
            if status >= 500 {
                error!("Request failed: {}", e);
            } else {
                debug!("Rejected request: {}", e);
            }
            create_response(status, status_text, &error_body(&e.to_string()))
        }
    }
}

async fn session_history(service: &ChatService, session_id: &str) -> String {
    match service.history(session_id).await {
        Some(turns) => {
            let body = json!({ "session_id": session_id, "turns": turns });
            create_response(200, "OK", &body.to_string())
        }
        None => create_response(404, "Not Found", &error_body("unknown session")),
    }
}

fn session_history_id(path: &str) -> Option<&str> {
    path.strip_prefix("/api/sessions/")?
        .strip_suffix("/history")
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

fn status_for(err: &PipelineError) -> (u16, &'static str) {
    match err {
        e if e.is_client_error() => (400, "Bad Request"),
        PipelineError::Timeout(_) => (504, "Gateway Timeout"),
        _ => (500, "Internal Server Error"),
    }
}

fn not_found() -> String {
    create_response(404, "Not Found", &error_body("not found"))
}

fn error_body(message: &str) -> String {
    json!({ "error": message }).to_string()
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_content_length() {
        let head = "POST /api HTTP/1.1\r\nHost: x\r\ncontent-length: 42\r\n\r\n";
        assert_eq!(extract_content_length(head), Some(42));
        assert_eq!(extract_content_length("GET / HTTP/1.1\r\n\r\n"), None);
    }

    #[test]
    fn test_find_headers_end() {
        assert_eq!(find_headers_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_headers_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn test_session_history_route() {
        assert_eq!(session_history_id("/api/sessions/abc/history"), Some("abc"));
        assert_eq!(session_history_id("/api/sessions//history"), None);
        assert_eq!(session_history_id("/api/sessions/a/b/history"), None);
        assert_eq!(session_history_id("/api/health"), None);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&PipelineError::InvalidRequest("x".into())).0, 400);
        assert_eq!(status_for(&PipelineError::Timeout(5)).0, 504);
        assert_eq!(status_for(&PipelineError::RephraseFailure("x".into())).0, 500);
        assert_eq!(status_for(&PipelineError::MalformedModelOutput("x".into())).0, 500);
    }

    #[test]
    fn test_response_carries_cors_headers() {
        let response = create_response(200, "OK", "{}");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Access-Control-Allow-Origin: *"));
        assert!(response.ends_with("Content-Length: 2\r\n\r\n{}"));
    }
}
