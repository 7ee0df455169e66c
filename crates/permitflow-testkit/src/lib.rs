//! Scripted HTTP server and fixtures shared by the agent and CLI tests.

use anyhow::Result;
use serde_json::{Value, json};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: String,
    /// Written one after another with a flush in between.
    pub chunks: Vec<Vec<u8>>,
    pub retry_after: Option<String>,
    pub chunk_delay: Duration,
}

impl MockResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self::text(status, "application/json", &body.to_string())
    }

    pub fn text(status: u16, content_type: &str, body: &str) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            chunks: vec![body.as_bytes().to_vec()],
            retry_after: None,
            chunk_delay: Duration::ZERO,
        }
    }

    /// An event stream delivered in pieces of `chunk_size` bytes.
    pub fn sse(body: &str, chunk_size: usize) -> Self {
        Self {
            status: 200,
            content_type: "text/event-stream".to_string(),
            chunks: split_bytes(body.as_bytes(), chunk_size),
            retry_after: None,
            chunk_delay: Duration::from_millis(1),
        }
    }

    pub fn with_retry_after(mut self, value: &str) -> Self {
        self.retry_after = Some(value.to_string());
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    fn content_length(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

/// Responses served in order for one method and path; the last one repeats.
/// A path ending in `*` matches any request path with that prefix.
#[derive(Debug, Clone)]
pub struct MockRoute {
    pub method: String,
    pub path: String,
    pub responses: Vec<MockResponse>,
}

impl MockRoute {
    pub fn new(method: &str, path: &str, responses: Vec<MockResponse>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            responses,
        }
    }

    fn matches(&self, method: &str, path: &str) -> bool {
        if !self.method.eq_ignore_ascii_case(method) {
            return false;
        }
        match self.path.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => self.path == path,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

impl RecordedRequest {
    pub fn json_body(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }
}

pub struct MockAgentServer {
    base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockAgentServer {
    pub fn start(routes: Vec<MockRoute>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_thread = Arc::clone(&requests);
        let mut scripts: Vec<(MockRoute, usize)> =
            routes.into_iter().map(|route| (route, 0)).collect();
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                if rx.try_recv().is_ok() {
                    break;
                }
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let Ok(request) = consume_http_request(&mut stream) else {
                            continue;
                        };
                        let selected = scripts
                            .iter_mut()
                            .find(|(route, _)| route.matches(&request.method, &request.path))
                            .and_then(|(route, next)| {
                                let picked = route
                                    .responses
                                    .get(*next)
                                    .or_else(|| route.responses.last())
                                    .cloned();
                                *next += 1;
                                picked
                            });
                        if let Ok(mut log) = requests_thread.lock() {
                            log.push(request);
                        }
                        let response = selected.unwrap_or_else(|| {
                            MockResponse::json(404, json!({"detail": "Not Found"}))
                        });
                        let _ = write_response(&mut stream, &response);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });
        Ok(Self {
            base_url: format!("http://{addr}"),
            requests,
            stop_tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn request_count(&self, method: &str, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|req| req.method.eq_ignore_ascii_case(method) && req.path == path)
            .count()
    }
}

impl Drop for MockAgentServer {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Routes for an agent whose session does not exist yet and whose run
/// streams `sse_body`.
pub fn fresh_session_routes(
    app: &str,
    user: &str,
    session: &str,
    sse_body: &str,
    chunk_size: usize,
) -> Vec<MockRoute> {
    let session_path = session_path(app, user, session);
    vec![
        MockRoute::new(
            "GET",
            &session_path,
            vec![MockResponse::json(404, json!({"detail": "Session not found"}))],
        ),
        MockRoute::new(
            "POST",
            &session_path,
            vec![MockResponse::json(200, json!({"id": session}))],
        ),
        MockRoute::new("POST", "/run_sse", vec![MockResponse::sse(sse_body, chunk_size)]),
    ]
}

pub fn session_path(app: &str, user: &str, session: &str) -> String {
    format!("/apps/{app}/users/{user}/sessions/{session}")
}

/// Render payloads as `data: <json>` lines separated by blank lines.
pub fn sse_body(payloads: &[Value]) -> String {
    payloads
        .iter()
        .map(|payload| format!("data: {payload}\n\n"))
        .collect()
}

/// A model event whose single text part carries `text`.
pub fn text_event(text: &str) -> Value {
    json!({
        "author": "permit_agent",
        "content": {"role": "model", "parts": [{"text": text}]},
    })
}

pub fn sample_result(work_order_id: &str) -> Value {
    json!({
        "workOrderId": work_order_id,
        "hazards": [{
            "name": "Hot work near flammables",
            "confidence": 0.92,
            "suggestedControls": ["Fire watch", "Gas test"]
        }],
        "permits": [{
            "permitId": "PERM-HW-0001",
            "type": "Hot Work",
            "status": "Pending",
            "controls": ["Fire watch"],
            "ppe": ["gloves", "face shield"],
            "signOffRoles": ["Supervisor"],
            "validityHours": 8,
            "attachmentsRequired": ["Gas test record"],
            "hazardsLinked": ["Hot work near flammables"]
        }],
        "validations": [{
            "permitId": "PERM-HW-0001",
            "validationStatus": "Pass",
            "checks": [{"check": "gas test", "result": "ok", "details": "recorded"}]
        }],
        "pdfLinks": ["https://example.invalid/permits/PERM-HW-0001.pdf"],
        "runMeta": {"policyVersion": "v2.1", "ragSnapshot": "snap-42"}
    })
}

pub fn sample_work_orders() -> Value {
    json!({
        "workOrders": [
            {
                "workOrderId": "WO-1001",
                "description": "Weld repair on the north tank inlet flange",
                "equipment": "Tank T-12",
                "location": "North Yard",
                "status": "New",
                "assignedTo": "J. Doe",
                "crew": ["welder", "fire watch"],
                "environmentType": "outdoor"
            },
            {
                "workOrderId": "WO-1002",
                "description": "Replace pump seal",
                "equipment": "Pump P-3",
                "location": "Pump House",
                "status": "Completed"
            }
        ]
    })
}

/// Write the sample catalog into `workspace` and return its path.
pub fn write_sample_catalog(workspace: &Path) -> Result<PathBuf> {
    let path = workspace.join("workOrders.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&sample_work_orders())?)?;
    Ok(path)
}

pub fn temp_workspace() -> Result<tempfile::TempDir> {
    Ok(tempfile::tempdir()?)
}

pub fn split_bytes(bytes: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return vec![Vec::new()];
    }
    bytes
        .chunks(chunk_size.max(1))
        .map(<[u8]>::to_vec)
        .collect()
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let status_text = match response.status {
        200 => "OK",
        201 => "Created",
        404 => "Not Found",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Error",
    };
    let mut headers = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text,
        response.content_type,
        response.content_length()
    );
    if let Some(retry_after) = &response.retry_after {
        headers.push_str(&format!("Retry-After: {retry_after}\r\n"));
    }
    headers.push_str("\r\n");
    stream.write_all(headers.as_bytes())?;
    stream.flush()?;
    for chunk in &response.chunks {
        stream.write_all(chunk)?;
        stream.flush()?;
        if !response.chunk_delay.is_zero() {
            thread::sleep(response.chunk_delay);
        }
    }
    Ok(())
}

fn consume_http_request(stream: &mut TcpStream) -> std::io::Result<RecordedRequest> {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];
    let mut header_end = None;
    while header_end.is_none() {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        header_end = find_subsequence(&buffer, b"\r\n\r\n").map(|idx| idx + 4);
        if buffer.len() > 1_048_576 {
            break;
        }
    }
    let header_len = header_end.unwrap_or(buffer.len());
    let head = String::from_utf8_lossy(&buffer[..header_len]).to_string();
    let content_length = parse_content_length(&head);
    let mut body = buffer[header_len..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }

    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    Ok(RecordedRequest {
        method,
        path,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

fn parse_content_length(head: &str) -> usize {
    for line in head.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or_default().trim();
        if key.eq_ignore_ascii_case("content-length")
            && let Some(value) = parts.next()
            && let Ok(parsed) = value.trim().parse::<usize>()
        {
            return parsed;
        }
    }
    0
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_routes_repeat_last_response_and_record_bodies() {
        let server = MockAgentServer::start(vec![MockRoute::new(
            "POST",
            "/echo",
            vec![
                MockResponse::json(503, json!({"detail": "busy"})),
                MockResponse::json(200, json!({"ok": true})),
            ],
        )])
        .expect("server");
        let client = reqwest::blocking::Client::new();
        let url = format!("{}/echo", server.base_url());

        let statuses: Vec<u16> = (0..3)
            .map(|i| {
                client
                    .post(&url)
                    .body(format!("call-{i}"))
                    .send()
                    .expect("send")
                    .status()
                    .as_u16()
            })
            .collect();
        assert_eq!(statuses, vec![503, 200, 200]);
        assert_eq!(server.request_count("POST", "/echo"), 3);
        assert_eq!(server.requests()[1].body, "call-1");

        let missing = client
            .get(format!("{}/nowhere", server.base_url()))
            .send()
            .expect("send");
        assert_eq!(missing.status().as_u16(), 404);
    }

    #[test]
    fn wildcard_routes_match_by_prefix() {
        let server = MockAgentServer::start(vec![MockRoute::new(
            "get",
            "/apps/demo/users/*",
            vec![MockResponse::json(200, json!({}))],
        )])
        .expect("server");
        let status = reqwest::blocking::Client::new()
            .get(format!("{}/apps/demo/users/u1/sessions/s1", server.base_url()))
            .send()
            .expect("send")
            .status();
        assert_eq!(status.as_u16(), 200);
        assert_eq!(server.requests()[0].method, "GET");
    }

    #[test]
    fn sse_response_is_split_into_chunks() {
        let body = sse_body(&[json!({"a": 1}), json!({"b": 2})]);
        let response = MockResponse::sse(&body, 5);
        assert!(response.chunks.iter().all(|chunk| chunk.len() <= 5));
        assert_eq!(response.content_length(), body.len());
        assert!(body.starts_with("data: {\"a\":1}\n\n"));
    }
}
