use crate::error::{AgentError, format_api_error, format_transport_error};
use crate::extract::{ExtractOptions, ExtractionStage, extract_structured_result};
use crate::stream::{FrameCallback, ingest_stream};
use chrono::{DateTime, NaiveDateTime, Utc};
use permitflow_core::{AgentConfig, CancelToken, StructuredResult};
use permitflow_observe::Observer;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, RETRY_AFTER};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Base delay for network/transport error retries (1s, 2s, 4s exponential backoff).
const NETWORK_RETRY_BASE_MS: u64 = 1000;
const MAX_RETRY_DELAY_SECS: u64 = 60;

pub fn run_instruction(work_order_id: &str) -> String {
    format!(
        "Analyze work order {work_order_id}: identify its hazards, propose the required \
         permits and validate each permit against policy. Respond with the structured result."
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub user_id: String,
    pub session_id: String,
    pub work_order_id: String,
}

#[derive(Debug, Clone)]
pub struct AgentRun {
    pub result: StructuredResult,
    pub stage: ExtractionStage,
    pub frames: usize,
    pub malformed_frames: usize,
    pub session_created: bool,
}

/// Anything that can turn a work order into a structured result.
pub trait AgentBackend {
    fn run_work_order(
        &self,
        req: &RunRequest,
        on_frame: Option<FrameCallback>,
        cancel: &CancelToken,
    ) -> Result<AgentRun, AgentError>;
}

#[derive(Clone)]
pub struct AgentClient {
    cfg: AgentConfig,
    base_url: String,
    client: Client,
    observer: Option<Arc<Observer>>,
}

impl AgentClient {
    pub fn new(cfg: AgentConfig) -> Result<Self, AgentError> {
        let base_url = cfg.resolve_endpoint();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(AgentError::Config(format!(
                "agent endpoint must be an http(s) URL, got '{base_url}'"
            )));
        }
        if cfg.app_name.trim().is_empty() {
            return Err(AgentError::Config("agent.app_name is empty".to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .map_err(|err| AgentError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            cfg,
            base_url,
            client,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_url(&self, user_id: &str, session_id: &str) -> String {
        format!(
            "{}/apps/{}/users/{user_id}/sessions/{session_id}",
            self.base_url, self.cfg.app_name
        )
    }

    /// Look the session up and create it when absent. Returns whether a create
    /// was issued. Check-then-create is not atomic; a concurrent create that
    /// answers 409 counts as success.
    pub fn ensure_session(
        &self,
        user_id: &str,
        session_id: &str,
        cancel: &CancelToken,
    ) -> Result<bool, AgentError> {
        let url = self.session_url(user_id, session_id);
        let lookup = self.send_with_retry(cancel, || self.client.get(&url))?;
        let status = lookup.status();
        if status.is_success() {
            return Ok(false);
        }
        if status != StatusCode::NOT_FOUND {
            return Err(format_api_error(status, &lookup.text().unwrap_or_default()));
        }

        self.verbose(&format!("creating agent session {session_id} for {user_id}"));
        let created = self.send_with_retry(cancel, || self.client.post(&url).json(&json!({})))?;
        let status = created.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(true);
        }
        Err(format_api_error(status, &created.text().unwrap_or_default()))
    }

    /// Send a request, retrying transient statuses and transport failures.
    /// Any response that is not retried is handed back for the caller to judge.
    fn send_with_retry<F>(&self, cancel: &CancelToken, build: F) -> Result<Response, AgentError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt: u8 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            match build().send() {
                Ok(resp) => {
                    let status = resp.status();
                    if !should_retry_status(status) || attempt >= self.cfg.max_retries {
                        return Ok(resp);
                    }
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    self.warn(&format!(
                        "agent returned HTTP {}; retrying ({}/{})",
                        status.as_u16(),
                        attempt + 1,
                        self.cfg.max_retries
                    ));
                    thread::sleep(retry_delay_ms(
                        self.cfg.retry_base_ms,
                        attempt,
                        retry_after,
                        self.max_retry_delay(),
                    ));
                }
                Err(err) => {
                    let formatted = format_transport_error(&err);
                    if !should_retry_transport_error(&err) || attempt >= self.cfg.max_retries {
                        return Err(formatted);
                    }
                    self.warn(&format!(
                        "{formatted}; retrying ({}/{})",
                        attempt + 1,
                        self.cfg.max_retries
                    ));
                    thread::sleep(retry_delay_ms(
                        NETWORK_RETRY_BASE_MS,
                        attempt,
                        None,
                        self.max_retry_delay(),
                    ));
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// A server-supplied `Retry-After` may not stall the run past this.
    fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.cfg.timeout_seconds.min(MAX_RETRY_DELAY_SECS))
    }

    fn run_payload(&self, req: &RunRequest) -> serde_json::Value {
        json!({
            "app_name": self.cfg.app_name,
            "user_id": req.user_id,
            "session_id": req.session_id,
            "new_message": {
                "role": "user",
                "parts": [{"text": run_instruction(&req.work_order_id)}],
            },
            "streaming": true,
        })
    }

    fn warn(&self, msg: &str) {
        if let Some(observer) = &self.observer {
            observer.warn_log(msg);
        }
    }

    fn verbose(&self, msg: &str) {
        if let Some(observer) = &self.observer {
            observer.verbose_log(msg);
        }
    }
}

impl AgentBackend for AgentClient {
    fn run_work_order(
        &self,
        req: &RunRequest,
        on_frame: Option<FrameCallback>,
        cancel: &CancelToken,
    ) -> Result<AgentRun, AgentError> {
        let session_created = self.ensure_session(&req.user_id, &req.session_id, cancel)?;

        let url = format!("{}/run_sse", self.base_url);
        let payload = self.run_payload(req);
        let resp = self.send_with_retry(cancel, || {
            self.client
                .post(&url)
                .header(ACCEPT, "text/event-stream")
                .json(&payload)
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format_api_error(status, &resp.text().unwrap_or_default()));
        }
        self.verbose(&format!(
            "streaming agent run for {} (session {})",
            req.work_order_id, req.session_id
        ));

        let reader = ingest_stream(
            resp,
            self.cfg.read_chunk_bytes,
            on_frame.as_ref(),
            cancel,
            &|msg: &str| self.warn(msg),
        )?;
        let (frames, diagnostics) = reader.into_parts();
        let opts = ExtractOptions {
            fallback_policy_version: self.cfg.fallback_policy_version.clone(),
        };
        let extraction = extract_structured_result(&frames, &opts)?;
        for dropped in &extraction.dropped {
            self.warn(&format!("dropped undecodable result entry: {dropped}"));
        }
        self.verbose(&format!(
            "extracted result via {} from {} frames",
            extraction.stage,
            frames.len()
        ));
        Ok(AgentRun {
            result: extraction.result,
            stage: extraction.stage,
            frames: frames.len(),
            malformed_frames: diagnostics.len(),
            session_created,
        })
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}

/// Backoff before the next attempt, never longer than `max_delay`.
fn retry_delay_ms(
    base_ms: u64,
    attempt: u8,
    retry_after_seconds: Option<u64>,
    max_delay: Duration,
) -> Duration {
    let delay = match retry_after_seconds {
        Some(seconds) => Duration::from_secs(seconds),
        None => {
            let exponential = base_ms.saturating_mul(2_u64.saturating_pow(u32::from(attempt)));
            Duration::from_millis(exponential.max(base_ms.max(100)))
        }
    };
    delay.min(max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::EventFrame;
    use permitflow_core::{PermitStatus, TelemetryConfig};
    use permitflow_testkit::{
        MockAgentServer, MockResponse, MockRoute, fresh_session_routes, sample_result,
        session_path, sse_body, text_event,
    };
    use std::sync::Mutex;

    const APP: &str = "sequential_agent";

    fn request(work_order_id: &str) -> RunRequest {
        RunRequest {
            user_id: "user-1".to_string(),
            session_id: format!("session-{work_order_id}"),
            work_order_id: work_order_id.to_string(),
        }
    }

    fn client_for(server: &MockAgentServer, max_retries: u8) -> AgentClient {
        AgentClient::new(AgentConfig {
            endpoint: format!("{}/", server.base_url()),
            endpoint_env: "PERMITFLOW_AGENT_CLIENT_TEST_UNSET".to_string(),
            max_retries,
            retry_base_ms: 1,
            read_chunk_bytes: 7,
            ..AgentConfig::default()
        })
        .expect("client")
    }

    fn result_stream() -> String {
        sse_body(&[
            text_event("Looking at the work order..."),
            json!({"author": "permit_agent", "data": sample_result("WO-1001")}),
            text_event("Done."),
        ])
    }

    #[test]
    fn run_creates_missing_session_and_streams_result() {
        let req = request("WO-1001");
        let server = MockAgentServer::start(fresh_session_routes(
            APP,
            &req.user_id,
            &req.session_id,
            &result_stream(),
            5,
        ))
        .expect("server");
        let client = client_for(&server, 0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let on_frame: FrameCallback = Arc::new(move |frame: &EventFrame| {
            seen_cb.lock().expect("test lock").push(frame.line_no);
            Ok(())
        });

        let run = client
            .run_work_order(&req, Some(on_frame), &CancelToken::new())
            .expect("run");
        assert!(run.session_created);
        assert_eq!(run.stage, ExtractionStage::FrameData);
        assert_eq!(run.frames, 3);
        assert_eq!(run.malformed_frames, 0);
        assert_eq!(run.result.permits[0].permit_id, "PERM-HW-0001");
        assert_eq!(run.result.permits[0].status, PermitStatus::Pending);
        assert_eq!(run.result.run_meta.policy_version, "v2.1");
        assert_eq!(seen.lock().expect("test lock").as_slice(), &[1, 3, 5]);

        let session = session_path(APP, &req.user_id, &req.session_id);
        assert_eq!(server.request_count("GET", &session), 1);
        assert_eq!(server.request_count("POST", &session), 1);
        let run_request = server
            .requests()
            .into_iter()
            .find(|r| r.path == "/run_sse")
            .expect("run request");
        let body = run_request.json_body().expect("json body");
        assert_eq!(body["app_name"], APP);
        assert_eq!(body["session_id"], req.session_id);
        assert_eq!(body["streaming"], true);
        assert_eq!(body["new_message"]["role"], "user");
        assert!(
            body["new_message"]["parts"][0]["text"]
                .as_str()
                .is_some_and(|text| text.contains("WO-1001"))
        );
    }

    #[test]
    fn existing_session_is_not_recreated() {
        let req = request("WO-2");
        let session = session_path(APP, &req.user_id, &req.session_id);
        let server = MockAgentServer::start(vec![
            MockRoute::new("GET", &session, vec![MockResponse::json(200, json!({}))]),
            MockRoute::new("POST", "/run_sse", vec![MockResponse::sse(&result_stream(), 64)]),
        ])
        .expect("server");
        let run = client_for(&server, 0)
            .run_work_order(&req, None, &CancelToken::new())
            .expect("run");
        assert!(!run.session_created);
        assert_eq!(server.request_count("POST", &session), 0);
    }

    #[test]
    fn duplicate_session_create_counts_as_success() {
        let req = request("WO-3");
        let session = session_path(APP, &req.user_id, &req.session_id);
        let server = MockAgentServer::start(vec![
            MockRoute::new("GET", &session, vec![MockResponse::json(404, json!({}))]),
            MockRoute::new(
                "POST",
                &session,
                vec![MockResponse::json(409, json!({"detail": "exists"}))],
            ),
        ])
        .expect("server");
        let created = client_for(&server, 0)
            .ensure_session(&req.user_id, &req.session_id, &CancelToken::new())
            .expect("ensure");
        assert!(created);
    }

    #[test]
    fn non_success_run_fails_with_body_text_before_any_frame() {
        let req = request("WO-4");
        let session = session_path(APP, &req.user_id, &req.session_id);
        let server = MockAgentServer::start(vec![
            MockRoute::new("GET", &session, vec![MockResponse::json(200, json!({}))]),
            MockRoute::new(
                "POST",
                "/run_sse",
                vec![MockResponse::text(502, "text/plain", "agent graph crashed")],
            ),
        ])
        .expect("server");
        let called = Arc::new(Mutex::new(0_usize));
        let called_cb = Arc::clone(&called);
        let on_frame: FrameCallback = Arc::new(move |_: &EventFrame| {
            *called_cb.lock().expect("test lock") += 1;
            Ok(())
        });
        let err = client_for(&server, 2)
            .run_work_order(&req, Some(on_frame), &CancelToken::new())
            .expect_err("transport error");
        assert!(matches!(err, AgentError::Transport { status: Some(502), .. }));
        assert_eq!(err.to_string(), "agent graph crashed");
        assert_eq!(*called.lock().expect("test lock"), 0);
        assert_eq!(server.request_count("POST", "/run_sse"), 1);
    }

    #[test]
    fn transient_status_is_retried_then_streams() {
        let req = request("WO-5");
        let session = session_path(APP, &req.user_id, &req.session_id);
        let server = MockAgentServer::start(vec![
            MockRoute::new("GET", &session, vec![MockResponse::json(200, json!({}))]),
            MockRoute::new(
                "POST",
                "/run_sse",
                vec![
                    MockResponse::json(503, json!({"detail": "warming up"})).with_retry_after("0"),
                    MockResponse::sse(&result_stream(), 16),
                ],
            ),
        ])
        .expect("server");
        let run = client_for(&server, 3)
            .run_work_order(&req, None, &CancelToken::new())
            .expect("run after retry");
        assert_eq!(run.result.hazards.len(), 1);
        assert_eq!(server.request_count("POST", "/run_sse"), 2);
    }

    #[test]
    fn long_retry_after_is_capped_by_the_request_timeout() {
        let req = request("WO-8");
        let session = session_path(APP, &req.user_id, &req.session_id);
        let server = MockAgentServer::start(vec![
            MockRoute::new("GET", &session, vec![MockResponse::json(200, json!({}))]),
            MockRoute::new(
                "POST",
                "/run_sse",
                vec![
                    MockResponse::json(429, json!({"detail": "slow down"}))
                        .with_retry_after("3600"),
                    MockResponse::sse(&result_stream(), 256),
                ],
            ),
        ])
        .expect("server");
        let client = AgentClient::new(AgentConfig {
            endpoint: server.base_url().to_string(),
            endpoint_env: "PERMITFLOW_AGENT_CLIENT_TEST_UNSET".to_string(),
            timeout_seconds: 2,
            max_retries: 1,
            retry_base_ms: 1,
            ..AgentConfig::default()
        })
        .expect("client");

        let started = std::time::Instant::now();
        let run = client
            .run_work_order(&req, None, &CancelToken::new())
            .expect("run after capped wait");
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(run.result.hazards.len(), 1);
        assert_eq!(server.request_count("POST", "/run_sse"), 2);
    }

    #[test]
    fn stream_without_structured_result_is_reported() {
        let req = request("WO-6");
        let session = session_path(APP, &req.user_id, &req.session_id);
        let body = format!(
            "event: message\n{}data: {{broken\n\n",
            sse_body(&[text_event("I could not find that work order.")])
        );
        let server = MockAgentServer::start(vec![
            MockRoute::new("GET", &session, vec![MockResponse::json(200, json!({}))]),
            MockRoute::new("POST", "/run_sse", vec![MockResponse::sse(&body, 9)]),
        ])
        .expect("server");
        let err = client_for(&server, 0)
            .run_work_order(&req, None, &CancelToken::new())
            .expect_err("no result");
        assert!(matches!(err, AgentError::NoStructuredResult));
        assert_eq!(err.to_string(), "could not parse agent response");
    }

    #[test]
    fn cancelled_token_stops_before_any_request() {
        let server = MockAgentServer::start(Vec::new()).expect("server");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = client_for(&server, 0)
            .run_work_order(&request("WO-7"), None, &cancel)
            .expect_err("cancelled");
        assert!(matches!(err, AgentError::Cancelled));
        assert!(server.requests().is_empty());
    }

    #[test]
    fn panicking_observer_is_logged_and_run_completes() {
        let req = request("WO-8");
        let server = MockAgentServer::start(fresh_session_routes(
            APP,
            &req.user_id,
            &req.session_id,
            &result_stream(),
            11,
        ))
        .expect("server");
        let workspace = tempfile::tempdir().expect("workspace");
        let observer = Arc::new(
            Observer::new(workspace.path(), &TelemetryConfig::default()).expect("observer"),
        );
        let client = client_for(&server, 0).with_observer(Arc::clone(&observer));
        let on_frame: FrameCallback =
            Arc::new(|_: &EventFrame| -> anyhow::Result<()> { panic!("ui went away") });

        let run = client
            .run_work_order(&req, Some(on_frame), &CancelToken::new())
            .expect("run");
        assert_eq!(run.frames, 3);
        let log = std::fs::read_to_string(observer.log_path()).expect("log");
        assert!(log.contains("frame observer panicked on line 1"));
    }

    #[test]
    fn invalid_endpoint_is_a_config_error() {
        let err = AgentClient::new(AgentConfig {
            endpoint: "localhost:8000".to_string(),
            endpoint_env: "PERMITFLOW_AGENT_CLIENT_TEST_UNSET".to_string(),
            ..AgentConfig::default()
        })
        .err()
        .expect("config error");
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn retry_status_classification() {
        assert!(should_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(should_retry_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!should_retry_status(StatusCode::NOT_FOUND));
        assert!(!should_retry_status(StatusCode::BAD_GATEWAY));
    }

    #[test]
    fn retry_delay_doubles_and_honours_retry_after() {
        let cap = Duration::from_secs(60);
        assert_eq!(retry_delay_ms(400, 0, None, cap), Duration::from_millis(400));
        assert_eq!(retry_delay_ms(400, 2, None, cap), Duration::from_millis(1600));
        assert_eq!(retry_delay_ms(400, 2, Some(3), cap), Duration::from_secs(3));
        assert_eq!(
            retry_delay_ms(400, 0, Some(3600), Duration::from_secs(10)),
            Duration::from_secs(10)
        );
        assert_eq!(retry_delay_ms(400, 40, None, cap), cap);

        let future = Utc::now() + chrono::Duration::seconds(5);
        let http_date = future.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let header = reqwest::header::HeaderValue::from_str(&http_date).expect("header");
        assert!(parse_retry_after_seconds(Some(&header)).expect("parsed") <= 10);
    }
}
