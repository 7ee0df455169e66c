use reqwest::StatusCode;
use std::error::Error as StdError;

#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    /// Non-success HTTP status or a network failure talking to the agent.
    #[error("{detail}")]
    Transport { status: Option<u16>, detail: String },
    #[error("could not parse agent response")]
    NoStructuredResult,
    #[error("agent run cancelled")]
    Cancelled,
    #[error("invalid agent configuration: {0}")]
    Config(String),
}

impl AgentError {
    pub fn status(&self) -> Option<u16> {
        match self {
            AgentError::Transport { status, .. } => *status,
            _ => None,
        }
    }
}

/// Turn a non-success response into an error carrying the body text.
pub(crate) fn format_api_error(status: StatusCode, body: &str) -> AgentError {
    let body = body.trim();
    let detail = if body.is_empty() {
        format!("HTTP error! status: {}", status.as_u16())
    } else {
        body.to_string()
    };
    AgentError::Transport {
        status: Some(status.as_u16()),
        detail,
    }
}

pub(crate) fn format_transport_error(err: &reqwest::Error) -> AgentError {
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("name or service not known")
        || inner_msg.contains("no such host")
        || inner_msg.contains("getaddrinfo");

    let detail = if err.is_timeout() {
        "Request timed out. The agent did not respond in time; consider raising \
         agent.timeout_seconds."
            .to_string()
    } else if is_dns {
        "DNS resolution failed. Could not resolve the agent hostname.".to_string()
    } else if err.is_connect() {
        "Connection refused. Could not reach the agent at the configured endpoint.".to_string()
    } else {
        format!("Network error: {err}")
    };
    AgentError::Transport {
        status: None,
        detail,
    }
}

pub(crate) fn stream_read_error(err: &std::io::Error) -> AgentError {
    AgentError::Transport {
        status: None,
        detail: format!("stream read error: {err}"),
    }
}
