//! User-facing error messages for the PermitFlow CLI.
//!
//! Errors from the lower crates are plain `anyhow` chains. The handler
//! classifies them by message so the CLI can print a title and concrete next
//! steps, or emit the same information as JSON.

use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedError {
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    pub error_type: ErrorType,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Settings, endpoint or catalog file problems.
    Configuration,
    /// The agent could not be reached or answered with an error status.
    Network,
    /// The agent answered but its stream held no usable result.
    Agent,
    /// A status change the workflow does not allow.
    Workflow,
    /// Unknown ids and bad arguments.
    Validation,
    Cancelled,
    Unknown,
}

impl EnhancedError {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        error_type: ErrorType,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            suggestions: Vec::new(),
            error_type,
            context: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions.extend(suggestions);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn into_error(self) -> Error {
        Error::new(self)
    }

    /// Render for a terminal. Context is only shown in verbose mode.
    pub fn format(&self, verbose: bool) -> String {
        let mut output = format!(
            "{}: {}\n  {}\n",
            self.error_type.label(),
            self.title,
            self.message
        );
        if verbose && let Some(context) = &self.context {
            output.push_str(&format!("\n  Context: {context}\n"));
        }
        if !self.suggestions.is_empty() {
            output.push_str("\n  Suggestions:\n");
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                output.push_str(&format!("    {}. {}\n", i + 1, suggestion));
            }
        }
        output
    }
}

impl ErrorType {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorType::Configuration => "config",
            ErrorType::Network => "network",
            ErrorType::Agent => "agent",
            ErrorType::Workflow => "workflow",
            ErrorType::Validation => "input",
            ErrorType::Cancelled => "cancelled",
            ErrorType::Unknown => "error",
        }
    }

    /// Process exit code for this category.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorType::Configuration => 3,
            ErrorType::Network => 4,
            ErrorType::Agent => 5,
            ErrorType::Workflow | ErrorType::Validation => 2,
            ErrorType::Cancelled => 130,
            ErrorType::Unknown => 1,
        }
    }
}

impl fmt::Display for EnhancedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(false))
    }
}

impl std::error::Error for EnhancedError {}

pub struct ErrorHandler {
    verbose: bool,
    show_suggestions: bool,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self {
            verbose: false,
            show_suggestions: true,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn show_suggestions(mut self, show: bool) -> Self {
        self.show_suggestions = show;
        self
    }

    /// Enhanced form of `error`, either carried in the chain or classified.
    pub fn enhance(&self, error: &Error) -> EnhancedError {
        if let Some(enhanced) = error.downcast_ref::<EnhancedError>() {
            return enhanced.clone();
        }
        let mut enhanced = self.classify_error(&format!("{error:#}"));
        enhanced.message = error.to_string();
        let chain: Vec<String> = error.chain().skip(1).map(ToString::to_string).collect();
        if !chain.is_empty() {
            enhanced.context = Some(chain.join(": "));
        }
        if !self.show_suggestions {
            enhanced.suggestions.clear();
        }
        enhanced
    }

    pub fn handle(&self, error: &Error) -> String {
        self.enhance(error).format(self.verbose)
    }

    fn classify_error(&self, error_message: &str) -> EnhancedError {
        let lower = error_message.to_lowercase();

        if lower.contains("could not parse agent response") {
            return EnhancedError::new("Unreadable Agent Response", error_message, ErrorType::Agent)
                .with_suggestions(vec![
                    "Re-run with --verbose to see each streamed frame".to_string(),
                    "Save the stream and inspect it with `permitflow parse <file>`".to_string(),
                    "Check that the agent returns hazards or permits".to_string(),
                ]);
        }

        if lower.ends_with("agent run cancelled") {
            return EnhancedError::new("Run Cancelled", error_message, ErrorType::Cancelled)
                .with_suggestion("The work order status was restored; generate again when ready");
        }

        if lower.contains("cannot move from")
            || lower.contains("failed validation")
            || lower.contains("only new work orders")
            || lower.contains("can no longer be edited")
        {
            return EnhancedError::new("Status Change Refused", error_message, ErrorType::Workflow)
                .with_suggestions(vec![
                    "Check the current status with `permitflow work-orders show <id>`".to_string(),
                    "Permits must be submitted (Pending) before approval".to_string(),
                ]);
        }

        if lower.contains("not found") && !lower.contains("http") {
            return EnhancedError::new("Unknown Id", error_message, ErrorType::Validation)
                .with_suggestion("List valid ids with `permitflow work-orders list`");
        }

        if lower.contains("network")
            || lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("dns")
            || lower.contains("http error")
            || lower.contains("stream read error")
        {
            return EnhancedError::new("Agent Unreachable", error_message, ErrorType::Network)
                .with_suggestions(vec![
                    "Check that the agent server is running".to_string(),
                    "Verify agent.endpoint or PERMITFLOW_API_BASE_URL".to_string(),
                    "Try again in a few moments".to_string(),
                ]);
        }

        if lower.contains("configuration")
            || lower.contains("endpoint must be")
            || lower.contains("work order file")
            || lower.contains("failed to read work orders")
        {
            return EnhancedError::new(
                "Configuration Error",
                error_message,
                ErrorType::Configuration,
            )
            .with_suggestions(vec![
                "Check .permitflow/settings.json".to_string(),
                "Set PERMITFLOW_API_BASE_URL to the agent base URL".to_string(),
                "Run `permitflow config show` to see the merged settings".to_string(),
            ]);
        }

        EnhancedError::new("Error", error_message, ErrorType::Unknown)
            .with_suggestion("Re-run with --verbose and check .permitflow/observe.log")
    }
}

/// Constructors for errors the CLI raises itself.
pub mod errors {
    use super::*;

    pub fn work_order_not_found(work_order_id: &str) -> EnhancedError {
        EnhancedError::new(
            "Work Order Not Found",
            format!("No work order '{work_order_id}' in the catalog."),
            ErrorType::Validation,
        )
        .with_suggestion("List valid ids with `permitflow work-orders list`")
    }

    pub fn permit_not_found(permit_id: &str) -> EnhancedError {
        EnhancedError::new(
            "Permit Not Found",
            format!("No stored permit '{permit_id}'."),
            ErrorType::Validation,
        )
        .with_suggestion("Permits exist only after `permitflow generate <work-order>`")
    }

    /// The category comes from the caller's typed error, never from `cause`,
    /// which may quote an upstream body verbatim.
    pub fn agent_failed(
        work_order_id: &str,
        cause: &str,
        status: Option<u16>,
        error_type: ErrorType,
    ) -> EnhancedError {
        let title = match (error_type, status) {
            (ErrorType::Cancelled, _) => "Run Cancelled".to_string(),
            (_, Some(code)) => format!("Agent Request Failed (HTTP {code})"),
            (_, None) => "Agent Request Failed".to_string(),
        };
        EnhancedError::new(title, cause.to_string(), error_type)
            .with_context(format!("work order {work_order_id} was reverted to New"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn enhanced_error_formatting_lists_suggestions() {
        let error = EnhancedError::new("Test Error", "Something went wrong", ErrorType::Agent)
            .with_suggestion("Try again")
            .with_suggestion("Check the log");

        let formatted = error.format(false);
        assert!(formatted.starts_with("agent: Test Error"));
        assert!(formatted.contains("Something went wrong"));
        assert!(formatted.contains("2. Check the log"));
    }

    #[test]
    fn unparseable_agent_output_is_an_agent_error() {
        let handler = ErrorHandler::new();
        let enhanced = handler.enhance(&anyhow!("could not parse agent response"));
        assert_eq!(enhanced.error_type, ErrorType::Agent);
        assert_eq!(enhanced.error_type.exit_code(), 5);
    }

    #[test]
    fn refused_transitions_are_workflow_errors() {
        let handler = ErrorHandler::new();
        let enhanced = handler.enhance(&anyhow!(
            "permit PERM-1 cannot move from Draft to Approved"
        ));
        assert_eq!(enhanced.error_type, ErrorType::Workflow);
    }

    #[test]
    fn connection_failures_are_network_errors_with_context() {
        let handler = ErrorHandler::new().verbose(true);
        let error = Err::<(), _>(anyhow!(
            "Connection refused. Could not reach the agent at the configured endpoint."
        ))
        .context("agent run for WO-1 failed")
        .expect_err("error");
        let enhanced = handler.enhance(&error);
        assert_eq!(enhanced.error_type, ErrorType::Network);
        assert_eq!(enhanced.message, "agent run for WO-1 failed");
        assert!(handler.handle(&error).contains("Context: Connection refused"));

        let plain = handler.enhance(&anyhow!("HTTP error! status: 500"));
        assert_eq!(plain.error_type, ErrorType::Network);
    }

    #[test]
    fn carried_enhanced_error_is_preserved() {
        let handler = ErrorHandler::new().show_suggestions(false);
        let error = errors::permit_not_found("PERM-9").into_error();
        let enhanced = handler.enhance(&error);
        assert_eq!(enhanced.title, "Permit Not Found");
        assert_eq!(enhanced.error_type, ErrorType::Validation);
    }

    #[test]
    fn agent_failure_reports_status_and_revert() {
        let enhanced =
            errors::agent_failed("WO-1", "upstream crashed", Some(502), ErrorType::Network);
        assert!(enhanced.title.contains("HTTP 502"));
        assert_eq!(enhanced.error_type, ErrorType::Network);
        assert!(enhanced.format(true).contains("reverted to New"));
        let json = serde_json::to_value(&enhanced).expect("json");
        assert_eq!(json["error_type"], "network");
    }

    #[test]
    fn upstream_body_mentioning_cancellation_stays_a_network_error() {
        let body = "request cancelled by upstream gateway";
        let enhanced = errors::agent_failed("WO-1", body, Some(502), ErrorType::Network);
        assert_eq!(enhanced.error_type, ErrorType::Network);
        assert_eq!(enhanced.error_type.exit_code(), 4);
        assert!(enhanced.title.contains("HTTP 502"));

        let classified = ErrorHandler::new().enhance(&anyhow!("HTTP error! {body}"));
        assert_eq!(classified.error_type, ErrorType::Network);
    }

    #[test]
    fn cancelled_runs_keep_their_category() {
        let enhanced =
            errors::agent_failed("WO-1", "agent run cancelled", None, ErrorType::Cancelled);
        assert_eq!(enhanced.title, "Run Cancelled");
        assert_eq!(enhanced.error_type.exit_code(), 130);

        let classified = ErrorHandler::new().enhance(
            &Err::<(), _>(anyhow!("agent run cancelled"))
                .context("generation for WO-1 stopped")
                .expect_err("error"),
        );
        assert_eq!(classified.error_type, ErrorType::Cancelled);
    }
}
