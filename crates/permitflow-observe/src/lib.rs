//! Run log and optional telemetry for PermitFlow.
//!
//! Every line goes to `.permitflow/observe.log` as `<rfc3339> <LEVEL> <body>`.
//! Warnings are echoed to stderr; debug lines only when verbose.

use anyhow::Result;
use chrono::Utc;
use permitflow_core::{TelemetryConfig, runtime_dir};
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const LOG_FILE: &str = "observe.log";
const TELEMETRY_TIMEOUT: Duration = Duration::from_secs(3);

/// A generation attempt worth keeping a record of.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent<'a> {
    Completed {
        work_order_id: &'a str,
        stage: &'a str,
        frames: usize,
        malformed_frames: usize,
    },
    Failed {
        work_order_id: &'a str,
        error: &'a str,
    },
}

impl RunEvent<'_> {
    fn level(&self) -> &'static str {
        match self {
            RunEvent::Completed { .. } => "RUN",
            RunEvent::Failed { .. } => "RUN_FAILED",
        }
    }

    fn telemetry_name(&self) -> &'static str {
        match self {
            RunEvent::Completed { .. } => "permitflow.run",
            RunEvent::Failed { .. } => "permitflow.run_failed",
        }
    }

    fn log_body(&self) -> String {
        match self {
            RunEvent::Completed {
                work_order_id,
                stage,
                frames,
                malformed_frames,
            } => format!(
                "work_order={work_order_id} stage={stage} frames={frames} malformed={malformed_frames}"
            ),
            RunEvent::Failed {
                work_order_id,
                error,
            } => format!("work_order={work_order_id} error={error}"),
        }
    }

    fn payload(&self) -> Value {
        match self {
            RunEvent::Completed {
                work_order_id,
                stage,
                frames,
                malformed_frames,
            } => json!({
                "work_order_id": work_order_id,
                "stage": stage,
                "frames": frames,
                "malformed_frames": malformed_frames,
            }),
            RunEvent::Failed {
                work_order_id,
                error,
            } => json!({ "work_order_id": work_order_id, "error": error }),
        }
    }
}

pub struct Observer {
    log_path: PathBuf,
    collector: Option<Collector>,
    verbose: bool,
}

/// Where telemetry events are posted.
struct Collector {
    url: String,
    http: Client,
}

impl Observer {
    pub fn new(workspace: &Path, telemetry: &TelemetryConfig) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join(LOG_FILE),
            collector: Collector::from_config(telemetry)?,
            verbose: false,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Append the event to the log and hand it to the collector, if any.
    pub fn record(&self, event: &RunEvent<'_>) -> Result<()> {
        self.append(event.level(), &event.log_body())?;
        if let Some(collector) = &self.collector {
            collector.post(event.telemetry_name(), event.payload(), self.log_path.clone());
        }
        Ok(())
    }

    pub fn record_run(
        &self,
        work_order_id: &str,
        stage: &str,
        frames: usize,
        malformed_frames: usize,
    ) -> Result<()> {
        self.record(&RunEvent::Completed {
            work_order_id,
            stage,
            frames,
            malformed_frames,
        })
    }

    pub fn record_failure(&self, work_order_id: &str, error: &str) -> Result<()> {
        self.record(&RunEvent::Failed {
            work_order_id,
            error,
        })
    }

    /// Debug line; shown on stderr with `--verbose`.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[permitflow] {msg}");
        }
        let _ = self.append("DEBUG", msg);
    }

    pub fn warn_log(&self, msg: &str) {
        eprintln!("[permitflow WARN] {msg}");
        let _ = self.append("WARN", msg);
    }

    fn append(&self, level: &str, body: &str) -> Result<()> {
        append_line(&self.log_path, level, body)
    }
}

impl Collector {
    fn from_config(cfg: &TelemetryConfig) -> Result<Option<Self>> {
        let url = match (&cfg.endpoint, cfg.enabled) {
            (Some(url), true) if !url.trim().is_empty() => url.trim().to_string(),
            _ => return Ok(None),
        };
        let http = Client::builder().timeout(TELEMETRY_TIMEOUT).build()?;
        Ok(Some(Self { url, http }))
    }

    /// Post on a background thread; delivery failures only reach the log.
    fn post(&self, name: &str, payload: Value, log_path: PathBuf) {
        let request = self.http.post(&self.url).json(&json!({
            "name": name,
            "at": Utc::now().to_rfc3339(),
            "payload": payload,
        }));
        thread::spawn(move || {
            if let Err(err) = request.send() {
                let _ = append_line(&log_path, "TELEMETRY_ERROR", &err.to_string());
            }
        });
    }
}

fn append_line(path: &Path, level: &str, body: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{} {level} {body}", Utc::now().to_rfc3339())?;
    Ok(())
}
