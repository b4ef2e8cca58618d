//! Observer log and best-effort result reporting.
//!
//! Both halves write to the same append-only `.turnwire/observe.log`. The
//! observer records orchestrator signals locally; the reporter posts
//! execution outcomes back to the service, fire-and-forget, so a slow or
//! dead report endpoint can never stall a turn.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::{Value, json};
use turnwire_core::{ActionType, EndpointConfig, ExecutionResult, UiSignal, runtime_dir};
use uuid::Uuid;

/// Local audit trail plus stderr helpers.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Append one structured signal line. Token deltas are skipped; logging
    /// every streamed fragment would swamp the file without adding signal.
    pub fn record_signal(&self, signal: &UiSignal) -> Result<()> {
        if matches!(signal, UiSignal::TextDelta { .. }) {
            return Ok(());
        }
        self.append_log_line(&format!(
            "{} SIGNAL {}",
            Utc::now().to_rfc3339(),
            serde_json::to_string(signal)?
        ))
    }

    /// Log a message to stderr with `[turnwire]` prefix when verbose mode is
    /// on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[turnwire] {msg}");
        }
    }

    /// Log a warning — always written to the log file, and to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[turnwire WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        append_line(&self.log_path, line)
    }
}

/// What gets posted back to the service after a command actually executed.
/// Denied, deduplicated, and cancelled commands never produce one of these.
#[derive(Debug, Clone, Serialize)]
pub struct ResultReport {
    pub turn_id: Uuid,
    pub step_id: Option<String>,
    pub action: ActionType,
    pub fingerprint: String,
    pub result: ExecutionResult,
    /// Full action payload as produced by the executor.
    pub output: Value,
}

struct ReportSink {
    url: String,
    api_key: Option<String>,
    client: Client,
}

/// Posts execution outcomes back to the service. Network failure is
/// swallowed: logged, never retried, never user-visible, because the local
/// UI already reflects the true outcome.
pub struct ResultReporter {
    sink: Option<ReportSink>,
    log_path: PathBuf,
}

impl ResultReporter {
    pub fn new(workspace: &Path, endpoint: &EndpointConfig) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            sink: report_sink(endpoint)?,
            log_path: dir.join("observe.log"),
        })
    }

    /// Reporter that never posts anywhere; records nothing but the log dir.
    pub fn disabled(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            sink: None,
            log_path: dir.join("observe.log"),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Fire-and-forget: the POST happens on a background thread so it never
    /// blocks the turn loop (the HTTP call can take up to 3 seconds).
    pub fn report(&self, report: &ResultReport) {
        let Some(sink) = &self.sink else {
            return;
        };

        let body = json!({
            "at": Utc::now().to_rfc3339(),
            "turn_id": report.turn_id,
            "step_id": report.step_id,
            "action": report.action,
            "fingerprint": report.fingerprint,
            "result": report.result,
            "output": report.output,
        });

        let client = sink.client.clone();
        let url = sink.url.clone();
        let api_key = sink.api_key.clone();
        let log_path = self.log_path.clone();
        std::thread::spawn(move || {
            let mut request = client.post(&url).json(&body);
            if let Some(key) = &api_key {
                request = request.bearer_auth(key);
            }
            if let Err(err) = request.send() {
                let line = format!("{} REPORT_ERROR error={}", Utc::now().to_rfc3339(), err);
                let _ = append_line(&log_path, &line);
            }
        });
    }
}

fn report_sink(endpoint: &EndpointConfig) -> Result<Option<ReportSink>> {
    if endpoint.report_path.trim().is_empty() {
        return Ok(None);
    }
    let url = format!(
        "{}{}",
        endpoint.base_url.trim_end_matches('/'),
        endpoint.report_path
    );
    let client = Client::builder().timeout(Duration::from_secs(3)).build()?;
    Ok(Some(ReportSink {
        url,
        api_key: endpoint.api_key.clone(),
        client,
    }))
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{line}")?;
    Ok(())
}
