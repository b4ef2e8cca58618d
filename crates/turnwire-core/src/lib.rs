use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

/// Wall-clock bound on a single local execution.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;
/// Captured stdout/stderr are truncated beyond this many bytes.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
/// Per-turn fingerprint set size; oldest entries are evicted first.
pub const DEFAULT_FINGERPRINT_CAP: usize = 512;
/// Cross-turn trailing window of recently executed fingerprints.
pub const DEFAULT_TRAILING_WINDOW: usize = 64;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".turnwire")
}

// ── Action types ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    #[serde(rename = "fs.read")]
    FsRead,
    #[serde(rename = "fs.write")]
    FsWrite,
    #[serde(rename = "fs.append")]
    FsAppend,
    #[serde(rename = "fs.list")]
    FsList,
    #[serde(rename = "fs.delete")]
    FsDelete,
    #[serde(rename = "sh.run")]
    ShRun,
}

impl ActionType {
    pub const ALL: [ActionType; 6] = [
        ActionType::FsRead,
        ActionType::FsWrite,
        ActionType::FsAppend,
        ActionType::FsList,
        ActionType::FsDelete,
        ActionType::ShRun,
    ];

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "fs.read" => Some(ActionType::FsRead),
            "fs.write" => Some(ActionType::FsWrite),
            "fs.append" => Some(ActionType::FsAppend),
            "fs.list" => Some(ActionType::FsList),
            "fs.delete" => Some(ActionType::FsDelete),
            "sh.run" => Some(ActionType::ShRun),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            ActionType::FsRead => "fs.read",
            ActionType::FsWrite => "fs.write",
            ActionType::FsAppend => "fs.append",
            ActionType::FsList => "fs.list",
            ActionType::FsDelete => "fs.delete",
            ActionType::ShRun => "sh.run",
        }
    }

    /// Which argument key carries a filesystem path, if the action has one.
    pub fn path_arg(&self) -> Option<&'static str> {
        match self {
            ActionType::FsList => Some("dir"),
            ActionType::ShRun => None,
            _ => Some("path"),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

// ── Turn state machine ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Acknowledged,
    Planning,
    Executing,
    Streaming,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnState::Completed | TurnState::Failed | TurnState::Cancelled
        )
    }
}

/// Validity table for turn state transitions. Self-transitions are valid for
/// non-terminal states (repeated tokens keep a turn Streaming); terminal
/// states admit no outgoing transitions at all.
pub fn is_valid_turn_transition(from: &TurnState, to: &TurnState) -> bool {
    if from == to {
        return !from.is_terminal();
    }
    match from {
        TurnState::Idle => matches!(
            to,
            TurnState::Acknowledged
                | TurnState::Planning
                | TurnState::Executing
                | TurnState::Streaming
                | TurnState::Finalizing
                | TurnState::Failed
                | TurnState::Cancelled
        ),
        TurnState::Acknowledged => matches!(
            to,
            TurnState::Planning
                | TurnState::Executing
                | TurnState::Streaming
                | TurnState::Finalizing
                | TurnState::Completed
                | TurnState::Failed
                | TurnState::Cancelled
        ),
        TurnState::Planning => matches!(
            to,
            TurnState::Executing
                | TurnState::Streaming
                | TurnState::Finalizing
                | TurnState::Completed
                | TurnState::Failed
                | TurnState::Cancelled
        ),
        TurnState::Executing => matches!(
            to,
            TurnState::Planning
                | TurnState::Streaming
                | TurnState::Finalizing
                | TurnState::Completed
                | TurnState::Failed
                | TurnState::Cancelled
        ),
        TurnState::Streaming => matches!(
            to,
            TurnState::Planning
                | TurnState::Executing
                | TurnState::Finalizing
                | TurnState::Completed
                | TurnState::Failed
                | TurnState::Cancelled
        ),
        TurnState::Finalizing => matches!(
            to,
            TurnState::Completed | TurnState::Failed | TurnState::Cancelled
        ),
        TurnState::Completed | TurnState::Failed | TurnState::Cancelled => false,
    }
}

// ── Commands ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRequirement {
    Auto,
    Required,
    Denied,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Approved,
    Denied,
    Executing,
    Completed,
    Failed,
}

/// Command status only moves forward: pending → approved|denied,
/// approved → executing, executing → completed|failed. Everything else,
/// including self-transitions, is rejected.
pub fn is_valid_command_status_transition(from: &CommandStatus, to: &CommandStatus) -> bool {
    match from {
        CommandStatus::Pending => {
            matches!(to, CommandStatus::Approved | CommandStatus::Denied)
        }
        CommandStatus::Approved => matches!(to, CommandStatus::Executing),
        CommandStatus::Executing => {
            matches!(to, CommandStatus::Completed | CommandStatus::Failed)
        }
        CommandStatus::Denied | CommandStatus::Completed | CommandStatus::Failed => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub action_type: ActionType,
    pub args: Value,
    pub origin_step_id: Option<String>,
    pub fingerprint: String,
    pub approval: ApprovalRequirement,
    pub status: CommandStatus,
}

impl Command {
    pub fn new(action_type: ActionType, args: Value, origin_step_id: Option<String>) -> Self {
        let fingerprint = command_fingerprint(action_type, &args);
        Self {
            action_type,
            args,
            origin_step_id,
            fingerprint,
            approval: ApprovalRequirement::Auto,
            status: CommandStatus::Pending,
        }
    }

    pub fn advance(&mut self, to: CommandStatus) -> Result<()> {
        if !is_valid_command_status_transition(&self.status, &to) {
            return Err(anyhow::anyhow!(
                "invalid command status transition {:?} -> {:?} for {}",
                self.status,
                to,
                self.action_type
            ));
        }
        self.status = to;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub command_fingerprint: String,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration_ms: u64,
    pub outcome: ExecutionOutcome,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub suppress_future_for_category: bool,
}

/// What the approval UI sees when a command needs a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPrompt {
    pub action: ActionType,
    pub risk_markers: Vec<String>,
    pub reason: String,
}

// ── Fingerprints ──

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                if let Some(inner) = map.get(&key) {
                    out.insert(key, canonicalize(inner));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serialize a JSON value with object keys sorted recursively, so two args
/// maps with the same contents always render to the same bytes.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Deterministic command identity: SHA-256 over the action name and the
/// canonicalized args. Used for at-most-once dedupe across retried deliveries.
pub fn command_fingerprint(action: ActionType, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action.as_wire().as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_json(args).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Insertion-ordered fingerprint set with a hard cap; inserting past the cap
/// evicts the oldest entry so long turns cannot grow memory without bound.
#[derive(Debug, Clone)]
pub struct FingerprintSet {
    seen: IndexSet<String>,
    cap: usize,
}

impl FingerprintSet {
    pub fn new(cap: usize) -> Self {
        Self {
            seen: IndexSet::new(),
            cap: cap.max(1),
        }
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.seen.contains(fingerprint)
    }

    /// Returns false when the fingerprint was already present.
    pub fn insert(&mut self, fingerprint: impl Into<String>) -> bool {
        let inserted = self.seen.insert(fingerprint.into());
        if inserted && self.seen.len() > self.cap {
            self.seen.shift_remove_index(0);
        }
        inserted
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ── Turn ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Running,
    Completed,
    Failed,
    Denied,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub at: DateTime<Utc>,
    pub step_id: Option<String>,
    pub label: String,
    pub outcome: StepOutcome,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStepMeta {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub step_count: usize,
    pub summary: Option<String>,
    pub steps: Vec<PlanStepMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalSummary {
    pub rationale: Option<String>,
    pub artifacts: Vec<String>,
}

/// One request/response cycle against the agent service. All mutable turn
/// state lives here and only the owning orchestrator touches it.
#[derive(Debug)]
pub struct Turn {
    pub id: Uuid,
    pub state: TurnState,
    pub text_buffer: String,
    pub step_log: Vec<StepRecord>,
    pub plan: Option<PlanMetadata>,
    pub final_summary: Option<FinalSummary>,
    pub seen_fingerprints: FingerprintSet,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn new(fingerprint_cap: usize) -> Self {
        Self::with_id(Uuid::now_v7(), fingerprint_cap)
    }

    pub fn with_id(id: Uuid, fingerprint_cap: usize) -> Self {
        Self {
            id,
            state: TurnState::Idle,
            text_buffer: String::new(),
            step_log: Vec::new(),
            plan: None,
            final_summary: None,
            seen_fingerprints: FingerprintSet::new(fingerprint_cap),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a state transition if the table allows it. Terminal entry stamps
    /// `ended_at`; an invalid transition leaves the turn untouched.
    pub fn transition_to(&mut self, to: TurnState) -> bool {
        if !is_valid_turn_transition(&self.state, &to) {
            return false;
        }
        self.state = to;
        if to.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
        true
    }

    /// Clears every buffer the turn owns. Called when `ack` opens the turn.
    pub fn reset_buffers(&mut self) {
        let cap = self.seen_fingerprints.cap;
        self.text_buffer.clear();
        self.step_log.clear();
        self.plan = None;
        self.final_summary = None;
        self.seen_fingerprints = FingerprintSet::new(cap);
    }

    pub fn append_text(&mut self, delta: &str) {
        self.text_buffer.push_str(delta);
    }

    pub fn record_step(&mut self, record: StepRecord) {
        self.step_log.push(record);
    }
}

// ── Stream events ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExecLogStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Command payload as the service sends it; validated into a [`Command`] by
/// the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireCommand {
    pub action_type: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub requires_confirmation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    Ack {
        #[serde(default)]
        turn_id: Option<Uuid>,
    },
    Metadata {
        #[serde(default)]
        resume_supported: Option<bool>,
        #[serde(default)]
        stream_id: Option<String>,
        #[serde(default)]
        note: Option<String>,
    },
    Plan {
        #[serde(default)]
        summary: Option<String>,
        #[serde(default)]
        steps: Vec<PlanStepMeta>,
    },
    ExecLog {
        #[serde(default)]
        step_id: Option<String>,
        status: ExecLogStatus,
        #[serde(default)]
        command: Option<WireCommand>,
        #[serde(default)]
        detail: Option<String>,
    },
    ToolResult {
        #[serde(default)]
        step_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        success: Option<bool>,
        #[serde(default)]
        output: Value,
    },
    Token {
        text: String,
    },
    Final {
        #[serde(default)]
        rationale: Option<String>,
        #[serde(default)]
        artifacts: Vec<String>,
    },
    Done {},
    Error {
        message: String,
        #[serde(default)]
        terminal: bool,
        #[serde(default)]
        code: Option<String>,
    },
}

pub const KNOWN_EVENT_TYPES: [&str; 9] = [
    "ack",
    "metadata",
    "plan",
    "exec_log",
    "tool_result",
    "token",
    "final",
    "done",
    "error",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    pub sequence: Option<u64>,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl StreamEvent {
    pub fn now(kind: EventKind) -> Self {
        Self {
            sequence: None,
            at: Utc::now(),
            kind,
        }
    }

    /// Synthesized when the transport gives up: lets the state machine fail
    /// cleanly instead of hanging on a dead connection.
    pub fn synthetic_terminal(message: impl Into<String>, code: &str) -> Self {
        Self::now(EventKind::Error {
            message: message.into(),
            terminal: true,
            code: Some(code.to_string()),
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Decode one newline-delimited frame body. `Ok(None)` means the frame was a
/// well-formed event of an unknown type and should be ignored for forward
/// compatibility; `Err` means the frame was malformed and gets skipped.
pub fn decode_frame(body: &str) -> std::result::Result<Option<StreamEvent>, FrameError> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| FrameError::Malformed(err.to_string()))?;
    let Some(event_type) = value.get("type").and_then(|v| v.as_str()) else {
        return Err(FrameError::Malformed("missing type field".to_string()));
    };
    if !KNOWN_EVENT_TYPES.contains(&event_type) {
        return Ok(None);
    }
    let data = value
        .get("data")
        .cloned()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    let tagged = serde_json::json!({ "type": event_type, "data": data });
    let kind: EventKind = serde_json::from_value(tagged)
        .map_err(|err| FrameError::Malformed(format!("bad {event_type} payload: {err}")))?;
    let sequence = value.get("sequence").and_then(|v| v.as_u64());
    let at = value
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Ok(Some(StreamEvent { sequence, at, kind }))
}

// ── UI surface ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeSeverity {
    /// Dismissible; the turn continues.
    Transient,
    /// Persistent failure label; the turn is over.
    Terminal,
}

/// Signals the orchestrator pushes at whatever front end is attached.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum UiSignal {
    StateChanged {
        turn_id: Uuid,
        state: TurnState,
    },
    TextDelta {
        text: String,
    },
    StepUpdated {
        record: StepRecord,
    },
    CommandStarted {
        action: ActionType,
        fingerprint: String,
    },
    CommandFinished {
        action: ActionType,
        fingerprint: String,
        success: bool,
        summary: String,
    },
    Notice {
        severity: NoticeSeverity,
        message: String,
    },
}

pub type UiCallback = Arc<dyn Fn(UiSignal) + Send + Sync>;

// ── Cancellation ──

/// Shared cancellation flag. Cloned into the stream thread and the executor
/// worker; cancelling twice is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ── Configuration ──

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub endpoint: EndpointConfig,
    pub trust: TrustSettings,
    pub limits: LimitsConfig,
    pub observe: ObserveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub base_url: String,
    pub stream_path: String,
    pub report_path: String,
    pub api_key: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            stream_path: "/v1/turns/stream".to_string(),
            report_path: "/v1/turns/report".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustSettings {
    /// "supervised" or "autonomous".
    pub mode: String,
    /// Shell auto-approval is a separate opt-in; autonomous mode alone never
    /// approves sh.run without a prompt.
    pub autonomous_shell: bool,
    pub denied_secret_paths: Vec<String>,
}

impl Default for TrustSettings {
    fn default() -> Self {
        Self {
            mode: "supervised".to_string(),
            autonomous_shell: false,
            denied_secret_paths: vec![
                ".ssh".to_string(),
                ".aws".to_string(),
                ".gnupg".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub command_timeout_secs: u64,
    pub max_output_bytes: usize,
    pub fingerprint_cap: usize,
    pub trailing_window: usize,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub max_draft_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            fingerprint_cap: DEFAULT_FINGERPRINT_CAP,
            trailing_window: DEFAULT_TRAILING_WINDOW,
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 500,
            max_draft_bytes: 32 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObserveConfig {
    pub verbose: bool,
}

impl AppConfig {
    /// Reads `.turnwire/config.toml` under the workspace, falling back to
    /// defaults when absent. `TURNWIRE_ENDPOINT` and `TURNWIRE_API_KEY`
    /// override the endpoint section.
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = runtime_dir(workspace).join("config.toml");
        let mut cfg = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            toml::from_str(&raw)?
        } else {
            Self::default()
        };
        if let Ok(endpoint) = std::env::var("TURNWIRE_ENDPOINT")
            && !endpoint.trim().is_empty()
        {
            cfg.endpoint.base_url = endpoint.trim().to_string();
        }
        if let Ok(key) = std::env::var("TURNWIRE_API_KEY")
            && !key.trim().is_empty()
        {
            cfg.endpoint.api_key = Some(key.trim().to_string());
        }
        Ok(cfg)
    }
}
