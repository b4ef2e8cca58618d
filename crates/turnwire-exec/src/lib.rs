//! Local action execution.
//!
//! Every action the remote agent asks for is carried out here, inside a
//! single workspace root. Path arguments are resolved lexically against that
//! root and rejected before any filesystem call when they point outside it.
//! Failures never panic; they come back as a structured error payload so the
//! caller can log and report them.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use turnwire_core::{
    ActionType, CancelToken, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_MAX_OUTPUT_BYTES,
};

pub mod shell;

pub use shell::{PlatformShellRunner, ShellRunOutput, ShellRunner};

/// Bytes of a file inspected for NUL when deciding whether it is binary.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// A fully resolved request for one action. The policy and approval layers
/// have already run by the time one of these reaches an executor.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub action_type: ActionType,
    pub args: Value,
}

impl ActionRequest {
    pub fn new(action_type: ActionType, args: Value) -> Self {
        Self { action_type, args }
    }
}

/// What one action produced. `payload` is `{"error": ...}` when
/// `success` is false.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub success: bool,
    pub payload: Value,
}

/// Boundary between the orchestrator and whatever actually performs actions.
/// Production uses [`LocalExecutor`]; tests substitute recording fakes.
pub trait ActionExecutor: Send + Sync {
    fn perform(&self, request: &ActionRequest, cancel: &CancelToken) -> ActionOutcome;
}

/// Executes actions against a real workspace directory and the platform
/// shell.
pub struct LocalExecutor {
    root: PathBuf,
    runner: Arc<dyn ShellRunner>,
    command_timeout: Duration,
    max_output_bytes: usize,
}

impl LocalExecutor {
    pub fn new(root: &Path) -> Result<Self> {
        Self::with_runner(root, Arc::new(PlatformShellRunner))
    }

    pub fn with_runner(root: &Path, runner: Arc<dyn ShellRunner>) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            runner,
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        })
    }

    pub fn with_limits(mut self, command_timeout: Duration, max_output_bytes: usize) -> Self {
        self.command_timeout = command_timeout;
        self.max_output_bytes = max_output_bytes.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_action(&self, request: &ActionRequest, cancel: &CancelToken) -> Result<Value> {
        if cancel.is_cancelled() {
            return Err(anyhow!("action cancelled before it started"));
        }
        match request.action_type {
            ActionType::FsRead => self.read_file(&request.args),
            ActionType::FsWrite => self.write_file(&request.args),
            ActionType::FsAppend => self.append_file(&request.args),
            ActionType::FsList => self.list_dir(&request.args),
            ActionType::FsDelete => self.delete_path(&request.args),
            ActionType::ShRun => self.run_shell(&request.args, cancel),
        }
    }

    fn read_file(&self, args: &Value) -> Result<Value> {
        let raw = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("path missing"))?;
        let max_bytes = args
            .get("max_bytes")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(self.max_output_bytes);
        let path = resolve_in_root(&self.root, raw)?;
        let bytes = fs::read(&path)?;
        let digest = format!("{:x}", Sha256::digest(&bytes));
        if looks_binary(&bytes) {
            // Binary content is summarized, never inlined into the payload.
            return Ok(json!({
                "path": raw,
                "binary": true,
                "size_bytes": bytes.len(),
                "sha256": digest,
            }));
        }
        let truncated = bytes.len() > max_bytes;
        let visible = if truncated { &bytes[..max_bytes] } else { &bytes[..] };
        Ok(json!({
            "path": raw,
            "size_bytes": bytes.len(),
            "sha256": digest,
            "truncated": truncated,
            "content": String::from_utf8_lossy(visible),
        }))
    }

    fn write_file(&self, args: &Value) -> Result<Value> {
        let raw = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("path missing"))?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("content missing"))?;
        let path = resolve_in_root(&self.root, raw)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(json!({
            "path": raw,
            "written": true,
            "bytes": content.len(),
            "sha256": format!("{:x}", Sha256::digest(content.as_bytes())),
        }))
    }

    fn append_file(&self, args: &Value) -> Result<Value> {
        let raw = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("path missing"))?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("content missing"))?;
        let path = resolve_in_root(&self.root, raw)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        use std::io::Write as _;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(content.as_bytes())?;
        let total = file.metadata()?.len();
        Ok(json!({
            "path": raw,
            "appended": true,
            "bytes": content.len(),
            "total_bytes": total,
        }))
    }

    fn list_dir(&self, args: &Value) -> Result<Value> {
        let raw = args.get("dir").and_then(|v| v.as_str()).unwrap_or(".");
        let path = resolve_in_root(&self.root, raw)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        Ok(json!({
            "dir": raw,
            "count": entries.len(),
            "entries": entries,
        }))
    }

    fn delete_path(&self, args: &Value) -> Result<Value> {
        let raw = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("path missing"))?;
        let path = resolve_in_root(&self.root, raw)?;
        let metadata = fs::symlink_metadata(&path)
            .map_err(|_| anyhow!("path does not exist: {raw}"))?;
        let was_dir = metadata.is_dir();
        if was_dir {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        Ok(json!({
            "path": raw,
            "deleted": true,
            "was_dir": was_dir,
        }))
    }

    fn run_shell(&self, args: &Value, cancel: &CancelToken) -> Result<Value> {
        let command = args
            .get("cmd")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("cmd missing"))?;
        let requested = args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(self.command_timeout);
        // The configured timeout is a ceiling, not a default.
        let timeout = requested.min(self.command_timeout);

        let started = Instant::now();
        let output = self
            .runner
            .run(command, &self.root, timeout, cancel, self.max_output_bytes)?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (stdout, stdout_truncated) = cap_output(output.stdout, self.max_output_bytes);
        let (stderr, stderr_truncated) = cap_output(output.stderr, self.max_output_bytes);
        Ok(json!({
            "command": command,
            "status": output.status,
            "stdout": stdout,
            "stderr": stderr,
            "timed_out": output.timed_out,
            "cancelled": output.cancelled,
            "truncated": stdout_truncated || stderr_truncated,
            "duration_ms": duration_ms,
        }))
    }
}

impl ActionExecutor for LocalExecutor {
    fn perform(&self, request: &ActionRequest, cancel: &CancelToken) -> ActionOutcome {
        match self.run_action(request, cancel) {
            Ok(payload) => ActionOutcome {
                success: true,
                payload,
            },
            Err(err) => ActionOutcome {
                success: false,
                payload: json!({ "error": err.to_string() }),
            },
        }
    }
}

/// Resolves a relative path against the workspace root without touching the
/// filesystem. Absolute paths and traversals that would climb out of the
/// root are rejected outright.
pub fn resolve_in_root(root: &Path, raw: &str) -> Result<PathBuf> {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        return Err(anyhow!("absolute paths are not allowed: {raw}"));
    }
    let mut resolved = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(anyhow!("path escapes the workspace root: {raw}"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("absolute paths are not allowed: {raw}"));
            }
        }
    }
    Ok(root.join(resolved))
}

fn looks_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

fn cap_output(text: String, cap: usize) -> (String, bool) {
    if text.len() <= cap {
        return (text, false);
    }
    let truncated = String::from_utf8_lossy(&text.as_bytes()[..cap]).into_owned();
    (truncated, true)
}
