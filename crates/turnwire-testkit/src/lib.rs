//! Scripted sources, recording fakes, and scratch workspaces shared by the
//! turnwire test suites. Everything here is test support; nothing ships in a
//! production binary.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{Value, json};
use turnwire_core::{
    ActionType, ApprovalDecision, ApprovalPrompt, CancelToken, EventKind, ExecLogStatus,
    PlanStepMeta, StreamEvent, UiCallback, UiSignal, WireCommand,
};
use turnwire_exec::{ActionExecutor, ActionOutcome, ActionRequest};
use turnwire_stream::{EventCallback, EventSource, StreamRequest, StreamSummary};
use uuid::Uuid;

// ── Event sources ──

/// Plays back a fixed event script instead of talking to a network. Stops
/// early on cancellation or after a terminal event, mirroring the real
/// client's behavior.
pub struct ScriptedSource {
    events: Vec<StreamEvent>,
    pause: Duration,
    play_through_terminal: bool,
}

impl ScriptedSource {
    pub fn new(events: Vec<StreamEvent>) -> Self {
        Self {
            events,
            pause: Duration::ZERO,
            play_through_terminal: false,
        }
    }

    /// Sleep between events, for tests that need the driver to observe
    /// mid-stream timing (cancellation, interleaved dispatch).
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Keep delivering after a terminal event, simulating a misbehaving
    /// service. The real client stops at the first terminal event.
    pub fn play_through_terminal(mut self) -> Self {
        self.play_through_terminal = true;
        self
    }
}

impl EventSource for ScriptedSource {
    fn stream_events(
        &self,
        _request: &StreamRequest,
        cancel: &CancelToken,
        cb: EventCallback,
    ) -> Result<StreamSummary> {
        let mut summary = StreamSummary::default();
        let mut saw_terminal = false;
        for event in &self.events {
            if cancel.is_cancelled() {
                return Ok(summary);
            }
            if !self.pause.is_zero() {
                thread::sleep(self.pause);
            }
            summary.events_delivered += 1;
            if let Some(sequence) = event.sequence {
                summary.last_sequence = Some(sequence);
            }
            let terminal = matches!(
                &event.kind,
                EventKind::Done {} | EventKind::Error { terminal: true, .. }
            );
            cb(event.clone());
            if terminal {
                saw_terminal = true;
                if !self.play_through_terminal {
                    summary.ended_cleanly = true;
                    return Ok(summary);
                }
            }
        }
        // Without a terminal event the script just runs out, which the
        // driver sees as an abrupt end.
        summary.ended_cleanly = saw_terminal;
        Ok(summary)
    }
}

/// An event source that fails before delivering anything.
pub struct FailingSource;

impl EventSource for FailingSource {
    fn stream_events(
        &self,
        _request: &StreamRequest,
        _cancel: &CancelToken,
        _cb: EventCallback,
    ) -> Result<StreamSummary> {
        anyhow::bail!("scripted stream setup failure")
    }
}

// ── Event builders ──

pub fn ack_event(turn_id: Option<Uuid>) -> StreamEvent {
    StreamEvent::now(EventKind::Ack { turn_id })
}

pub fn token_event(text: &str) -> StreamEvent {
    StreamEvent::now(EventKind::Token {
        text: text.to_string(),
    })
}

pub fn plan_event(summary: &str, titles: &[&str]) -> StreamEvent {
    StreamEvent::now(EventKind::Plan {
        summary: Some(summary.to_string()),
        steps: titles
            .iter()
            .map(|title| PlanStepMeta {
                id: None,
                title: (*title).to_string(),
            })
            .collect(),
    })
}

pub fn exec_log_queued(
    step_id: &str,
    action: &str,
    args: Value,
    requires_confirmation: bool,
) -> StreamEvent {
    StreamEvent::now(EventKind::ExecLog {
        step_id: Some(step_id.to_string()),
        status: ExecLogStatus::Queued,
        command: Some(WireCommand {
            action_type: action.to_string(),
            args,
            requires_confirmation,
        }),
        detail: None,
    })
}

pub fn exec_log_status(step_id: &str, status: ExecLogStatus, detail: &str) -> StreamEvent {
    StreamEvent::now(EventKind::ExecLog {
        step_id: Some(step_id.to_string()),
        status,
        command: None,
        detail: Some(detail.to_string()),
    })
}

pub fn tool_result_event(step_id: &str, name: &str, success: bool, output: Value) -> StreamEvent {
    StreamEvent::now(EventKind::ToolResult {
        step_id: Some(step_id.to_string()),
        name: Some(name.to_string()),
        success: Some(success),
        output,
    })
}

pub fn final_event(rationale: &str, artifacts: &[&str]) -> StreamEvent {
    StreamEvent::now(EventKind::Final {
        rationale: Some(rationale.to_string()),
        artifacts: artifacts.iter().map(|a| (*a).to_string()).collect(),
    })
}

pub fn done_event() -> StreamEvent {
    StreamEvent::now(EventKind::Done {})
}

pub fn error_event(message: &str, terminal: bool) -> StreamEvent {
    StreamEvent::now(EventKind::Error {
        message: message.to_string(),
        terminal,
        code: None,
    })
}

// ── Executor fakes ──

/// Records every request it sees and answers with a canned outcome.
pub struct RecordingExecutor {
    requests: Mutex<Vec<ActionRequest>>,
    delay: Duration,
    fail: bool,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fail: true,
        })
    }

    /// Each perform call stalls for `delay`, polling the cancel token the
    /// way the real shell runner does.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            delay,
            fail: false,
        })
    }

    pub fn requests(&self) -> Vec<ActionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub fn actions(&self) -> Vec<ActionType> {
        self.requests()
            .into_iter()
            .map(|request| request.action_type)
            .collect()
    }
}

impl ActionExecutor for RecordingExecutor {
    fn perform(&self, request: &ActionRequest, cancel: &CancelToken) -> ActionOutcome {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if !self.delay.is_zero() {
            let deadline = Instant::now() + self.delay;
            while Instant::now() < deadline {
                if cancel.is_cancelled() {
                    return ActionOutcome {
                        success: false,
                        payload: json!({"error": "cancelled"}),
                    };
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
        if self.fail {
            ActionOutcome {
                success: false,
                payload: json!({"error": "scripted failure"}),
            }
        } else {
            ActionOutcome {
                success: true,
                payload: json!({"ok": true}),
            }
        }
    }
}

// ── Approval fakes ──

type Approver = Arc<dyn Fn(&ApprovalPrompt) -> Result<ApprovalDecision> + Send + Sync>;

pub fn approve_all() -> Approver {
    Arc::new(|_prompt| {
        Ok(ApprovalDecision {
            approved: true,
            suppress_future_for_category: false,
        })
    })
}

pub fn deny_all() -> Approver {
    Arc::new(|_prompt| {
        Ok(ApprovalDecision {
            approved: false,
            suppress_future_for_category: false,
        })
    })
}

/// Approves everything and keeps the prompts it was shown.
pub fn recording_approver() -> (Approver, Arc<Mutex<Vec<ApprovalPrompt>>>) {
    let prompts = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::clone(&prompts);
    let approver: Approver = Arc::new(move |prompt| {
        store.lock().expect("prompt store").push(prompt.clone());
        Ok(ApprovalDecision {
            approved: true,
            suppress_future_for_category: false,
        })
    });
    (approver, prompts)
}

// ── UI capture ──

/// A UI callback that stores every signal it receives.
pub fn collecting_ui() -> (UiCallback, Arc<Mutex<Vec<UiSignal>>>) {
    let signals = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&signals);
    let callback: UiCallback = Arc::new(move |signal| {
        sink.lock().expect("signal store").push(signal);
    });
    (callback, signals)
}

/// Render captured signals as compact labels for order assertions.
pub fn signal_labels(signals: &[UiSignal]) -> Vec<String> {
    signals
        .iter()
        .map(|signal| match signal {
            UiSignal::StateChanged { state, .. } => format!("state:{state:?}"),
            UiSignal::TextDelta { .. } => "text".to_string(),
            UiSignal::StepUpdated { record } => format!("step:{:?}", record.outcome),
            UiSignal::CommandStarted { action, .. } => format!("start:{action}"),
            UiSignal::CommandFinished {
                action, success, ..
            } => format!("finish:{action}:{success}"),
            UiSignal::Notice { severity, .. } => format!("notice:{severity:?}"),
        })
        .collect()
}

// ── Workspaces ──

/// Scratch workspace directory that cleans up on drop.
pub fn temp_workspace() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp workspace")
}
