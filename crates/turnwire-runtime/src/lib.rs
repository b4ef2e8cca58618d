//! Turn driver. Owns the active turn, applies stream events strictly in
//! arrival order, extracts embedded command blocks from streamed text, and
//! routes every command through the dispatch pipeline.
//!
//! Threading: the stream consumer runs on its own detached thread and
//! delivers events through an mpsc channel; this driver drains the channel
//! and dispatches inline, so executions are serialized by construction.
//! While an execution or approval prompt is in flight, incoming events
//! simply buffer in the channel and are applied afterwards, still in
//! arrival order.

pub mod dispatch;
pub mod extract;

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use turnwire_core::{
    ActionType, CancelToken, EventKind, ExecLogStatus, FinalSummary, LimitsConfig, NoticeSeverity,
    PlanMetadata, StepOutcome, StepRecord, StreamEvent, Turn, TurnState, UiCallback, UiSignal,
    WireCommand,
};
use turnwire_observe::Observer;
use turnwire_stream::{EventCallback, EventSource, StreamRequest, StreamSummary};
use uuid::Uuid;

use crate::dispatch::{CommandDispatcher, DispatchOutcome};
use crate::extract::CommandScanner;

/// How long the driver blocks on the event channel before re-checking the
/// cancel token.
const RECV_SLICE: Duration = Duration::from_millis(100);

enum LoopSignal {
    Event(StreamEvent),
    Closed(Result<StreamSummary>),
}

/// Everything a caller learns about a finished turn.
#[derive(Debug)]
pub struct TurnReport {
    pub turn_id: Uuid,
    pub state: TurnState,
    pub text: String,
    pub plan: Option<PlanMetadata>,
    pub final_summary: Option<FinalSummary>,
    pub steps: Vec<StepRecord>,
    pub executed: usize,
    pub denied: usize,
    pub duplicates: usize,
    pub stream: Option<StreamSummary>,
}

#[derive(Debug, Default)]
struct DispatchTally {
    executed: usize,
    denied: usize,
    duplicates: usize,
}

/// Drives one turn at a time against an event source. Construction wires the
/// stream, dispatcher, observer and UI callback together; [`run_turn`] then
/// blocks until the turn reaches a terminal state.
///
/// [`run_turn`]: TurnOrchestrator::run_turn
pub struct TurnOrchestrator {
    source: Arc<dyn EventSource>,
    dispatcher: Mutex<CommandDispatcher>,
    observer: Observer,
    ui: UiCallback,
    limits: LimitsConfig,
    active: Mutex<Option<CancelToken>>,
}

impl TurnOrchestrator {
    pub fn new(
        source: Arc<dyn EventSource>,
        dispatcher: CommandDispatcher,
        observer: Observer,
        ui: UiCallback,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            source,
            dispatcher: Mutex::new(dispatcher),
            observer,
            ui,
            limits,
            active: Mutex::new(None),
        }
    }

    /// Cancel the in-flight turn, if any. Idempotent and callable from any
    /// thread; returns whether a turn was there to cancel.
    pub fn cancel_active(&self) -> bool {
        match &*self.active.lock().expect("active turn lock") {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run one full turn: open the stream, apply events until a terminal
    /// state is reached or the stream closes, and summarize what happened.
    /// Only one turn may be active at a time.
    pub fn run_turn(&self, input: &str) -> Result<TurnReport> {
        let cancel = CancelToken::new();
        {
            let mut active = self.active.lock().expect("active turn lock");
            if active.is_some() {
                bail!("another turn is already active");
            }
            *active = Some(cancel.clone());
        }
        let report = self.drive(input, &cancel);
        *self.active.lock().expect("active turn lock") = None;
        report
    }

    fn drive(&self, input: &str, cancel: &CancelToken) -> Result<TurnReport> {
        let mut turn = Turn::new(self.limits.fingerprint_cap);
        let mut scanner = CommandScanner::new();
        let mut tally = DispatchTally::default();

        let (tx, rx) = mpsc::channel::<LoopSignal>();
        let event_tx = tx.clone();
        let callback: EventCallback = Arc::new(move |event| {
            let _ = event_tx.send(LoopSignal::Event(event));
        });
        let source = Arc::clone(&self.source);
        let request = StreamRequest::new(turn.id, input);
        let stream_cancel = cancel.clone();
        // Deliberately not joined: on cancellation the receiver is dropped
        // and the thread's remaining sends fail silently while it winds down
        // on its own.
        thread::spawn(move || {
            let outcome = source.stream_events(&request, &stream_cancel, callback);
            let _ = tx.send(LoopSignal::Closed(outcome));
        });

        let mut stream_summary = None;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match rx.recv_timeout(RECV_SLICE) {
                Ok(LoopSignal::Event(event)) => {
                    self.apply_event(&mut turn, &mut scanner, &mut tally, event, cancel)?;
                }
                Ok(LoopSignal::Closed(outcome)) => {
                    match outcome {
                        Ok(summary) => stream_summary = Some(summary),
                        Err(err) => {
                            self.observer.warn_log(&format!("stream worker failed: {err}"));
                            // Fail through the normal event path so the
                            // terminal-only-after-a-terminal-event rule holds.
                            let event = StreamEvent::synthetic_terminal(
                                format!("stream failed: {err}"),
                                "connection_lost",
                            );
                            self.apply_event(&mut turn, &mut scanner, &mut tally, event, cancel)?;
                        }
                    }
                    break;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if !turn.is_terminal() {
            if cancel.is_cancelled() {
                self.transition(&mut turn, TurnState::Cancelled);
            } else {
                // The stream closed without the service ever finishing the
                // turn. Fail it through the normal event path so the
                // terminal-only-after-a-terminal-event rule holds.
                let event = StreamEvent::synthetic_terminal(
                    "stream ended before the turn completed",
                    "stream_incomplete",
                );
                self.apply_event(&mut turn, &mut scanner, &mut tally, event, cancel)?;
            }
        }

        Ok(TurnReport {
            turn_id: turn.id,
            state: turn.state,
            text: turn.text_buffer,
            plan: turn.plan,
            final_summary: turn.final_summary,
            steps: turn.step_log,
            executed: tally.executed,
            denied: tally.denied,
            duplicates: tally.duplicates,
            stream: stream_summary,
        })
    }

    /// Apply one event per the transition table. Events that imply an
    /// invalid transition are ignored whole and logged, never applied
    /// partially; anything arriving after a terminal state is a no-op.
    fn apply_event(
        &self,
        turn: &mut Turn,
        scanner: &mut CommandScanner,
        tally: &mut DispatchTally,
        event: StreamEvent,
        cancel: &CancelToken,
    ) -> Result<()> {
        if turn.is_terminal() {
            return Ok(());
        }
        match event.kind {
            EventKind::Ack { turn_id } => {
                if !self.transition(turn, TurnState::Acknowledged) {
                    return Ok(());
                }
                if let Some(id) = turn_id {
                    turn.id = id;
                }
                turn.reset_buffers();
                *scanner = CommandScanner::new();
            }
            EventKind::Metadata {
                resume_supported,
                stream_id,
                note,
            } => {
                // Resume bookkeeping lives in the stream client; here this
                // is informational only.
                self.observer.verbose_log(&format!(
                    "stream metadata: resume_supported={resume_supported:?} stream_id={stream_id:?} note={note:?}"
                ));
            }
            EventKind::Plan { summary, steps } => {
                if !self.transition(turn, TurnState::Planning) {
                    return Ok(());
                }
                turn.plan = Some(PlanMetadata {
                    step_count: steps.len(),
                    summary,
                    steps,
                });
            }
            EventKind::ExecLog {
                step_id,
                status,
                command,
                detail,
            } => match status {
                ExecLogStatus::Queued => {
                    if let Some(wire) = command {
                        self.dispatch_wire(turn, wire, step_id, cancel, tally)?;
                    } else {
                        let record = StepRecord {
                            at: event.at,
                            step_id,
                            label: "exec".to_string(),
                            outcome: StepOutcome::Info,
                            detail: detail.unwrap_or_else(|| "queued".to_string()),
                        };
                        turn.record_step(record.clone());
                        self.emit(UiSignal::StepUpdated { record });
                    }
                }
                ExecLogStatus::Running => {
                    if !self.transition(turn, TurnState::Executing) {
                        return Ok(());
                    }
                    let record = StepRecord {
                        at: event.at,
                        step_id,
                        label: "exec".to_string(),
                        outcome: StepOutcome::Running,
                        detail: detail.unwrap_or_default(),
                    };
                    turn.record_step(record.clone());
                    self.emit(UiSignal::StepUpdated { record });
                }
                ExecLogStatus::Completed | ExecLogStatus::Failed => {
                    let record = StepRecord {
                        at: event.at,
                        step_id,
                        label: "exec".to_string(),
                        outcome: if status == ExecLogStatus::Completed {
                            StepOutcome::Completed
                        } else {
                            StepOutcome::Failed
                        },
                        detail: detail.unwrap_or_default(),
                    };
                    turn.record_step(record.clone());
                    self.emit(UiSignal::StepUpdated { record });
                }
            },
            EventKind::ToolResult {
                step_id,
                name,
                success,
                output,
            } => {
                let record = StepRecord {
                    at: event.at,
                    step_id,
                    label: name.unwrap_or_else(|| "tool".to_string()),
                    outcome: match success {
                        Some(true) => StepOutcome::Completed,
                        Some(false) => StepOutcome::Failed,
                        None => StepOutcome::Info,
                    },
                    detail: summarize_tool_output(&output),
                };
                turn.record_step(record.clone());
                self.emit(UiSignal::StepUpdated { record });
            }
            EventKind::Token { text } => {
                if !self.transition(turn, TurnState::Streaming) {
                    return Ok(());
                }
                turn.append_text(&text);
                self.emit(UiSignal::TextDelta { text });
                let (commands, errors) = scanner.scan(&turn.text_buffer);
                for err in errors {
                    self.emit(UiSignal::Notice {
                        severity: NoticeSeverity::Transient,
                        message: format!("command block skipped: {err}"),
                    });
                }
                for extracted in commands {
                    let command = self
                        .dispatcher
                        .lock()
                        .expect("dispatcher lock")
                        .build_command(extracted.action, extracted.args, None, false);
                    self.dispatch_command(turn, command, cancel, tally)?;
                }
            }
            EventKind::Final {
                rationale,
                artifacts,
            } => {
                if !self.transition(turn, TurnState::Finalizing) {
                    return Ok(());
                }
                turn.final_summary = Some(FinalSummary {
                    rationale,
                    artifacts,
                });
            }
            EventKind::Done {} => {
                self.transition(turn, TurnState::Completed);
            }
            EventKind::Error {
                message,
                terminal,
                code,
            } => {
                if terminal {
                    if self.transition(turn, TurnState::Failed) {
                        let label = match code {
                            Some(code) => format!("{message} ({code})"),
                            None => message,
                        };
                        self.emit(UiSignal::Notice {
                            severity: NoticeSeverity::Terminal,
                            message: label,
                        });
                    }
                } else {
                    self.emit(UiSignal::Notice {
                        severity: NoticeSeverity::Transient,
                        message,
                    });
                }
            }
        }
        Ok(())
    }

    /// Explicit command channel: an `exec_log` queued entry carrying a
    /// command payload.
    fn dispatch_wire(
        &self,
        turn: &mut Turn,
        wire: WireCommand,
        step_id: Option<String>,
        cancel: &CancelToken,
        tally: &mut DispatchTally,
    ) -> Result<()> {
        let Some(action) = ActionType::from_wire_name(&wire.action_type) else {
            self.observer
                .warn_log(&format!("unknown action type: {}", wire.action_type));
            self.emit(UiSignal::Notice {
                severity: NoticeSeverity::Transient,
                message: format!("unknown action type: {}", wire.action_type),
            });
            return Ok(());
        };
        let command = self
            .dispatcher
            .lock()
            .expect("dispatcher lock")
            .build_command(action, wire.args, step_id, wire.requires_confirmation);
        self.dispatch_command(turn, command, cancel, tally)
    }

    fn dispatch_command(
        &self,
        turn: &mut Turn,
        command: turnwire_core::Command,
        cancel: &CancelToken,
        tally: &mut DispatchTally,
    ) -> Result<()> {
        let (_, outcome) = self
            .dispatcher
            .lock()
            .expect("dispatcher lock")
            .dispatch(turn, command, cancel, &|signal| self.emit(signal))?;
        match outcome {
            DispatchOutcome::Executed(_) => tally.executed += 1,
            DispatchOutcome::Denied { .. } => tally.denied += 1,
            DispatchOutcome::Duplicate => tally.duplicates += 1,
            DispatchOutcome::Cancelled => {}
        }
        Ok(())
    }

    /// Apply a state transition, emitting `StateChanged` when it takes.
    /// Repeating the current state is quietly accepted so oscillation-heavy
    /// streams do not spam the UI.
    fn transition(&self, turn: &mut Turn, to: TurnState) -> bool {
        if turn.state == to && !turn.is_terminal() {
            return true;
        }
        let from = turn.state;
        if turn.transition_to(to) {
            self.emit(UiSignal::StateChanged {
                turn_id: turn.id,
                state: to,
            });
            true
        } else {
            self.observer
                .warn_log(&format!("ignored invalid transition {from:?} -> {to:?}"));
            false
        }
    }

    fn emit(&self, signal: UiSignal) {
        if let Err(err) = self.observer.record_signal(&signal) {
            self.observer
                .warn_log(&format!("observer write failed: {err}"));
        }
        (self.ui)(signal);
    }
}

/// One-line rendering of a tool_result payload for the step log.
fn summarize_tool_output(output: &serde_json::Value) -> String {
    let mut line = match output {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.lines().next().unwrap_or_default().to_string(),
        other => other.to_string(),
    };
    if line.len() > 120 {
        let mut end = 120;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        line.truncate(end);
    }
    line
}
