//! Command dispatch: dedupe, policy, approval, execution, reporting.
//!
//! Commands execute strictly one at a time, in the order they were
//! extracted or announced. A fingerprint already seen in this turn, or in
//! the cross-turn trailing window, is dropped silently. Only commands that
//! actually reach the executor are reported back to the service; denied,
//! deduplicated, and cancelled commands never are.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use turnwire_core::{
    ApprovalDecision, ApprovalPrompt, ApprovalRequirement, CancelToken, Command, CommandStatus,
    ExecutionOutcome, ExecutionResult, FingerprintSet, NoticeSeverity, StepOutcome, StepRecord,
    Turn, UiSignal,
};
use turnwire_exec::{ActionExecutor, ActionRequest};
use turnwire_observe::{ResultReport, ResultReporter};
use turnwire_policy::{PolicyEngine, RiskCategory};

/// Asks a human (or a test fake) whether a command may run.
pub type ApprovalCallback = Arc<dyn Fn(&ApprovalPrompt) -> Result<ApprovalDecision> + Send + Sync>;

/// How one dispatched command ended up.
#[derive(Debug)]
pub enum DispatchOutcome {
    Executed(ExecutionResult),
    Denied { reason: String },
    Duplicate,
    Cancelled,
}

pub struct CommandDispatcher {
    policy: PolicyEngine,
    executor: Arc<dyn ActionExecutor>,
    reporter: Arc<ResultReporter>,
    approval: Option<ApprovalCallback>,
    /// Recently executed fingerprints across turns. Catches replays that a
    /// mid-turn buffer reset would otherwise let through.
    trailing: FingerprintSet,
    /// Risk categories the user opted out of being prompted for again.
    suppressed: HashSet<RiskCategory>,
}

impl CommandDispatcher {
    pub fn new(
        policy: PolicyEngine,
        executor: Arc<dyn ActionExecutor>,
        reporter: Arc<ResultReporter>,
        approval: Option<ApprovalCallback>,
        trailing_window: usize,
    ) -> Self {
        Self {
            policy,
            executor,
            reporter,
            approval,
            trailing: FingerprintSet::new(trailing_window),
            suppressed: HashSet::new(),
        }
    }

    /// Build a command with its approval requirement already resolved.
    /// `remote_requires_confirmation` comes from the service's `exec_log`
    /// payload; commands extracted from text never carry it.
    pub fn build_command(
        &self,
        action: turnwire_core::ActionType,
        args: serde_json::Value,
        origin_step_id: Option<String>,
        remote_requires_confirmation: bool,
    ) -> Command {
        let mut command = Command::new(action, args, origin_step_id);
        command.approval = self
            .policy
            .approval_requirement(action, remote_requires_confirmation);
        command
    }

    /// Run one command through the full pipeline. Status transitions on the
    /// command are enforced by the state table in `turnwire-core`; any
    /// violation here is a programming error and propagates. `emit` receives
    /// the UI signals this command produces, in order.
    pub fn dispatch(
        &mut self,
        turn: &mut Turn,
        mut command: Command,
        cancel: &CancelToken,
        emit: &dyn Fn(UiSignal),
    ) -> Result<(Command, DispatchOutcome)> {
        if cancel.is_cancelled() {
            return Ok((command, DispatchOutcome::Cancelled));
        }

        // At-most-once, both within this turn and across recent turns.
        if self.trailing.contains(&command.fingerprint)
            || !turn.seen_fingerprints.insert(command.fingerprint.clone())
        {
            return Ok((command, DispatchOutcome::Duplicate));
        }

        if let Some(reason) = self.policy_denial(&command) {
            return self.deny(turn, command, reason, emit);
        }

        match self.resolve_approval(&command)? {
            ApprovalResolution::Approved => command.advance(CommandStatus::Approved)?,
            ApprovalResolution::Denied { reason } => {
                return self.deny(turn, command, reason, emit);
            }
        }

        command.advance(CommandStatus::Executing)?;
        emit(UiSignal::CommandStarted {
            action: command.action_type,
            fingerprint: command.fingerprint.clone(),
        });
        let request = ActionRequest::new(command.action_type, command.args.clone());
        let started = Instant::now();
        let outcome = self.executor.perform(&request, cancel);
        let duration_ms = started.elapsed().as_millis() as u64;

        if cancel.is_cancelled() {
            // Killed mid-flight: discard partial output, report nothing.
            command.advance(CommandStatus::Failed)?;
            let record = StepRecord {
                at: Utc::now(),
                step_id: command.origin_step_id.clone(),
                label: command.action_type.to_string(),
                outcome: StepOutcome::Failed,
                detail: "cancelled during execution".to_string(),
            };
            turn.record_step(record.clone());
            emit(UiSignal::StepUpdated { record });
            emit(UiSignal::CommandFinished {
                action: command.action_type,
                fingerprint: command.fingerprint.clone(),
                success: false,
                summary: "cancelled".to_string(),
            });
            return Ok((command, DispatchOutcome::Cancelled));
        }

        let result = execution_result(&command, &outcome, duration_ms);
        command.advance(if outcome.success {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        })?;
        let summary = summarize_payload(&outcome.payload);
        let record = StepRecord {
            at: Utc::now(),
            step_id: command.origin_step_id.clone(),
            label: command.action_type.to_string(),
            outcome: if outcome.success {
                StepOutcome::Completed
            } else {
                StepOutcome::Failed
            },
            detail: summary.clone(),
        };
        turn.record_step(record.clone());
        emit(UiSignal::StepUpdated { record });
        emit(UiSignal::CommandFinished {
            action: command.action_type,
            fingerprint: command.fingerprint.clone(),
            success: outcome.success,
            summary,
        });

        self.trailing.insert(command.fingerprint.clone());
        self.reporter.report(&ResultReport {
            turn_id: turn.id,
            step_id: command.origin_step_id.clone(),
            action: command.action_type,
            fingerprint: command.fingerprint.clone(),
            result: result.clone(),
            output: outcome.payload,
        });

        Ok((command, DispatchOutcome::Executed(result)))
    }

    fn deny(
        &self,
        turn: &mut Turn,
        mut command: Command,
        reason: String,
        emit: &dyn Fn(UiSignal),
    ) -> Result<(Command, DispatchOutcome)> {
        command.advance(CommandStatus::Denied)?;
        let record = denied_record(&command, &reason);
        turn.record_step(record.clone());
        emit(UiSignal::StepUpdated { record });
        emit(UiSignal::Notice {
            severity: NoticeSeverity::Transient,
            message: format!("{} denied: {reason}", command.action_type),
        });
        Ok((command, DispatchOutcome::Denied { reason }))
    }

    /// Secret-path guard, applied before approval is ever requested.
    fn policy_denial(&self, command: &Command) -> Option<String> {
        let key = command.action_type.path_arg()?;
        let raw = command.args.get(key).and_then(|v| v.as_str())?;
        self.policy.check_path(raw).err().map(|err| err.to_string())
    }

    fn resolve_approval(&mut self, command: &Command) -> Result<ApprovalResolution> {
        match command.approval {
            ApprovalRequirement::Auto => Ok(ApprovalResolution::Approved),
            ApprovalRequirement::Denied => Ok(ApprovalResolution::Denied {
                reason: "denied by policy".to_string(),
            }),
            ApprovalRequirement::Required => {
                let category = RiskCategory::of(command.action_type);
                if self.suppressed.contains(&category) {
                    return Ok(ApprovalResolution::Approved);
                }
                let Some(callback) = &self.approval else {
                    return Ok(ApprovalResolution::Denied {
                        reason: "approval required but no approver attached".to_string(),
                    });
                };
                let prompt = ApprovalPrompt {
                    action: command.action_type,
                    risk_markers: self.policy.risk_markers(command.action_type, &command.args),
                    reason: format!("{} requires approval", command.action_type),
                };
                // A prompt that errors out (or times out in the approver)
                // resolves as a denial, never as a turn-ending failure.
                let decision = match callback(&prompt) {
                    Ok(decision) => decision,
                    Err(err) => {
                        return Ok(ApprovalResolution::Denied {
                            reason: format!("approval unavailable: {err}"),
                        });
                    }
                };
                if !decision.approved {
                    return Ok(ApprovalResolution::Denied {
                        reason: "rejected by user".to_string(),
                    });
                }
                if decision.suppress_future_for_category {
                    self.suppressed.insert(category);
                }
                Ok(ApprovalResolution::Approved)
            }
        }
    }
}

enum ApprovalResolution {
    Approved,
    Denied { reason: String },
}

fn denied_record(command: &Command, reason: &str) -> StepRecord {
    StepRecord {
        at: Utc::now(),
        step_id: command.origin_step_id.clone(),
        label: command.action_type.to_string(),
        outcome: StepOutcome::Denied,
        detail: reason.to_string(),
    }
}

fn execution_result(
    command: &Command,
    outcome: &turnwire_exec::ActionOutcome,
    duration_ms: u64,
) -> ExecutionResult {
    let payload = &outcome.payload;
    ExecutionResult {
        command_fingerprint: command.fingerprint.clone(),
        exit_code: payload.get("status").and_then(|v| v.as_i64()).map(|v| v as i32),
        stdout: payload
            .get("stdout")
            .and_then(|v| v.as_str())
            .map(String::from),
        stderr: payload
            .get("stderr")
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| {
                payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(String::from)
            }),
        duration_ms,
        outcome: if outcome.success {
            ExecutionOutcome::Ok
        } else {
            ExecutionOutcome::Error
        },
    }
}

/// One-line description of an action payload for the step log and UI.
fn summarize_payload(payload: &serde_json::Value) -> String {
    if let Some(err) = payload.get("error").and_then(|v| v.as_str()) {
        return err.to_string();
    }
    if let Some(status) = payload.get("status").and_then(|v| v.as_i64()) {
        let timed_out = payload
            .get("timed_out")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        return if timed_out {
            format!("timed out (last status {status})")
        } else {
            format!("exit {status}")
        };
    }
    if payload.get("written").is_some() {
        return format!(
            "wrote {} bytes",
            payload.get("bytes").and_then(|v| v.as_u64()).unwrap_or(0)
        );
    }
    if payload.get("appended").is_some() {
        return format!(
            "appended {} bytes",
            payload.get("bytes").and_then(|v| v.as_u64()).unwrap_or(0)
        );
    }
    if payload.get("deleted").is_some() {
        return "deleted".to_string();
    }
    if let Some(count) = payload.get("count").and_then(|v| v.as_u64()) {
        return format!("{count} entries");
    }
    if let Some(size) = payload.get("size_bytes").and_then(|v| v.as_u64()) {
        return format!("read {size} bytes");
    }
    "ok".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use turnwire_core::{ActionType, DEFAULT_FINGERPRINT_CAP, TrustSettings};
    use turnwire_exec::ActionOutcome;

    struct RecordingExecutor {
        requests: Mutex<Vec<ActionRequest>>,
        succeed: bool,
    }

    impl RecordingExecutor {
        fn new(succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                succeed,
            })
        }

        fn count(&self) -> usize {
            self.requests.lock().expect("requests lock").len()
        }
    }

    impl ActionExecutor for RecordingExecutor {
        fn perform(&self, request: &ActionRequest, _cancel: &CancelToken) -> ActionOutcome {
            self.requests
                .lock()
                .expect("requests lock")
                .push(request.clone());
            if self.succeed {
                ActionOutcome {
                    success: true,
                    payload: json!({"written": true, "bytes": 2}),
                }
            } else {
                ActionOutcome {
                    success: false,
                    payload: json!({"error": "disk full"}),
                }
            }
        }
    }

    fn reporter() -> (tempfile::TempDir, Arc<ResultReporter>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let reporter = ResultReporter::disabled(dir.path()).expect("reporter");
        (dir, Arc::new(reporter))
    }

    fn supervised() -> PolicyEngine {
        PolicyEngine::from_settings(&TrustSettings::default()).expect("policy")
    }

    fn autonomous() -> PolicyEngine {
        PolicyEngine::from_settings(&TrustSettings {
            mode: "autonomous".to_string(),
            autonomous_shell: true,
            ..TrustSettings::default()
        })
        .expect("policy")
    }

    fn turn() -> Turn {
        let mut turn = Turn::new(DEFAULT_FINGERPRINT_CAP);
        assert!(turn.transition_to(turnwire_core::TurnState::Executing));
        turn
    }

    fn approve_all() -> ApprovalCallback {
        Arc::new(|_prompt| {
            Ok(ApprovalDecision {
                approved: true,
                suppress_future_for_category: false,
            })
        })
    }

    fn deny_all() -> ApprovalCallback {
        Arc::new(|_prompt| {
            Ok(ApprovalDecision {
                approved: false,
                suppress_future_for_category: false,
            })
        })
    }

    #[test]
    fn duplicate_fingerprint_executes_once() {
        let executor = RecordingExecutor::new(true);
        let (_dir, reporter) = reporter();
        let mut dispatcher = CommandDispatcher::new(
            autonomous(),
            executor.clone(),
            reporter,
            None,
            DEFAULT_TRAILING,
        );
        let mut turn = turn();
        let args = json!({"path": "a.txt", "content": "hi"});

        let first = dispatcher.build_command(ActionType::FsWrite, args.clone(), None, false);
        let second = dispatcher.build_command(ActionType::FsWrite, args, None, false);
        let (_, first_outcome) = dispatcher
            .dispatch(&mut turn, first, &CancelToken::new(), &|_| {})
            .expect("dispatch");
        let (_, second_outcome) = dispatcher
            .dispatch(&mut turn, second, &CancelToken::new(), &|_| {})
            .expect("dispatch");

        assert!(matches!(first_outcome, DispatchOutcome::Executed(_)));
        assert!(matches!(second_outcome, DispatchOutcome::Duplicate));
        assert_eq!(executor.count(), 1);
    }

    #[test]
    fn trailing_window_catches_replay_after_buffer_reset() {
        let executor = RecordingExecutor::new(true);
        let (_dir, reporter) = reporter();
        let mut dispatcher = CommandDispatcher::new(
            autonomous(),
            executor.clone(),
            reporter,
            None,
            DEFAULT_TRAILING,
        );
        let mut turn = turn();
        let args = json!({"path": "a.txt", "content": "hi"});

        let first = dispatcher.build_command(ActionType::FsWrite, args.clone(), None, false);
        dispatcher
            .dispatch(&mut turn, first, &CancelToken::new(), &|_| {})
            .expect("dispatch");

        // A duplicate ack would clear per-turn fingerprints; the trailing
        // window still refuses the replay.
        turn.reset_buffers();
        let replay = dispatcher.build_command(ActionType::FsWrite, args, None, false);
        let (_, outcome) = dispatcher
            .dispatch(&mut turn, replay, &CancelToken::new(), &|_| {})
            .expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::Duplicate));
        assert_eq!(executor.count(), 1);
    }

    #[test]
    fn shell_without_autonomy_is_denied_and_never_spawns() {
        let executor = RecordingExecutor::new(true);
        let (_dir, reporter) = reporter();
        // Supervised mode and no approver attached: deny by default.
        let mut dispatcher =
            CommandDispatcher::new(supervised(), executor.clone(), reporter, None, DEFAULT_TRAILING);
        let mut turn = turn();

        let command =
            dispatcher.build_command(ActionType::ShRun, json!({"cmd": "rm -rf /"}), None, false);
        let (command, outcome) = dispatcher
            .dispatch(&mut turn, command, &CancelToken::new(), &|_| {})
            .expect("dispatch");

        assert!(matches!(outcome, DispatchOutcome::Denied { .. }));
        assert_eq!(command.status, CommandStatus::Denied);
        assert_eq!(executor.count(), 0);
        assert_eq!(turn.step_log.len(), 1);
        assert_eq!(turn.step_log[0].outcome, StepOutcome::Denied);
    }

    #[test]
    fn user_rejection_denies_without_executing() {
        let executor = RecordingExecutor::new(true);
        let (_dir, reporter) = reporter();
        let mut dispatcher = CommandDispatcher::new(
            supervised(),
            executor.clone(),
            reporter,
            Some(deny_all()),
            DEFAULT_TRAILING,
        );
        let mut turn = turn();

        let command = dispatcher.build_command(
            ActionType::FsDelete,
            json!({"path": "precious"}),
            None,
            false,
        );
        let (_, outcome) = dispatcher
            .dispatch(&mut turn, command, &CancelToken::new(), &|_| {})
            .expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::Denied { .. }));
        assert_eq!(executor.count(), 0);
    }

    #[test]
    fn approver_failure_denies_instead_of_failing_the_turn() {
        let executor = RecordingExecutor::new(true);
        let (_dir, reporter) = reporter();
        let broken: ApprovalCallback =
            Arc::new(|_prompt| Err(anyhow::anyhow!("prompt timed out")));
        let mut dispatcher = CommandDispatcher::new(
            supervised(),
            executor.clone(),
            reporter,
            Some(broken),
            DEFAULT_TRAILING,
        );
        let mut turn = turn();

        let command = dispatcher.build_command(
            ActionType::FsDelete,
            json!({"path": "precious"}),
            None,
            false,
        );
        let (command, outcome) = dispatcher
            .dispatch(&mut turn, command, &CancelToken::new(), &|_| {})
            .expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::Denied { .. }));
        assert_eq!(command.status, CommandStatus::Denied);
        assert_eq!(executor.count(), 0);
    }

    #[test]
    fn approval_prompt_runs_approved_command() {
        let executor = RecordingExecutor::new(true);
        let (_dir, reporter) = reporter();
        let mut dispatcher = CommandDispatcher::new(
            supervised(),
            executor.clone(),
            reporter,
            Some(approve_all()),
            DEFAULT_TRAILING,
        );
        let mut turn = turn();

        let command = dispatcher.build_command(
            ActionType::FsWrite,
            json!({"path": "a.txt", "content": "hi"}),
            None,
            false,
        );
        let (command, outcome) = dispatcher
            .dispatch(&mut turn, command, &CancelToken::new(), &|_| {})
            .expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::Executed(_)));
        assert_eq!(command.status, CommandStatus::Completed);
        assert_eq!(executor.count(), 1);
    }

    #[test]
    fn suppressing_a_category_skips_later_prompts() {
        let executor = RecordingExecutor::new(true);
        let (_dir, reporter) = reporter();
        let prompts = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&prompts);
        let approval: ApprovalCallback = Arc::new(move |_prompt| {
            *counter.lock().expect("prompt lock") += 1;
            Ok(ApprovalDecision {
                approved: true,
                suppress_future_for_category: true,
            })
        });
        let mut dispatcher = CommandDispatcher::new(
            supervised(),
            executor.clone(),
            reporter,
            Some(approval),
            DEFAULT_TRAILING,
        );
        let mut turn = turn();

        for name in ["a.txt", "b.txt", "c.txt"] {
            let command = dispatcher.build_command(
                ActionType::FsWrite,
                json!({"path": name, "content": "x"}),
                None,
                false,
            );
            dispatcher
                .dispatch(&mut turn, command, &CancelToken::new(), &|_| {})
                .expect("dispatch");
        }

        assert_eq!(executor.count(), 3);
        assert_eq!(*prompts.lock().expect("prompt lock"), 1);
    }

    #[test]
    fn secret_path_is_denied_before_any_prompt() {
        let executor = RecordingExecutor::new(true);
        let (_dir, reporter) = reporter();
        let prompts = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&prompts);
        let approval: ApprovalCallback = Arc::new(move |_prompt| {
            *counter.lock().expect("prompt lock") += 1;
            Ok(ApprovalDecision {
                approved: true,
                suppress_future_for_category: false,
            })
        });
        let mut dispatcher = CommandDispatcher::new(
            autonomous(),
            executor.clone(),
            reporter,
            Some(approval),
            DEFAULT_TRAILING,
        );
        let mut turn = turn();

        let command = dispatcher.build_command(
            ActionType::FsRead,
            json!({"path": ".ssh/id_ed25519"}),
            None,
            false,
        );
        let (_, outcome) = dispatcher
            .dispatch(&mut turn, command, &CancelToken::new(), &|_| {})
            .expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::Denied { .. }));
        assert_eq!(executor.count(), 0);
        assert_eq!(*prompts.lock().expect("prompt lock"), 0);
    }

    #[test]
    fn failed_execution_still_counts_as_executed() {
        let executor = RecordingExecutor::new(false);
        let (_dir, reporter) = reporter();
        let mut dispatcher = CommandDispatcher::new(
            autonomous(),
            executor.clone(),
            reporter,
            None,
            DEFAULT_TRAILING,
        );
        let mut turn = turn();

        let command = dispatcher.build_command(
            ActionType::FsWrite,
            json!({"path": "a.txt", "content": "hi"}),
            None,
            false,
        );
        let (command, outcome) = dispatcher
            .dispatch(&mut turn, command, &CancelToken::new(), &|_| {})
            .expect("dispatch");
        match outcome {
            DispatchOutcome::Executed(result) => {
                assert_eq!(result.outcome, ExecutionOutcome::Error);
                assert_eq!(result.stderr.as_deref(), Some("disk full"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(command.status, CommandStatus::Failed);
    }

    #[test]
    fn signals_bracket_an_execution() {
        let executor = RecordingExecutor::new(true);
        let (_dir, reporter) = reporter();
        let mut dispatcher =
            CommandDispatcher::new(autonomous(), executor, reporter, None, DEFAULT_TRAILING);
        let mut turn = turn();
        let signals = Mutex::new(Vec::new());

        let command = dispatcher.build_command(
            ActionType::FsWrite,
            json!({"path": "a.txt", "content": "hi"}),
            Some("step-3".to_string()),
            false,
        );
        dispatcher
            .dispatch(&mut turn, command, &CancelToken::new(), &|signal| {
                signals.lock().expect("signals lock").push(signal);
            })
            .expect("dispatch");

        let signals = signals.into_inner().expect("signals lock");
        assert_eq!(signals.len(), 3);
        assert!(matches!(signals[0], UiSignal::CommandStarted { .. }));
        assert!(matches!(signals[1], UiSignal::StepUpdated { .. }));
        assert!(matches!(
            &signals[2],
            UiSignal::CommandFinished { success: true, .. }
        ));
    }

    #[test]
    fn denial_emits_a_notice_but_never_a_start() {
        let executor = RecordingExecutor::new(true);
        let (_dir, reporter) = reporter();
        let mut dispatcher =
            CommandDispatcher::new(supervised(), executor, reporter, None, DEFAULT_TRAILING);
        let mut turn = turn();
        let signals = Mutex::new(Vec::new());

        let command =
            dispatcher.build_command(ActionType::ShRun, json!({"cmd": "ls"}), None, false);
        dispatcher
            .dispatch(&mut turn, command, &CancelToken::new(), &|signal| {
                signals.lock().expect("signals lock").push(signal);
            })
            .expect("dispatch");

        let signals = signals.into_inner().expect("signals lock");
        assert_eq!(signals.len(), 2);
        assert!(matches!(signals[0], UiSignal::StepUpdated { .. }));
        assert!(matches!(signals[1], UiSignal::Notice { .. }));
    }

    #[test]
    fn pre_cancelled_dispatch_touches_nothing() {
        let executor = RecordingExecutor::new(true);
        let (_dir, reporter) = reporter();
        let mut dispatcher = CommandDispatcher::new(
            autonomous(),
            executor.clone(),
            reporter,
            None,
            DEFAULT_TRAILING,
        );
        let mut turn = turn();
        let cancel = CancelToken::new();
        cancel.cancel();

        let command = dispatcher.build_command(
            ActionType::FsWrite,
            json!({"path": "a.txt", "content": "hi"}),
            None,
            false,
        );
        let (command, outcome) = dispatcher
            .dispatch(&mut turn, command, &cancel, &|_| {})
            .expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::Cancelled));
        assert_eq!(command.status, CommandStatus::Pending);
        assert_eq!(executor.count(), 0);
        assert!(turn.step_log.is_empty());
    }

    const DEFAULT_TRAILING: usize = 64;
}
