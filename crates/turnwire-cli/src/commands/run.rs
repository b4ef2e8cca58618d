use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use turnwire_core::{AppConfig, ApprovalDecision, NoticeSeverity, TurnState, UiCallback, UiSignal};
use turnwire_exec::LocalExecutor;
use turnwire_observe::{Observer, ResultReporter};
use turnwire_policy::PolicyEngine;
use turnwire_runtime::TurnOrchestrator;
use turnwire_runtime::dispatch::{ApprovalCallback, CommandDispatcher};
use turnwire_stream::StreamClient;
use turnwire_ui::{SendCoordinator, standard_checks};

use crate::RunArgs;

pub fn run_turn_cmd(workspace: &Path, args: &RunArgs, json_out: bool, verbose: bool) -> Result<u8> {
    let mut cfg = AppConfig::load(workspace)?;
    if let Some(endpoint) = &args.endpoint {
        cfg.endpoint.base_url = endpoint.clone();
    }
    if let Some(mode) = &args.trust_mode {
        cfg.trust.mode = mode.clone();
    }
    if args.autonomous_shell {
        cfg.trust.autonomous_shell = true;
    }

    let policy = PolicyEngine::from_settings(&cfg.trust)?;
    let executor = LocalExecutor::new(workspace)?.with_limits(
        Duration::from_secs(cfg.limits.command_timeout_secs),
        cfg.limits.max_output_bytes,
    );
    let mut observer = Observer::new(workspace)?;
    observer.set_verbose(verbose || cfg.observe.verbose);
    let reporter = if args.no_report {
        ResultReporter::disabled(workspace)?
    } else {
        ResultReporter::new(workspace, &cfg.endpoint)?
    };
    let approval = if args.no_input {
        None
    } else {
        Some(stdin_approver())
    };
    let dispatcher = CommandDispatcher::new(
        policy,
        Arc::new(executor),
        Arc::new(reporter),
        approval,
        cfg.limits.trailing_window,
    );
    let source = Arc::new(StreamClient::new(cfg.endpoint.clone(), cfg.limits.clone())?);
    let orchestrator = TurnOrchestrator::new(
        source,
        dispatcher,
        observer,
        ui_printer(json_out, verbose),
        cfg.limits.clone(),
    );

    // Optimistic send: the draft goes into the transcript first, then the
    // pre-checks decide whether it actually leaves.
    let mut coordinator = SendCoordinator::new();
    coordinator.set_input(&args.input);
    let handle = coordinator.begin()?;
    let draft = match coordinator.resolve(handle, &standard_checks(&cfg.limits)) {
        Ok(draft) => draft,
        Err(err) => {
            eprintln!("[turnwire] send rejected: {err}");
            return Ok(1);
        }
    };

    let report = orchestrator.run_turn(&draft)?;

    if json_out {
        let payload = json!({
            "turn_id": report.turn_id,
            "state": report.state,
            "text": report.text,
            "plan": report.plan,
            "final": report.final_summary,
            "steps": report.steps,
            "executed": report.executed,
            "denied": report.denied,
            "duplicates": report.duplicates,
            "stream": report.stream.as_ref().map(|s| json!({
                "events_delivered": s.events_delivered,
                "malformed_frames": s.malformed_frames,
                "reconnects": s.reconnects,
                "ended_cleanly": s.ended_cleanly,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        if !report.text.is_empty() {
            println!();
        }
        eprintln!(
            "[turnwire] turn {:?}: {} executed, {} denied, {} duplicates",
            report.state, report.executed, report.denied, report.duplicates
        );
    }

    Ok(match report.state {
        TurnState::Completed => 0,
        TurnState::Cancelled => 130,
        _ => 1,
    })
}

fn ui_printer(json_out: bool, verbose: bool) -> UiCallback {
    Arc::new(move |signal| match signal {
        UiSignal::TextDelta { text } => {
            if !json_out {
                print!("{text}");
                let _ = io::stdout().flush();
            }
        }
        UiSignal::Notice { severity, message } => match severity {
            NoticeSeverity::Terminal => eprintln!("[turnwire] turn failed: {message}"),
            NoticeSeverity::Transient => eprintln!("[turnwire] note: {message}"),
        },
        UiSignal::CommandStarted { action, .. } => {
            if !json_out {
                eprintln!("[turnwire] running {action}...");
            }
        }
        UiSignal::CommandFinished {
            action,
            success,
            summary,
            ..
        } => {
            if !json_out {
                let tag = if success { "ok" } else { "failed" };
                eprintln!("[turnwire] {action} {tag}: {summary}");
            }
        }
        UiSignal::StateChanged { state, .. } => {
            if verbose && !json_out {
                eprintln!("[turnwire] state: {state:?}");
            }
        }
        UiSignal::StepUpdated { record } => {
            if verbose && !json_out {
                eprintln!(
                    "[turnwire] step {:?}: {} {}",
                    record.outcome, record.label, record.detail
                );
            }
        }
    })
}

/// Blocking terminal prompt. Answering `a` approves and stops prompting for
/// this risk category for the rest of the session.
fn stdin_approver() -> ApprovalCallback {
    Arc::new(|prompt| {
        eprintln!();
        eprintln!(
            "[turnwire] approval needed: {} [{}]",
            prompt.action,
            prompt.risk_markers.join(", ")
        );
        eprint!("[turnwire] {}: allow? [y]es / [N]o / [a]lways: ", prompt.reason);
        io::stderr().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        let answer = line.trim().to_ascii_lowercase();
        Ok(ApprovalDecision {
            approved: matches!(answer.as_str(), "y" | "yes" | "a" | "always"),
            suppress_future_for_category: matches!(answer.as_str(), "a" | "always"),
        })
    })
}
