//! Agent work runner
//!
//! Launches the configured agent CLI headless in the node's worktree,
//! streams its stream-JSON output into the log store, and captures the
//! session id for later resumption.

use std::collections::BTreeSet;
use tokio::process::Command;

use crate::domain::{LogEntry, Phase, WorkSpec};

use super::context::ExecutionContext;
use super::process::{SpecOutcome, run_streaming_command};

pub(super) async fn run_agent_spec(
    ctx: &ExecutionContext,
    phase: Phase,
    spec: &WorkSpec,
) -> SpecOutcome {
    let WorkSpec::Agent {
        instructions,
        model,
        model_tier,
        context,
        max_turns,
        allowed_folders,
        allowed_urls,
        timeout,
        ..
    } = spec
    else {
        return SpecOutcome::failed("Not an agent spec");
    };

    let mut args = ctx.agent.run_args.clone();

    if let Some(model) = ctx.agent.resolve_model(model.as_deref(), *model_tier) {
        args.push("--model".to_string());
        args.push(model);
    }
    if let Some(turns) = max_turns {
        args.push("--max-turns".to_string());
        args.push(turns.to_string());
    }
    if let Some(session) = &ctx.resume_session_id {
        args.push("--resume".to_string());
        args.push(session.clone());
    }

    // The worktree is always in the allowed set; an agent never gets the
    // workspace root implicitly.
    let mut folders: BTreeSet<String> = allowed_folders
        .as_deref()
        .unwrap_or_default()
        .iter()
        .cloned()
        .collect();
    folders.insert(ctx.worktree_path.display().to_string());
    for folder in &folders {
        args.push("--add-dir".to_string());
        args.push(folder.clone());
    }

    let prompt = build_prompt(
        instructions,
        ctx.node.instructions.as_deref(),
        context.as_deref(),
        allowed_urls.as_deref(),
    );
    args.push("--".to_string());
    args.push(prompt);

    let mut cmd = Command::new(&ctx.agent.binary);
    cmd.args(&args);
    cmd.current_dir(&ctx.worktree_path);

    let log = ctx.log.clone();
    let log_err = ctx.log.clone();
    let mut session_id: Option<String> = None;
    let mut agent_reported_success = false;
    let mut saw_result = false;
    let mut agent_error: Option<String> = None;

    let run = run_streaming_command(
        cmd,
        *timeout,
        &ctx.cancel,
        ctx.kill_grace,
        ctx.pid_notify.as_ref(),
        |line| {
            match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(event) => {
                    let kind = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
                    match kind {
                        "system" => {
                            if let Some(sid) = event.get("session_id").and_then(|s| s.as_str()) {
                                session_id = Some(sid.to_string());
                            }
                            log.append(LogEntry::info(phase, summarize_event(&event)));
                        }
                        "result" => {
                            saw_result = true;
                            let subtype =
                                event.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
                            agent_reported_success = subtype == "success";
                            if !agent_reported_success {
                                agent_error = Some(format!("agent result: {subtype}"));
                            }
                            log.append(LogEntry::info(phase, summarize_event(&event)));
                        }
                        _ => log.append(LogEntry::stdout(phase, summarize_event(&event))),
                    }
                }
                Err(_) => log.append(LogEntry::stdout(phase, line)),
            }
        },
        |line| log_err.append(LogEntry::stderr(phase, line)),
    )
    .await;

    let run = match run {
        Ok(run) => run,
        Err(e) => return SpecOutcome::failed(format!("{e:#}")),
    };

    // Agents that do not emit a result event are judged by their exit code.
    let success = if saw_result {
        agent_reported_success && run.success
    } else {
        run.success
    };

    let error = if run.canceled {
        Some("canceled".to_string())
    } else if run.timed_out {
        Some("agent timed out".to_string())
    } else if !success {
        agent_error.or_else(|| {
            Some(match run.exit_code {
                Some(code) => format!("agent exited with status {code}"),
                None => "agent was terminated by a signal".to_string(),
            })
        })
    } else {
        None
    };

    SpecOutcome {
        success,
        error,
        exit_code: run.exit_code,
        agent_session_id: session_id,
        canceled: run.canceled,
        timed_out: run.timed_out,
    }
}

/// Assemble the prompt from the spec, the node hint, and the access lists
fn build_prompt(
    instructions: &str,
    node_hint: Option<&str>,
    context_files: Option<&[String]>,
    allowed_urls: Option<&[String]>,
) -> String {
    let mut prompt = instructions.trim().to_string();

    if let Some(hint) = node_hint.map(str::trim).filter(|h| !h.is_empty()) {
        prompt.push_str("\n\n");
        prompt.push_str(hint);
    }

    if let Some(files) = context_files.filter(|f| !f.is_empty()) {
        prompt.push_str("\n\nRelevant files:\n");
        for file in files {
            prompt.push_str(&format!("- {file}\n"));
        }
    }

    if let Some(urls) = allowed_urls.filter(|u| !u.is_empty()) {
        prompt.push_str("\n\nYou may only fetch these URLs:\n");
        for url in urls {
            prompt.push_str(&format!("- {url}\n"));
        }
    }

    prompt.push_str(
        "\n\nWork only inside the current directory. \
        Do not commit; leave your changes in the working tree.",
    );
    prompt
}

/// One-line rendering of a stream event for the log
fn summarize_event(event: &serde_json::Value) -> String {
    let kind = event.get("type").and_then(|t| t.as_str()).unwrap_or("event");

    if kind == "assistant" {
        let mut parts = Vec::new();
        if let Some(content) = event
            .pointer("/message/content")
            .and_then(|c| c.as_array())
        {
            for block in content {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            parts.push(text.to_string());
                        }
                    }
                    Some("tool_use") => {
                        let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("tool");
                        parts.push(format!("[{name}]"));
                    }
                    _ => {}
                }
            }
        }
        if !parts.is_empty() {
            return parts.join(" ");
        }
    }

    let mut compact = event.to_string();
    const MAX_LEN: usize = 500;
    if compact.len() > MAX_LEN {
        let mut end = MAX_LEN;
        while !compact.is_char_boundary(end) {
            end -= 1;
        }
        compact.truncate(end);
        compact.push_str("...");
    }
    compact
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_hint_and_access_lists() {
        let prompt = build_prompt(
            "Fix the bug",
            Some("Prefer small diffs"),
            Some(&["src/lib.rs".to_string()]),
            Some(&["https://docs.rs".to_string()]),
        );
        assert!(prompt.starts_with("Fix the bug"));
        assert!(prompt.contains("Prefer small diffs"));
        assert!(prompt.contains("src/lib.rs"));
        assert!(prompt.contains("https://docs.rs"));
        assert!(prompt.contains("Do not commit"));
    }

    #[test]
    fn assistant_events_render_text_and_tools() {
        let event: serde_json::Value = serde_json::from_str(
            r#"{"type":"assistant","message":{"content":[
                {"type":"text","text":"Looking at the tests"},
                {"type":"tool_use","name":"Bash","input":{}}
            ]}}"#,
        )
        .unwrap();
        let summary = summarize_event(&event);
        assert!(summary.contains("Looking at the tests"));
        assert!(summary.contains("[Bash]"));
    }
}
