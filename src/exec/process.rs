//! Child-process execution with streaming, timeout, and cancellation

use anyhow::{Context as _, Result};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;

use crate::domain::{LogEntry, Phase, ShellKind, WorkSpec};

use super::context::{CancelSignal, ExecutionContext};

/// Outcome of running one work spec
#[derive(Debug, Clone, Default)]
pub struct SpecOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub agent_session_id: Option<String>,
    pub canceled: bool,
    pub timed_out: bool,
}

impl SpecOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

pub(super) struct StreamedRun {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub canceled: bool,
    pub timed_out: bool,
}

/// Run a command, streaming stdout/stderr lines to the callbacks.
///
/// Cancellation and a spec timeout both take the same path: terminate
/// gracefully, hard-kill after the grace period, and report which trigger
/// fired.
pub(super) async fn run_streaming_command(
    mut cmd: Command,
    timeout_ms: Option<u64>,
    cancel: &CancelSignal,
    kill_grace: Duration,
    pid_notify: Option<&UnboundedSender<u32>>,
    mut on_stdout: impl FnMut(String),
    mut on_stderr: impl FnMut(String),
) -> Result<StreamedRun> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("Failed to spawn process")?;

    if let (Some(tx), Some(pid)) = (pid_notify, child.id()) {
        let _ = tx.send(pid);
    }

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_done = false;
    let mut err_done = false;

    let timer = tokio::time::sleep(Duration::from_millis(timeout_ms.unwrap_or(u64::MAX)));
    tokio::pin!(timer);

    let mut canceled = false;
    let mut timed_out = false;

    while !(out_done && err_done) {
        tokio::select! {
            line = out_lines.next_line(), if !out_done => match line {
                Ok(Some(line)) => on_stdout(line),
                _ => out_done = true,
            },
            line = err_lines.next_line(), if !err_done => match line {
                Ok(Some(line)) => on_stderr(line),
                _ => err_done = true,
            },
            _ = cancel.cancelled(), if !canceled && !timed_out => {
                canceled = true;
                terminate_child(&mut child, kill_grace).await;
            }
            _ = &mut timer, if timeout_ms.is_some() && !canceled && !timed_out => {
                timed_out = true;
                terminate_child(&mut child, kill_grace).await;
            }
        }
    }

    let status = child.wait().await.context("Failed to wait on process")?;

    Ok(StreamedRun {
        exit_code: status.code(),
        success: status.success() && !canceled && !timed_out,
        canceled,
        timed_out,
    })
}

/// SIGTERM, wait out the grace period, then SIGKILL
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    let _ = child.kill().await;
}

/// Run a `process` or `shell` work spec in the worktree
pub(super) async fn run_command_spec(
    ctx: &ExecutionContext,
    phase: Phase,
    spec: &WorkSpec,
) -> SpecOutcome {
    let (program, args, env, cwd, timeout) = match spec {
        WorkSpec::Process {
            executable,
            args,
            env,
            cwd,
            timeout,
            ..
        } => (
            executable.clone(),
            args.clone(),
            env.clone(),
            cwd.clone(),
            *timeout,
        ),
        WorkSpec::Shell {
            command,
            shell,
            env,
            cwd,
            timeout,
            ..
        } => {
            let kind = (*shell).unwrap_or_else(default_shell);
            let (program, flag) = kind.invocation();
            (
                program.to_string(),
                vec![flag.to_string(), command.clone()],
                env.clone(),
                cwd.clone(),
                *timeout,
            )
        }
        WorkSpec::Agent { .. } => {
            return SpecOutcome::failed("Agent specs are executed by the agent runner");
        }
    };

    let mut cmd = Command::new(&program);
    cmd.args(&args);
    cmd.current_dir(resolve_cwd(&ctx.worktree_path, cwd.as_deref()));
    if let Some(env) = &env {
        apply_env(&mut cmd, env);
    }

    let log = ctx.log.clone();
    let log_err = ctx.log.clone();
    let run = run_streaming_command(
        cmd,
        timeout,
        &ctx.cancel,
        ctx.kill_grace,
        ctx.pid_notify.as_ref(),
        move |line| log.append(LogEntry::stdout(phase, line)),
        move |line| log_err.append(LogEntry::stderr(phase, line)),
    )
    .await;

    match run {
        Ok(run) => SpecOutcome {
            success: run.success,
            error: outcome_error(&run, &program),
            exit_code: run.exit_code,
            agent_session_id: None,
            canceled: run.canceled,
            timed_out: run.timed_out,
        },
        Err(e) => SpecOutcome::failed(format!("{e:#}")),
    }
}

fn outcome_error(run: &StreamedRun, program: &str) -> Option<String> {
    if run.canceled {
        Some("canceled".to_string())
    } else if run.timed_out {
        Some(format!("{program} timed out"))
    } else if !run.success {
        Some(match run.exit_code {
            Some(code) => format!("{program} exited with status {code}"),
            None => format!("{program} was terminated by a signal"),
        })
    } else {
        None
    }
}

fn default_shell() -> ShellKind {
    if cfg!(windows) {
        ShellKind::Cmd
    } else {
        ShellKind::Sh
    }
}

fn resolve_cwd(worktree: &Path, cwd: Option<&str>) -> std::path::PathBuf {
    match cwd {
        Some(rel) => worktree.join(rel),
        None => worktree.to_path_buf(),
    }
}

fn apply_env(cmd: &mut Command, env: &HashMap<String, String>) {
    for (key, value) in env {
        cmd.env(key, value);
    }
}
