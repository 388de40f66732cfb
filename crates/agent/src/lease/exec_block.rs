use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fleet_core::exec::{
    CommandResult, CommandSpec, CommandStatus, ExecBlockResult, ExecBlockSpec,
    EXEC_BLOCK_PAYLOAD_TYPE,
};
use fleet_core::{now_ms, Lease, LeaseOutcome, LeaseResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Child;

use super::handler::{LeaseContext, LeaseExecutor};
use super::registry::LeaseHandlerFactory;

/// Factory for `exec_block.v1` leases.
#[derive(Debug, Default)]
pub struct ExecBlockFactory;

impl LeaseHandlerFactory for ExecBlockFactory {
    fn payload_type(&self) -> &str {
        EXEC_BLOCK_PAYLOAD_TYPE
    }

    fn create_executor(&self, _lease: &Lease) -> Arc<dyn LeaseExecutor> {
        Arc::new(ExecBlockExecutor)
    }
}

/// Runs an exec block and writes a bundle.
///
/// Bundle layout:
/// `<working_dir>/leases/<lease_id>/{cmd-NNN.stdout.log,cmd-NNN.stderr.log,manifest.json}`
#[derive(Debug, Default)]
pub struct ExecBlockExecutor;

#[async_trait]
impl LeaseExecutor for ExecBlockExecutor {
    async fn execute(&self, ctx: LeaseContext) -> anyhow::Result<LeaseResult> {
        let spec: ExecBlockSpec =
            serde_json::from_slice(&ctx.payload).context("decode exec block payload")?;

        let bundle_root = ctx
            .session
            .working_dir()
            .join("leases")
            .join(sanitize_component(ctx.lease_id.as_str()));
        tokio::fs::create_dir_all(&bundle_root)
            .await
            .with_context(|| format!("create bundle dir {}", bundle_root.display()))?;

        let result = run_commands(&spec, &ctx, &bundle_root).await;
        if let Err(e) = write_manifest(&bundle_root, &result).await {
            tracing::warn!(lease_id = %ctx.lease_id, error = %format!("{e:#}"), "failed to write bundle manifest");
        }

        let outcome = block_outcome(&result);
        let output = serde_json::to_vec(&result).context("encode exec block result")?;
        Ok(LeaseResult {
            outcome,
            output: Some(output),
            session_result: None,
        })
    }
}

fn block_outcome(result: &ExecBlockResult) -> LeaseOutcome {
    if result
        .commands
        .iter()
        .any(|c| c.status == CommandStatus::Cancelled)
    {
        LeaseOutcome::Cancelled
    } else if result.error.is_none() {
        LeaseOutcome::Success
    } else {
        LeaseOutcome::Failed
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

async fn run_commands(spec: &ExecBlockSpec, ctx: &LeaseContext, bundle_root: &Path) -> ExecBlockResult {
    let started_at_ms = now_ms();
    let workdir = resolve_workdir(ctx.session.working_dir(), spec.workdir.as_deref());

    let mut results: Vec<CommandResult> = Vec::with_capacity(spec.commands.len());
    let mut overall_error: Option<String> = None;

    for (index, cmd) in spec.commands.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            overall_error.get_or_insert_with(|| "cancelled".to_string());
            break;
        }

        let result = run_command(index, cmd, spec, ctx, &workdir, bundle_root).await;
        let cmd_ok = result.status == CommandStatus::Succeeded;
        let cancelled = result.status == CommandStatus::Cancelled;
        if !cmd_ok {
            overall_error.get_or_insert_with(|| match &result.error {
                Some(e) => format!("command {index} failed: {e}"),
                None => format!("command {index} failed (exit={:?})", result.exit_code),
            });
        }
        results.push(result);

        if cancelled || (!cmd_ok && spec.halt_on_error) {
            break;
        }
    }

    ExecBlockResult {
        lease_id: ctx.lease_id.clone(),
        bundle_root: bundle_root.display().to_string(),
        started_at_ms,
        finished_at_ms: now_ms(),
        commands: results,
        error: overall_error,
    }
}

async fn run_command(
    index: usize,
    cmd: &CommandSpec,
    spec: &ExecBlockSpec,
    ctx: &LeaseContext,
    workdir: &Path,
    bundle_root: &Path,
) -> CommandResult {
    let cmd_started = now_ms();

    let stdout_name = format!("cmd-{index:03}.stdout.log");
    let stderr_name = format!("cmd-{index:03}.stderr.log");

    let failed = |error: String| CommandResult {
        index,
        program: cmd.program.clone(),
        args: cmd.args.clone(),
        cwd: cmd.cwd.clone(),
        started_at_ms: cmd_started,
        finished_at_ms: now_ms(),
        exit_code: None,
        status: CommandStatus::Failed,
        stdout_path: stdout_name.clone(),
        stderr_path: stderr_name.clone(),
        error: Some(error),
    };

    let (stdout_file, stderr_file) = match (
        std::fs::File::create(bundle_root.join(&stdout_name)),
        std::fs::File::create(bundle_root.join(&stderr_name)),
    ) {
        (Ok(out), Ok(err)) => (out, err),
        (Err(e), _) | (_, Err(e)) => return failed(format!("log file error: {e}")),
    };

    let cwd = cmd
        .cwd
        .as_ref()
        .map(|rel| workdir.join(rel))
        .unwrap_or_else(|| workdir.to_path_buf());

    let mut child = match tokio::process::Command::new(&cmd.program)
        .args(&cmd.args)
        .current_dir(&cwd)
        .envs(spec.env.iter())
        .envs(cmd.env.iter())
        .env("FLEET_LEASE_ID", ctx.lease_id.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file))
        .kill_on_drop(true)
        .spawn()
    {
        Ok(ch) => ch,
        Err(e) => return failed(format!("spawn failed: {e}")),
    };

    let waited = tokio::select! {
        waited = wait_with_timeout(&mut child, cmd.timeout_sec) => waited,
        _ = ctx.cancel.cancelled() => Waited::Cancelled,
    };

    let (status, exit_code, error) = match waited {
        Waited::Exited(Ok(st)) if st.success() => (CommandStatus::Succeeded, st.code(), None),
        Waited::Exited(Ok(st)) => (CommandStatus::Failed, st.code(), None),
        Waited::Exited(Err(e)) => (CommandStatus::Failed, None, Some(format!("wait failed: {e}"))),
        Waited::TimedOut => {
            let _ = child.kill().await;
            (CommandStatus::TimedOut, None, Some("timed out".to_string()))
        }
        Waited::Cancelled => {
            let _ = child.kill().await;
            (CommandStatus::Cancelled, None, Some("cancelled".to_string()))
        }
    };

    CommandResult {
        index,
        program: cmd.program.clone(),
        args: cmd.args.clone(),
        cwd: cmd.cwd.clone(),
        started_at_ms: cmd_started,
        finished_at_ms: now_ms(),
        exit_code,
        status,
        stdout_path: stdout_name,
        stderr_path: stderr_name,
        error,
    }
}

async fn wait_with_timeout(child: &mut Child, timeout_sec: Option<u64>) -> Waited {
    match timeout_sec {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), child.wait()).await {
            Ok(res) => Waited::Exited(res),
            Err(_) => Waited::TimedOut,
        },
        None => Waited::Exited(child.wait().await),
    }
}

fn resolve_workdir(working_dir: &Path, workdir: Option<&str>) -> PathBuf {
    match workdir {
        Some(dir) => working_dir.join(dir),
        None => working_dir.to_path_buf(),
    }
}

async fn write_manifest(bundle_root: &Path, result: &ExecBlockResult) -> anyhow::Result<()> {
    let manifest_path = bundle_root.join("manifest.json");
    let json = serde_json::to_vec_pretty(result).context("encode manifest")?;
    let mut f = tokio::fs::File::create(&manifest_path)
        .await
        .with_context(|| format!("create {}", manifest_path.display()))?;
    f.write_all(&json).await.context("write manifest")?;
    f.flush().await.context("flush manifest")?;
    Ok(())
}

fn sanitize_component(s: &str) -> String {
    s.replace([':', '/', '\\'], "_")
}
