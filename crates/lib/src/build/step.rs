//! Shell step execution.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, trace};

/// How a step ended.
#[derive(Debug)]
pub(super) enum StepStatus {
  Exited(ExitStatus),
  TimedOut,
}

/// How long output readers may keep draining once the step process has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Result of running one step: its status and combined stdout/stderr.
#[derive(Debug)]
pub(super) struct StepOutput {
  pub status: StepStatus,
  pub output: Vec<u8>,
}

/// Run `script` through `shell` with exactly `env` as its environment.
///
/// Stdout and stderr are merged line by line. With a timeout the process is
/// killed once the limit passes. Background processes the script leaves behind
/// may keep the pipes open, so output is only collected for a short grace
/// period after exit, never beyond what remains of the timeout.
pub(super) async fn run_step(
  shell: &str,
  script: &str,
  cwd: &Path,
  env: &BTreeMap<String, String>,
  timeout: Option<Duration>,
) -> std::io::Result<StepOutput> {
  let (shell_cmd, shell_args) = shell_invocation(shell);

  let mut command = Command::new(&shell_cmd);
  command
    .args(&shell_args)
    .arg(script)
    .current_dir(cwd)
    .env_clear()
    .envs(env)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  debug!(shell = %shell_cmd, cwd = %cwd.display(), "spawning step");
  let mut child = command.spawn()?;
  let started = Instant::now();

  let output = Arc::new(Mutex::new(Vec::new()));
  let mut readers = Vec::with_capacity(2);
  if let Some(stdout) = child.stdout.take() {
    readers.push(tokio::spawn(collect_lines(stdout, output.clone())));
  }
  if let Some(stderr) = child.stderr.take() {
    readers.push(tokio::spawn(collect_lines(stderr, output.clone())));
  }

  let status = match timeout {
    Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
      Ok(status) => StepStatus::Exited(status?),
      Err(_) => {
        child.kill().await?;
        StepStatus::TimedOut
      }
    },
    None => StepStatus::Exited(child.wait().await?),
  };

  if let StepStatus::Exited(_) = status {
    let drain = match timeout {
      Some(limit) => OUTPUT_DRAIN_GRACE.min(limit.saturating_sub(started.elapsed())),
      None => OUTPUT_DRAIN_GRACE,
    };
    let drained = tokio::time::timeout(drain, async {
      for reader in readers.iter_mut() {
        let _ = reader.await;
      }
    })
    .await;
    if drained.is_err() {
      debug!("step left processes holding its output open");
    }
  }
  for reader in &readers {
    reader.abort();
  }

  let output = std::mem::take(&mut *output.lock().unwrap_or_else(|p| p.into_inner()));
  Ok(StepOutput { status, output })
}

async fn collect_lines<R: AsyncRead + Unpin>(stream: R, sink: Arc<Mutex<Vec<u8>>>) {
  let mut reader = BufReader::new(stream);
  let mut line = Vec::new();
  loop {
    line.clear();
    match reader.read_until(b'\n', &mut line).await {
      Ok(0) | Err(_) => break,
      Ok(_) => {
        trace!(line = %String::from_utf8_lossy(&line).trim_end(), "step output");
        sink.lock().unwrap_or_else(|p| p.into_inner()).extend_from_slice(&line);
      }
    }
  }
}

/// Shell program and the arguments that precede the script.
fn shell_invocation(shell: &str) -> (String, Vec<String>) {
  let args = if shell.contains("powershell") || shell.contains("pwsh") {
    vec!["-NoProfile".to_string(), "-Command".to_string()]
  } else if shell.ends_with("cmd") || shell.ends_with("cmd.exe") {
    vec!["/C".to_string()]
  } else {
    vec!["-c".to_string()]
  };
  (shell.to_string(), args)
}

/// The last `limit` bytes of `output`, decoded lossily.
pub(super) fn output_tail(output: &[u8], limit: usize) -> String {
  let start = output.len().saturating_sub(limit);
  String::from_utf8_lossy(&output[start..]).into_owned()
}
