use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};

use crate::error::ProcessingError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Trailing stderr lines kept for the failure message.
const STDERR_TAIL: usize = 20;

fn forward<R: Read + Send + 'static>(
    tool: String,
    stream: &'static str,
    reader: R,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            let Ok(line) = line else { break };
            debug!(tool = %tool, stream, "{line}");
            if let Some(tail) = &tail
                && let Ok(mut guard) = tail.lock()
            {
                if guard.len() == STDERR_TAIL {
                    guard.pop_front();
                }
                guard.push_back(line);
            }
        }
    })
}

/// Runs `command` to completion, forwarding its output to the log. Exceeding
/// `timeout` kills the child.
pub fn run_command(tool: &str, mut command: Command, timeout: Duration) -> Result<()> {
    debug!(tool, ?command, timeout_secs = timeout.as_secs(), "Spawning tool");
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| ProcessingError::ToolFailed {
            tool: tool.to_string(),
            message: format!("failed to start: {err}"),
        })?;

    let tail = Arc::new(Mutex::new(VecDeque::new()));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward(tool.to_string(), "stdout", stdout, None));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward(tool.to_string(), "stderr", stderr, Some(tail.clone())));
    }

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!(tool, timeout_secs = timeout.as_secs(), "Tool timed out; killing");
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProcessingError::ToolTimeout {
                tool: tool.to_string(),
                timeout,
            }
            .into());
        }
        thread::sleep(POLL_INTERVAL);
    };
    for reader in readers {
        let _ = reader.join();
    }

    if !status.success() {
        let stderr = tail
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();
        let message = if stderr.is_empty() {
            format!("exited with {status}")
        } else {
            format!("exited with {status}: {stderr}")
        };
        return Err(ProcessingError::ToolFailed {
            tool: tool.to_string(),
            message,
        }
        .into());
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::find_processing_error;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn success_returns_ok() {
        run_command("shell", sh("echo hello"), Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn nonzero_exit_carries_stderr() {
        let err = run_command("shell", sh("echo broken >&2; exit 3"), Duration::from_secs(5))
            .unwrap_err();
        match find_processing_error(&err) {
            Some(ProcessingError::ToolFailed { message, .. }) => {
                assert!(message.contains("broken"), "{message}")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn slow_tool_is_killed() {
        let started = Instant::now();
        let err = run_command("shell", sh("sleep 5"), Duration::from_millis(200)).unwrap_err();
        assert!(matches!(
            find_processing_error(&err),
            Some(ProcessingError::ToolTimeout { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_binary_is_a_tool_failure() {
        let err = run_command(
            "siril",
            Command::new("stackwright-no-such-binary"),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(find_processing_error(&err).unwrap().is_tool());
    }
}
