use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::app::error::AppError;

/// Status-class commands (list, reboot, shell).
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(30);
/// Backup/restore/flash-class commands.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(600);
/// Version probes should answer almost immediately.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout and stderr concatenated, for parsers that must scan both
    /// (the bootloader tool writes most of its output to stderr).
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&self.stderr);
        }
        combined
    }
}

pub fn run_tool(program: &str, args: &[String], trace_id: &str) -> Result<CommandOutput, AppError> {
    run_tool_with_timeout(program, args, SHORT_TIMEOUT, trace_id)
}

/// Runs one external-tool invocation to completion or timeout. A
/// timeout kills the child and is reported the same way as a failed
/// invocation; spawn errors never escape as panics.
pub fn run_tool_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            AppError::command(format!("Failed to launch {program}: {err}"), trace_id)
        })?;

    // Drain stdout/stderr on their own threads; a chatty child blocks
    // once the pipe buffer fills and would then falsely hit the timeout.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;

    let stdout_handle = std::thread::spawn(move || drain(stdout));
    let stderr_handle = std::thread::spawn(move || drain(stderr));

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let stderr_bytes = stderr_handle.join().unwrap_or_default();
                    return Err(AppError::command(
                        format!(
                            "{program} timed out after {} seconds",
                            timeout.as_secs()
                        ),
                        trace_id,
                    )
                    .with_detail(String::from_utf8_lossy(&stderr_bytes).trim().to_string()));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::system(
                    format!("Failed to poll {program}: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

/// Converts a non-zero exit into a command error with the raw stderr
/// and exit code attached for the caller.
pub fn ensure_success(
    output: CommandOutput,
    what: &str,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    if output.success() {
        return Ok(output);
    }
    Err(
        AppError::command(format!("{what} failed"), trace_id).with_detail(format!(
            "exit code {:?}: {}",
            output.exit_code,
            output.stderr.trim()
        )),
    )
}

fn drain(mut reader: impl Read) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    let mut temp = [0u8; 4096];
    loop {
        match reader.read(&mut temp) {
            Ok(0) => break,
            Ok(count) => buffer.extend_from_slice(&temp[..count]),
            Err(_) => break,
        }
    }
    buffer
}

pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_failure_becomes_command_error() {
        let err = run_tool("/no/such/binary/droiddock-test", &[], "trace-test")
            .expect_err("must fail");
        assert_eq!(err.code, "ERR_COMMAND");
    }

    #[test]
    fn nonzero_exit_is_reported_by_ensure_success() {
        let output = CommandOutput {
            stdout: String::new(),
            stderr: "boom".to_string(),
            exit_code: Some(1),
        };
        let err = ensure_success(output, "erase cache", "trace-test").expect_err("must fail");
        assert_eq!(err.code, "ERR_COMMAND");
        assert!(err.error.contains("erase cache"));
        assert!(err.detail.as_deref().unwrap_or_default().contains("boom"));
    }

    #[test]
    fn combined_output_joins_both_streams() {
        let output = CommandOutput {
            stdout: "product: blueline".to_string(),
            stderr: "Finished. Total time: 0.001s".to_string(),
            exit_code: Some(0),
        };
        let combined = output.combined();
        assert!(combined.contains("product: blueline"));
        assert!(combined.contains("Finished"));
    }

    #[cfg(unix)]
    #[test]
    fn does_not_deadlock_on_large_stdout() {
        // If stdout/stderr are piped but not drained, the child blocks
        // once the pipe buffer fills and an otherwise-fast command
        // "hangs" until the timeout.
        let shell_args = args(&[
            "-c",
            "i=0; while [ $i -lt 40000 ]; do echo 1234567890; i=$((i+1)); done",
        ]);
        let output =
            run_tool_with_timeout("sh", &shell_args, Duration::from_secs(10), "trace-test")
                .expect("large-output command should complete");
        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.len() >= 400_000);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_child() {
        let shell_args = args(&["-c", "sleep 5"]);
        let started = Instant::now();
        let err =
            run_tool_with_timeout("sh", &shell_args, Duration::from_millis(200), "trace-test")
                .expect_err("must time out");
        assert_eq!(err.code, "ERR_COMMAND");
        assert!(err.error.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
