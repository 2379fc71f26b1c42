use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use thiserror::Error;

const DEFAULT_MAX_CAPTURE_BYTES: usize = 1024 * 1024;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn max_capture_bytes() -> usize {
    std::env::var("QUIVER_MAX_CAPTURE_BYTES")
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_CAPTURE_BYTES)
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Sentinel error for an abandoned subprocess. Callers downcast to tell a
/// hung collaborator apart from an ordinary failure.
#[derive(Debug, Error)]
#[error("`{program}` did not finish within {seconds}s and was killed")]
pub struct CommandTimeout {
    pub program: String,
    pub seconds: u64,
}

/// Execute a program, capture stdout/stderr, and enforce an optional
/// deadline. On deadline the child is killed and [`CommandTimeout`] is
/// returned; the command is never retried here.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned, its streams cannot
/// be read, or the deadline expires.
pub fn run_command(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
    timeout: Option<Duration>,
) -> Result<RunOutput> {
    let mut command = configured_command(program, args, envs, cwd);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout missing for {program}"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr missing for {program}"))?;
    let limit = max_capture_bytes();
    let stdout_handle = thread::spawn(move || read_to_string_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_to_string_limited(stderr, limit));

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed to wait for {program}"))?
        {
            break status;
        }
        if let Some(deadline) = timeout {
            if started.elapsed() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                // Drain the reader threads so the pipes close cleanly.
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(anyhow!(CommandTimeout {
                    program: program.to_string(),
                    seconds: deadline.as_secs(),
                }));
            }
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    };

    let code = status.code().unwrap_or(-1);
    let (mut stdout, stdout_truncated) = stdout_handle
        .join()
        .map_err(|_| anyhow!("stdout thread panicked"))??;
    let (mut stderr, stderr_truncated) = stderr_handle
        .join()
        .map_err(|_| anyhow!("stderr thread panicked"))??;
    if stdout_truncated {
        stdout.push_str("\n[...truncated...]\n");
    }
    if stderr_truncated {
        stderr.push_str("\n[...truncated...]\n");
    }
    Ok(RunOutput {
        code,
        stdout,
        stderr,
    })
}

/// Execute a program with inherited stdio for interactive tools. No
/// deadline: a user-facing tool may legitimately run for hours.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned.
pub fn run_command_passthrough(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
) -> Result<RunOutput> {
    let mut command = configured_command(program, args, envs, cwd);
    command.stdin(Stdio::inherit());
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());

    let status = command
        .status()
        .with_context(|| format!("failed to start {program}"))?;
    let code = status.code().unwrap_or(-1);
    Ok(RunOutput {
        code,
        stdout: String::new(),
        stderr: String::new(),
    })
}

fn configured_command(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
) -> Command {
    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.current_dir(cwd);
    command
}

fn read_to_string_limited(mut reader: impl Read, limit: usize) -> Result<(String, bool)> {
    let mut buffer = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        append_limited(&mut buffer, &chunk[..read], limit, &mut truncated);
    }
    Ok((String::from_utf8_lossy(&buffer).to_string(), truncated))
}

fn append_limited(buffer: &mut Vec<u8>, chunk: &[u8], limit: usize, truncated: &mut bool) {
    if limit == 0 {
        return;
    }
    if buffer.len().saturating_add(chunk.len()) <= limit {
        buffer.extend_from_slice(chunk);
        return;
    }
    *truncated = true;
    let old_len = buffer.len();
    let excess = old_len.saturating_add(chunk.len()).saturating_sub(limit);
    if excess >= old_len {
        buffer.clear();
        let drop_from_chunk = excess.saturating_sub(old_len).min(chunk.len());
        buffer.extend_from_slice(&chunk[drop_from_chunk..]);
    } else {
        buffer.drain(0..excess);
        buffer.extend_from_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn captures_output_and_status() -> Result<()> {
        let output = run_command(
            "/bin/sh",
            &[
                "-c".to_string(),
                "printf out && printf err >&2; exit 7".to_string(),
            ],
            &[],
            Path::new("."),
            None,
        )?;
        assert_eq!(output.code, 7);
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn deadline_kills_and_reports_timeout() {
        let err = run_command(
            "/bin/sh",
            &["-c".to_string(), "sleep 30".to_string()],
            &[],
            Path::new("."),
            Some(Duration::from_millis(200)),
        )
        .unwrap_err();
        let timeout = err
            .downcast_ref::<CommandTimeout>()
            .expect("timeout sentinel");
        assert_eq!(timeout.program, "/bin/sh");
    }

    #[cfg(unix)]
    #[test]
    fn large_output_is_truncated() -> Result<()> {
        let bytes = DEFAULT_MAX_CAPTURE_BYTES + 1024;
        let output = run_command(
            "/bin/sh",
            &[
                "-c".to_string(),
                format!("head -c {bytes} /dev/zero | tr '\\0' a"),
            ],
            &[],
            Path::new("."),
            None,
        )?;
        assert!(output.stdout.contains("[...truncated...]"));
        assert!(output.stdout.len() <= DEFAULT_MAX_CAPTURE_BYTES + 64);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn passthrough_returns_status_only() -> Result<()> {
        let output = run_command_passthrough(
            "/bin/sh",
            &["-c".to_string(), "exit 3".to_string()],
            &[],
            Path::new("."),
        )?;
        assert_eq!(output.code, 3);
        assert!(output.stdout.is_empty());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn env_vars_reach_the_child() -> Result<()> {
        let output = run_command(
            "/bin/sh",
            &["-c".to_string(), "printf \"$QUIVER_TEST_VAR\"".to_string()],
            &[("QUIVER_TEST_VAR".into(), "marker".into())],
            Path::new("."),
            None,
        )?;
        assert_eq!(output.stdout, "marker");
        Ok(())
    }
}
