//! External command execution for tapdeploy.
//!
//! Every tool tapdeploy drives (Composer, npm, git, the package manager,
//! the service manager) goes through [`run_command`], which captures
//! output, enforces an optional timeout and reports how long the command
//! ran.
//!
//! # Example
//!
//! ```ignore
//! use std::path::Path;
//! use std::time::Duration;
//! use tapdeploy_process::{CommandRequest, run_command};
//!
//! let req = CommandRequest::new("npm", ["ci"])
//!     .in_dir(Path::new("/srv/frontend/pl"))
//!     .with_timeout(Duration::from_secs(600));
//! let out = run_command(&req)?;
//! assert!(out.success());
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Description of a command to run.
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human-readable command line, used in events and receipts.
    pub fn display(&self) -> String {
        command_line(&self.program, &self.args)
    }
}

/// Captured result of a finished (or killed) command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal or timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Last `n` lines of stdout with credentials redacted.
    pub fn stdout_tail(&self, n: usize) -> String {
        tail_lines(&self.stdout, n)
    }

    /// Last `n` lines of stderr with credentials redacted.
    pub fn stderr_tail(&self, n: usize) -> String {
        tail_lines(&self.stderr, n)
    }
}

/// Run a command, capturing stdout/stderr and enforcing the request timeout.
///
/// Returns `Err` only when the process could not be spawned (for example the
/// program is not installed). A non-zero exit or a timeout is reported in
/// the returned [`CommandOutput`].
pub fn run_command(req: &CommandRequest) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(&req.program);
    command
        .args(&req.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &req.working_dir {
        command.current_dir(dir);
    }
    for (key, value) in &req.env {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn command: {}", req.display()))?;

    // Drain both pipes on their own threads so a chatty child cannot block
    // on a full pipe while we poll for exit.
    let stdout_reader = child.stdout.take().map(PipeReader::spawn);
    let stderr_reader = child.stderr.take().map(PipeReader::spawn);

    let (exit_code, timed_out) = match req.timeout {
        Some(timeout) => {
            let deadline = start + timeout;
            loop {
                if let Some(status) = child.try_wait().context("failed to poll command")? {
                    break (status.code(), false);
                }
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break (None, true);
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
        None => {
            let status = child.wait().context("failed to wait for command")?;
            (status.code(), false)
        }
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    // A killed child may leave grandchildren holding the pipes open; only
    // wait a short grace period for them in that case.
    let grace = if timed_out {
        Some(Duration::from_millis(500))
    } else {
        None
    };
    let stdout = stdout_reader.map(|r| r.finish(grace)).unwrap_or_default();
    let mut stderr = stderr_reader.map(|r| r.finish(grace)).unwrap_or_default();
    if timed_out && let Some(timeout) = req.timeout {
        stderr.push_str(&format!(
            "\ncommand timed out after {}",
            humantime::format_duration(timeout)
        ));
    }

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration_ms,
    })
}

struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: thread::JoinHandle<()>,
}

impl PipeReader {
    fn spawn<R: Read + Send + 'static>(mut pipe: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => match sink.lock() {
                        Ok(mut b) => b.extend_from_slice(&chunk[..n]),
                        Err(_) => break,
                    },
                }
            }
        });
        Self { buf, handle }
    }

    /// Collect what was read. With a grace period, gives up waiting for EOF
    /// once it elapses and returns the partial output.
    fn finish(self, grace: Option<Duration>) -> String {
        match grace {
            None => {
                let _ = self.handle.join();
            }
            Some(grace) => {
                let deadline = Instant::now() + grace;
                while !self.handle.is_finished() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
        let bytes = match self.buf.lock() {
            Ok(b) => b.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&bytes).to_string()
    }
}

/// Render a program and its arguments as a single display string.
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            line.push_str(&format!("{arg:?}"));
        } else {
            line.push_str(arg);
        }
    }
    line
}

/// Check if a command exists in PATH (or is an existing path).
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Get the full path to a command.
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// First line of `<program> --version`, if the program runs successfully.
pub fn tool_version(program: &str) -> Option<String> {
    let req = CommandRequest::new(program, ["--version"]).with_timeout(Duration::from_secs(10));
    let out = run_command(&req).ok()?;
    if !out.success() {
        return None;
    }
    out.stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Keep the last `n` lines of `s`, redacting credentials.
pub fn tail_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    let tail = if lines.len() <= n {
        lines.join("\n")
    } else {
        lines[lines.len() - n..].join("\n")
    };
    redact_sensitive(&tail)
}

/// Redact credential patterns before output is stored in receipts and
/// event logs.
pub fn redact_sensitive(s: &str) -> String {
    s.lines().map(redact_line).collect::<Vec<_>>().join("\n")
}

fn redact_line(line: &str) -> String {
    let mut out = line.to_string();
    let lower = out.to_ascii_lowercase();

    // Authorization: Bearer <token> / Basic <creds>
    if let Some(pos) = lower.find("authorization:") {
        let after = &lower[pos..];
        for scheme in ["bearer ", "basic "] {
            if let Some(scheme_pos) = after.find(scheme) {
                let redact_start = pos + scheme_pos + scheme.len();
                out = format!("{}[REDACTED]", &out[..redact_start]);
                return out;
            }
        }
    }

    // COMPOSER_AUTH=<json> and NPM_TOKEN=<value>
    for key in ["COMPOSER_AUTH", "NPM_TOKEN"] {
        if let Some(pos) = out.find(key)
            && let Some(eq) = out[pos..].find('=')
        {
            return format!("{}=[REDACTED]", &out[..pos + eq]);
        }
    }

    // token = <value>, _authToken=<value>, password=<value>
    for key in ["authtoken", "token", "password"] {
        if let Some(pos) = lower.find(key) {
            let after_key = &out[pos + key.len()..];
            let trimmed = after_key.trim_start();
            if trimmed.starts_with('=') || trimmed.starts_with(':') {
                let sep_offset = pos + key.len() + (after_key.len() - trimmed.len());
                let value = trimmed[1..].trim();
                if !value.is_empty() {
                    return format!("{}{} [REDACTED]", &out[..sep_offset], &trimmed[..1]);
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_quotes_whitespace() {
        let args = vec!["run".to_string(), "build prod".to_string(), String::new()];
        assert_eq!(command_line("npm", &args), "npm run \"build prod\" \"\"");
    }

    #[test]
    fn tail_keeps_last_lines() {
        let s = "a\nb\nc\nd";
        assert_eq!(tail_lines(s, 2), "c\nd");
        assert_eq!(tail_lines(s, 10), "a\nb\nc\nd");
        assert_eq!(tail_lines("", 3), "");
    }

    #[test]
    fn redacts_authorization_headers() {
        assert_eq!(
            redact_line("Authorization: Bearer abc.def"),
            "Authorization: Bearer [REDACTED]"
        );
        assert_eq!(
            redact_line("authorization: basic dXNlcjpwYXNz"),
            "authorization: basic [REDACTED]"
        );
    }

    #[test]
    fn redacts_env_and_config_tokens() {
        assert_eq!(
            redact_line(r#"COMPOSER_AUTH={"github-oauth":{"github.com":"x"}}"#),
            "COMPOSER_AUTH=[REDACTED]"
        );
        assert_eq!(
            redact_line("//registry.npmjs.org/:_authToken=npm_abc"),
            "//registry.npmjs.org/:_authToken= [REDACTED]"
        );
        assert_eq!(redact_line("token = secret"), "token = [REDACTED]");
        assert_eq!(redact_line("nothing to see"), "nothing to see");
    }

    #[test]
    fn command_output_success_requires_zero_exit() {
        let mut out = CommandOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            duration_ms: 5,
        };
        assert!(out.success());
        out.exit_code = Some(2);
        assert!(!out.success());
        out.exit_code = Some(0);
        out.timed_out = true;
        assert!(!out.success());
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let req = CommandRequest::new("this-command-does-not-exist-xyz123", ["--version"]);
        let err = run_command(&req).unwrap_err();
        assert!(err.to_string().contains("failed to spawn command"));
    }

    #[test]
    fn command_exists_nonexistent() {
        assert!(!command_exists("this-command-does-not-exist-xyz123"));
        assert!(which("this-command-does-not-exist-xyz123").is_none());
        assert!(tool_version("this-command-does-not-exist-xyz123").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn captures_output_env_and_exit_code() {
        let td = tempfile::tempdir().expect("tempdir");
        let req = CommandRequest::new(
            "sh",
            ["-c", "echo \"$GREETING from $(pwd)\"; echo oops >&2; exit 3"],
        )
        .in_dir(td.path())
        .env("GREETING", "hello");

        let out = run_command(&req).expect("run");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.timed_out);
        assert!(out.stdout.starts_with("hello from "));
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_child() {
        let req = CommandRequest::new("sh", ["-c", "exec sleep 5"])
            .with_timeout(Duration::from_millis(200));
        let out = run_command(&req).expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.stderr.contains("command timed out after 200ms"));
        assert!(out.duration() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn large_output_does_not_deadlock() {
        let script = "i=0; while [ $i -lt 20000 ]; do echo line-$i; i=$((i+1)); done";
        let req = CommandRequest::new("sh", ["-c", script]).with_timeout(Duration::from_secs(30));
        let out = run_command(&req).expect("run");
        assert!(out.success());
        assert_eq!(out.stdout_tail(1), "line-19999");
    }

    #[test]
    fn command_output_serialization() {
        let out = CommandOutput {
            exit_code: Some(0),
            stdout: "output".to_string(),
            stderr: String::new(),
            timed_out: false,
            duration_ms: 150,
        };
        let json = serde_json::to_string(&out).expect("serialize");
        assert!(json.contains("\"exit_code\":0"));
        assert!(json.contains("\"stdout\":\"output\""));
    }
}
