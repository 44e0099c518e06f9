//! Blocking subprocess execution with optional stdin and timeout.
//!
//! Every collaborator the pipeline talks to (issue tracker CLI, generation
//! CLI, coding agent, test runner, git) is an external process. They all go
//! through [`Exec`] so timeout and output-capture behavior is uniform.
//!
//! Stdout and stderr are drained on dedicated threads to avoid pipe-buffer
//! deadlocks, and the timeout is a waiter thread plus `recv_timeout`, so no
//! busy-waiting. Each child leads its own process group; on timeout the
//! whole group is killed, so nothing it spawned outlives the call.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Output is capped to this many bytes (keeping the tail) before it is
/// logged or embedded in an error.
const MAX_OUTPUT: usize = 10 * 1024;

/// A single external command invocation.
#[derive(Debug, Clone)]
pub struct Exec {
    label: String,
    program: String,
    args: Vec<String>,
    cwd: PathBuf,
    stdin: Option<String>,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
}

/// Captured result of a process that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// Stdout and stderr joined and capped to the last 10KB.
    pub fn combined(&self) -> String {
        let joined = if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else if self.stdout.trim().is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        };
        cap_tail(joined.trim())
    }

    fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "signal".to_string(),
        }
    }
}

impl Exec {
    pub fn new(program: impl Into<String>, cwd: &Path) -> Self {
        let program = program.into();
        Self {
            label: program.clone(),
            program,
            args: Vec::new(),
            cwd: cwd.to_path_buf(),
            stdin: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    /// `sh -c <command>`, labelled with the command text in errors and logs.
    pub fn shell(command: &str, cwd: &Path) -> Self {
        let mut exec = Self::new("sh", cwd).arg("-c").arg(command);
        exec.label = command.to_string();
        exec
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// `None` waits indefinitely.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the process to completion. A non-zero exit is reported through
    /// `ExecOutput::success`; spawn failures and timeouts are errors.
    pub fn output(self) -> Result<ExecOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        if self.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        // Own process group, so a timeout can take down wrapper scripts and
        // everything they started.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| PipelineError::Spawn {
            program: self.label.clone(),
            reason: e.to_string(),
        })?;
        let child_pid = child.id();

        // Feed stdin from its own thread; a large prompt must not block on a
        // child that is itself blocked writing stdout.
        let stdin_thread = match (child.stdin.take(), self.stdin) {
            (Some(mut pipe), Some(input)) => Some(std::thread::spawn(move || {
                let _ = pipe.write_all(input.as_bytes());
            })),
            _ => None,
        };

        let stdout_thread = spawn_reader(child.stdout.take());
        let stderr_thread = spawn_reader(child.stderr.take());

        let wait_result = match self.timeout {
            None => child.wait(),
            Some(timeout) => {
                let (tx, rx) = std::sync::mpsc::channel();
                std::thread::spawn(move || {
                    let _ = tx.send(child.wait());
                });
                match rx.recv_timeout(timeout) {
                    Ok(result) => result,
                    Err(_) => {
                        kill_process_group(child_pid);
                        return Err(PipelineError::Timeout {
                            program: self.label,
                            secs: timeout.as_secs(),
                        });
                    }
                }
            }
        };

        if let Some(t) = stdin_thread {
            let _ = t.join();
        }
        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();

        let status = wait_result.map_err(|e| PipelineError::Spawn {
            program: self.label.clone(),
            reason: format!("wait failed: {e}"),
        })?;

        Ok(ExecOutput {
            success: status.success(),
            code: status.code(),
            stdout,
            stderr,
        })
    }

    /// Like [`Exec::output`] but a non-zero exit is also an error.
    pub fn checked(self) -> Result<ExecOutput> {
        let label = self.label.clone();
        let out = self.output()?;
        if !out.success {
            return Err(PipelineError::CommandFailed {
                program: label,
                status: out.status_text(),
                output: out.combined(),
            });
        }
        Ok(out)
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut r) = pipe {
            let _ = r.read_to_string(&mut buf);
        }
        buf
    })
}

fn cap_tail(s: &str) -> String {
    if s.len() <= MAX_OUTPUT {
        return s.to_string();
    }
    let mut start = s.len() - MAX_OUTPUT;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

/// SIGKILL the whole process group led by `pid`. Best-effort; errors are
/// ignored.
fn kill_process_group(pid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

/// True if `program` resolves on `PATH` (or is an existing path).
pub fn program_available(program: &str) -> bool {
    which::which(program).is_ok()
}
