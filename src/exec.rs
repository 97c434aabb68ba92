// Copyright 2025 Stairwell, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command execution primitive: run a command line with an optional timeout and
//! capture its exit code, stdout and stderr.

use std::{
    env,
    ffi::OsStr,
    fmt,
    io::Read,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A program and its arguments. The environment is inherited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        CommandLine {
            program: program.into(),
            args: Vec::new(),
        }
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

}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg.replace('\'', r"'\''"))?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Shared cancellation flag, checked by [`SystemRunner`] while it waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub expected_exit_code: i32,
    /// Return the output instead of failing on an unexpected exit code.
    pub suppress_errors: bool,
    /// Attach the command to the terminal instead of capturing its output.
    pub interactive: bool,
    pub cancel: Option<CancelToken>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            timeout: None,
            expected_exit_code: 0,
            suppress_errors: false,
            interactive: false,
            cancel: None,
        }
    }
}

impl RunOptions {
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        RunOptions {
            timeout,
            ..Default::default()
        }
    }

    pub fn suppressed(mut self) -> Self {
        self.suppress_errors = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to run {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command}: exit code {}\n\n{}", .exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()), .stderr.trim())]
    UnexpectedExit {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("{command}: timed out after {after:?}")]
    TimedOut { command: String, after: Duration },

    #[error("{command}: cancelled")]
    Cancelled { command: String },
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &CommandLine, options: &RunOptions) -> Result<CommandOutput, ExecError>;
}

/// Runs commands as local child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &CommandLine, options: &RunOptions) -> Result<CommandOutput, ExecError> {
        let rendered = command.to_string();
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        if options.interactive {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }
        log::debug!("running {}", rendered);
        let mut child = cmd.spawn().map_err(|source| ExecError::Io {
            command: rendered.clone(),
            source,
        })?;
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let started = Instant::now();
        let status: ExitStatus = loop {
            let polled = child.try_wait().map_err(|source| ExecError::Io {
                command: rendered.clone(),
                source,
            })?;
            if let Some(status) = polled {
                break status;
            }
            if let Some(timeout) = options.timeout {
                if started.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExecError::TimedOut {
                        command: rendered,
                        after: timeout,
                    });
                }
            }
            if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecError::Cancelled { command: rendered });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let output = CommandOutput {
            exit_code: status.code(),
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
        };
        if !options.suppress_errors && output.exit_code != Some(options.expected_exit_code) {
            return Err(ExecError::UnexpectedExit {
                command: rendered,
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

/// Looks `name` up in `PATH`, or checks it directly when it contains a slash.
pub fn find_executable(name: impl AsRef<OsStr>) -> Option<PathBuf> {
    let name = Path::new(name.as_ref());
    if name.components().count() > 1 {
        return is_executable(name).then(|| name.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = path.metadata() else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        metadata.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandLine {
        CommandLine::new("sh").args(["-c", script])
    }

    #[test]
    fn captures_output_and_exit_code() {
        let output = SystemRunner
            .run(
                &sh("echo out; echo err >&2; exit 3"),
                &RunOptions::default().suppressed(),
            )
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(!output.success());
    }

    #[test]
    fn unexpected_exit_code_is_an_error() {
        let err = SystemRunner
            .run(&sh("echo boom >&2; exit 2"), &RunOptions::default())
            .unwrap_err();
        match err {
            ExecError::UnexpectedExit {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr.trim(), "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn expected_exit_code_is_honored() {
        let options = RunOptions {
            expected_exit_code: 4,
            ..Default::default()
        };
        assert!(SystemRunner.run(&sh("exit 4"), &options).is_ok());
    }

    #[test]
    fn timeout_kills_the_command() {
        let started = Instant::now();
        let err = SystemRunner
            .run(
                &CommandLine::new("sleep").arg("5"),
                &RunOptions::with_timeout(Some(Duration::from_millis(100))),
            )
            .unwrap_err();
        assert!(matches!(err, ExecError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn cancellation_stops_the_command() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let options = RunOptions {
            cancel: Some(cancel),
            ..Default::default()
        };
        let err = SystemRunner
            .run(&CommandLine::new("sleep").arg("5"), &options)
            .unwrap_err();
        assert!(matches!(err, ExecError::Cancelled { .. }));
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let cmd = CommandLine::new("ssh")
            .args(["-o", "ControlMaster=yes", "fleet.web1", "echo hi"]);
        assert_eq!(cmd.to_string(), "ssh -o ControlMaster=yes fleet.web1 'echo hi'");
    }

    #[test]
    fn finds_executables_on_path() {
        assert!(find_executable("sh").is_some());
        assert!(find_executable("fleetmux-definitely-not-installed").is_none());
    }
}
