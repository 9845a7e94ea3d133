use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Number of trailing stderr lines kept from every child process.
pub const STDERR_TAIL_LINES: usize = 40;

/// A fully described external process invocation.
///
/// Every collaborator of a campaign (git, the container engine, the fuzz
/// targets inside their containers) is reached through one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            working_dir: None,
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Renders the invocation as a single shell-like line for logs and plans.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum ExitState {
    Success,
    Code(i32),
    Signal(i32),
    /// Neither an exit code nor a signal was reported.
    Abnormal,
}

impl ExitState {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitState::Success)
    }
}

impl From<ExitStatus> for ExitState {
    fn from(status: ExitStatus) -> Self {
        if status.success() {
            return ExitState::Success;
        }
        if let Some(code) = status.code() {
            return ExitState::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitState::Signal(signal);
            }
        }
        ExitState::Abnormal
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Success => write!(f, "exited successfully"),
            ExitState::Code(code) => write!(f, "exited with code {code}"),
            ExitState::Signal(signal) => write!(f, "terminated by signal {signal}"),
            ExitState::Abnormal => write!(f, "exited abnormally"),
        }
    }
}

/// Result of running a process to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub state: ExitState,
    /// Last [`STDERR_TAIL_LINES`] lines the process wrote to stderr, verbatim.
    pub stderr_tail: Vec<String>,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success() -> Self {
        Self::with_state(ExitState::Success)
    }

    pub fn with_state(state: ExitState) -> Self {
        Self {
            state,
            stderr_tail: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn diagnostics(&self) -> String {
        self.stderr_tail.join("\n")
    }
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Error waiting for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Launches external processes and blocks until they exit.
///
/// Components only ever talk to the outside world through this trait, so a
/// campaign can be driven against a scripted runner in tests.
pub trait ProcessRunner {
    fn run(&mut self, spec: &ProcessSpec) -> Result<ProcessOutput, ProcessError>;
}

/// Runs processes on the host with `std::process::Command`.
///
/// Stdout is inherited. Stderr is forwarded line by line to our own stderr
/// while the tail is kept for error reports.
#[derive(Debug, Default)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        CommandRunner
    }
}

impl ProcessRunner for CommandRunner {
    fn run(&mut self, spec: &ProcessSpec) -> Result<ProcessOutput, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.envs {
            cmd.env(key, value);
        }
        if let Some(cwd) = &spec.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::piped());

        debug!(command = %spec.command_line(), cwd = ?spec.working_dir, "spawning process");
        let start_time = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let tail = match child.stderr.take() {
            Some(stderr) => forward_stderr(BufReader::new(stderr)),
            None => VecDeque::new(),
        };

        let status = child.wait().map_err(|source| ProcessError::Wait {
            program: spec.program.clone(),
            source,
        })?;

        Ok(ProcessOutput {
            state: ExitState::from(status),
            stderr_tail: tail.into(),
            duration: start_time.elapsed(),
        })
    }
}

/// Echoes `reader` line by line to our stderr until EOF and returns the last
/// [`STDERR_TAIL_LINES`] lines.
///
/// Lines are raw bytes decoded lossily. The pipe is drained to EOF even after a
/// read error, so the child never sees a closed stderr.
fn forward_stderr<B: BufRead>(mut reader: B) -> VecDeque<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut buf = Vec::new();
    let mut consecutive_errors = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => consecutive_errors = 0,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "reading child stderr");
                consecutive_errors += 1;
                if consecutive_errors > 100 {
                    break;
                }
                if buf.is_empty() {
                    continue;
                }
            }
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        eprintln!("{line}");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    type Responder = Box<dyn FnMut(&ProcessSpec) -> Result<ProcessOutput, ProcessError>>;

    /// Scripted stand-in for git and the container engine.
    pub struct FakeRunner {
        responder: Responder,
        pub calls: Vec<ProcessSpec>,
    }

    impl FakeRunner {
        pub fn new<F>(responder: F) -> Self
        where
            F: FnMut(&ProcessSpec) -> Result<ProcessOutput, ProcessError> + 'static,
        {
            Self {
                responder: Box::new(responder),
                calls: Vec::new(),
            }
        }

        pub fn succeeding() -> Self {
            Self::new(|_| Ok(ProcessOutput::success()))
        }

        pub fn command_lines(&self) -> Vec<String> {
            self.calls.iter().map(ProcessSpec::command_line).collect()
        }
    }

    impl ProcessRunner for FakeRunner {
        fn run(&mut self, spec: &ProcessSpec) -> Result<ProcessOutput, ProcessError> {
            self.calls.push(spec.clone());
            (self.responder)(spec)
        }
    }

    pub fn spawn_error(program: &str) -> ProcessError {
        ProcessError::Spawn {
            program: program.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        }
    }
}
