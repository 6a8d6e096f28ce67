//! External tool invocation.
//!
//! Every call out to docker, trivy, cosign, syft, opa and the rest goes through
//! a [`CommandRunner`], so commands can be executed for real, printed for a dry
//! run, or recorded by tests.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{self, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            timeout: None,
        }
    }

    /// `sh -c <script>`, used for the user-supplied build hooks.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.timeout
    }

    fn to_command(&self) -> process::Command {
        let mut command = process::Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

fn quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',' | '@' | '+')
        });
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(
        "the `{program}` command is required but not available on your system, please install it"
    )]
    NotFound { program: String },
    #[error(
        "the `{program}` command is available but does not have the right permissions, please make sure the binary is executable"
    )]
    PermissionDenied { program: String },
    #[error("`{command}` exited with non-zero exit code `{code}`")]
    NonZeroExit { command: String, code: i32 },
    #[error("`{command}` was terminated by a signal")]
    Terminated { command: String },
    #[error("`{command}` did not finish within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
    #[error("failed to run `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl ProcessError {
    fn spawn(invocation: &Invocation, error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => ProcessError::NotFound {
                program: invocation.program.clone(),
            },
            io::ErrorKind::PermissionDenied => ProcessError::PermissionDenied {
                program: invocation.program.clone(),
            },
            _ => ProcessError::Io {
                command: invocation.to_string(),
                source: error,
            },
        }
    }

    fn from_status(invocation: &Invocation, status: process::ExitStatus) -> Result<(), Self> {
        if status.success() {
            return Ok(());
        }
        match status.code() {
            Some(code) => Err(ProcessError::NonZeroExit {
                command: invocation.to_string(),
                code,
            }),
            None => Err(ProcessError::Terminated {
                command: invocation.to_string(),
            }),
        }
    }
}

pub trait CommandRunner {
    /// Run with inherited stdio; a non-zero exit is an error.
    fn run(&self, invocation: &Invocation) -> Result<(), ProcessError>;

    /// Run and return stdout; a non-zero exit is an error.
    fn capture(&self, invocation: &Invocation) -> Result<String, ProcessError>;

    /// Whether commands actually execute. Steps that read files produced by a
    /// command check this first.
    fn executes(&self) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<(), ProcessError> {
        debug!(command = %invocation, "running");
        let mut child = invocation
            .to_command()
            .spawn()
            .map_err(|err| ProcessError::spawn(invocation, err))?;

        let Some(timeout) = invocation.timeout else {
            let status = child.wait().map_err(|source| ProcessError::Io {
                command: invocation.to_string(),
                source,
            })?;
            return ProcessError::from_status(invocation, status);
        };

        let deadline = Instant::now() + timeout;
        loop {
            let polled = child.try_wait().map_err(|source| ProcessError::Io {
                command: invocation.to_string(),
                source,
            })?;
            if let Some(status) = polled {
                return ProcessError::from_status(invocation, status);
            }
            if Instant::now() >= deadline {
                // Already exited or unkillable; the timeout is reported either way.
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProcessError::TimedOut {
                    command: invocation.to_string(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn capture(&self, invocation: &Invocation) -> Result<String, ProcessError> {
        debug!(command = %invocation, "capturing");
        let output = invocation
            .to_command()
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|err| ProcessError::spawn(invocation, err))?;
        ProcessError::from_status(invocation, output.status)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Records invocations instead of executing them.
///
/// `capture` answers with the canned output registered for the program, or an
/// empty string.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    invocations: Mutex<Vec<Invocation>>,
    responses: HashMap<String, String>,
    failing: HashMap<String, i32>,
    timing_out: HashSet<String>,
    quiet: bool,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// No log line per command; tests use this to keep output readable.
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Self::default()
        }
    }

    pub fn with_response(mut self, program: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.responses.insert(program.into(), stdout.into());
        self
    }

    /// Make every invocation of `program` fail with `code`.
    pub fn with_failure(mut self, program: impl Into<String>, code: i32) -> Self {
        self.failing.insert(program.into(), code);
        self
    }

    /// Make invocations of `program` that carry a time limit report a timeout.
    pub fn with_timeout(mut self, program: impl Into<String>) -> Self {
        self.timing_out.insert(program.into());
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Rendered command lines, handy for assertions.
    pub fn command_lines(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    fn record(&self, invocation: &Invocation) -> Result<(), ProcessError> {
        if !self.quiet {
            info!(command = %invocation, "dry run");
        }
        if let Ok(mut guard) = self.invocations.lock() {
            guard.push(invocation.clone());
        }
        if let Some(timeout) = invocation.timeout
            && self.timing_out.contains(&invocation.program)
        {
            return Err(ProcessError::TimedOut {
                command: invocation.to_string(),
                timeout,
            });
        }
        match self.failing.get(&invocation.program) {
            Some(code) => Err(ProcessError::NonZeroExit {
                command: invocation.to_string(),
                code: *code,
            }),
            None => Ok(()),
        }
    }
}

impl CommandRunner for DryRunRunner {
    fn run(&self, invocation: &Invocation) -> Result<(), ProcessError> {
        self.record(invocation)
    }

    fn capture(&self, invocation: &Invocation) -> Result<String, ProcessError> {
        self.record(invocation)?;
        Ok(self
            .responses
            .get(&invocation.program)
            .cloned()
            .unwrap_or_default())
    }

    fn executes(&self) -> bool {
        false
    }
}

/// Parse durations such as `90`, `30s`, `10m`, `1h` or `1h30m`.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(seconds) = text.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().ok()?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            _ => return None,
        };
        total = total.checked_add(value.checked_mul(unit)?)?;
    }
    if !digits.is_empty() {
        return None;
    }
    Some(Duration::from_secs(total))
}
