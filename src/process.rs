//! External tool invocation.
//!
//! Instead of a subclass per wrapped tool, one [`ProcessRunner`] is
//! configured with the executable, its argument template, and how stdin and
//! stdout are handled. REPL-style prompt stripping is a small strategy value
//! on the process spec, not a separate runner kind.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ast::{Args, arg_truthy};
use crate::data::Data;
use crate::error::FilterResult;

/// Typed so callers can tell a timeout apart from any other tool failure.
#[derive(Debug, Error)]
#[error("timed out after {0}s")]
pub struct TimeoutExpired(pub u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdinMode {
    /// Upstream data is piped to the child's stdin.
    #[default]
    Pipe,
    /// The child gets no input stream.
    None,
}

/// Strategy for trimming echoed prompts from REPL-style tools. Lines of the
/// captured output that start with the marker are dropped.
#[derive(Debug, Clone)]
pub struct PromptStrategy {
    pub marker: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub executable: String,
    pub args: Vec<String>,
    pub stdin: StdinMode,
    pub prompt: Option<PromptStrategy>,
    /// Command line (split on whitespace) used to capture variables when a
    /// node asks for `record-vars`. Output is parsed as `key=value` lines.
    pub vars_command: Option<String>,
}

pub struct ProcessRunner {
    pub spec: ProcessSpec,
}

/// Wait for the child, killing it if the timeout expires. The in-flight
/// process must not be left running after a timeout.
fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> FilterResult<i32> {
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.code().unwrap_or(-1));
        }

        if let Some(limit) = timeout
            && start.elapsed() > limit
        {
            child.kill().ok();
            child.wait().ok();
            return Err(TimeoutExpired(limit.as_secs()).into());
        }

        thread::sleep(Duration::from_millis(10));
    }
}

impl ProcessRunner {
    pub fn new(spec: ProcessSpec) -> Self {
        Self { spec }
    }

    /// Run the external tool over `input`, honoring per-node settings:
    /// `args` (extra command-line flags), `timeout` (seconds),
    /// `ignore-nonzero-exit`, and `record-vars`.
    pub fn run(&self, input: &Data, settings: &Args) -> FilterResult<Data> {
        let timeout = settings
            .get("timeout")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs);
        let ignore_nonzero = arg_truthy(settings, "ignore-nonzero-exit");

        if arg_truthy(settings, "record-vars") {
            let command = self
                .spec
                .vars_command
                .as_deref()
                .ok_or_else(|| anyhow!("no vars command defined for '{}'", self.spec.executable))?;
            return self.capture_vars(command, timeout);
        }

        let mut command = Command::new(&self.spec.executable);
        command.args(&self.spec.args);

        if let Some(extra) = settings.get("args").and_then(|v| v.as_str()) {
            command.args(extra.split_whitespace());
        }

        let stdout = self.invoke(command, Some(input), timeout, ignore_nonzero)?;
        Ok(Data::text(stdout))
    }

    fn capture_vars(&self, command_line: &str, timeout: Option<Duration>) -> FilterResult<Data> {
        let mut parts = command_line.split_whitespace();
        let executable = parts
            .next()
            .ok_or_else(|| anyhow!("empty vars command for '{}'", self.spec.executable))?;

        let mut command = Command::new(executable);
        command.args(parts);

        let stdout = self.invoke(command, None, timeout, false)?;

        let mut vars = BTreeMap::new();
        for line in stdout.lines() {
            if let Some((key, value)) = line.split_once('=') {
                vars.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        Ok(Data::KeyValue(vars))
    }

    fn invoke(
        &self,
        mut command: Command,
        input: Option<&Data>,
        timeout: Option<Duration>,
        ignore_nonzero: bool,
    ) -> FilterResult<String> {
        let piped = input.is_some() && self.spec.stdin == StdinMode::Pipe;

        command
            .stdin(if piped { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("spawning {:?}", command);

        let mut child = command
            .spawn()
            .with_context(|| format!("couldn't spawn '{}'", self.spec.executable))?;

        if piped {
            let bytes = input.map(Data::to_bytes).unwrap_or_default();
            let mut stdin = child.stdin.take().expect("stdin was piped");
            // Write on a separate thread so a child that fills its output
            // pipe before reading all input can't deadlock us.
            thread::spawn(move || {
                stdin.write_all(&bytes).ok();
            });
        }

        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");

        let stdout_thread = thread::spawn(move || {
            let mut buffer = String::new();
            stdout_pipe.read_to_string(&mut buffer).ok();
            buffer
        });
        let stderr_thread = thread::spawn(move || {
            let mut buffer = String::new();
            stderr_pipe.read_to_string(&mut buffer).ok();
            buffer
        });

        let code = wait_with_timeout(&mut child, timeout)?;

        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();

        if code != 0 {
            if ignore_nonzero {
                warn!(
                    "'{}' exited with code {code}, keeping partial output",
                    self.spec.executable
                );
            } else {
                bail!(
                    "'{}' exited with code {code}:\n{}",
                    self.spec.executable,
                    stderr.trim()
                );
            }
        }

        Ok(self.strip_prompts(stdout))
    }

    fn strip_prompts(&self, output: String) -> String {
        match &self.spec.prompt {
            Some(strategy) => output
                .lines()
                .filter(|line| !line.starts_with(&strategy.marker))
                .collect::<Vec<_>>()
                .join("\n"),
            None => output,
        }
    }
}
