//! External tool invocation.
//!
//! Every command line is logged and appended to the caller's ledger before
//! it runs. Tool stderr goes to the job log: line by line at `info` when the
//! tool succeeds, whole at `warn` when it fails. A non-zero exit is a
//! [`PipelineError::Tool`] carrying the last non-empty line of stderr.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use seqpipe_types::ledger::FileLedger;
use tracing::{info, warn};

use crate::error::PipelineError;

#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl CommandRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run `args` and return its stdout.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for an empty argument vector and
    /// [`PipelineError::Tool`] if the process cannot start or exits non-zero.
    pub fn execute(&self, args: &[String], ledger: &mut FileLedger) -> Result<String, PipelineError> {
        let (mut cmd, line) = self.prepare(args, ledger)?;
        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| PipelineError::tool(&args[0], format!("failed to start: {e}")))?;
        check_output(&args[0], &line, &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run `args` with stdout redirected into `stdout_path`.
    ///
    /// Output is written to a sibling temp file that is moved into place
    /// only after the process succeeds.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute), plus [`PipelineError::Io`] for
    /// failures creating or moving the output file.
    pub fn execute_to_file(
        &self,
        args: &[String],
        stdout_path: &Path,
        ledger: &mut FileLedger,
    ) -> Result<(), PipelineError> {
        let (mut cmd, line) = self.prepare(args, ledger)?;
        let partial = partial_path(stdout_path);
        let file = File::create(&partial).map_err(|e| PipelineError::io(&partial, e))?;
        let result = cmd
            .stdout(file)
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| PipelineError::tool(&args[0], format!("failed to start: {e}")))
            .and_then(|output| check_output(&args[0], &line, &output));
        if let Err(e) = result {
            if let Err(rm) = fs::remove_file(&partial) {
                warn!(file = %partial.display(), error = %rm, "Failed to remove partial output");
            }
            return Err(e);
        }
        fs::rename(&partial, stdout_path).map_err(|e| PipelineError::io(stdout_path, e))
    }

    fn prepare(&self, args: &[String], ledger: &mut FileLedger) -> Result<(Command, String), PipelineError> {
        let Some((program, rest)) = args.split_first() else {
            return Err(PipelineError::config("cannot run an empty command"));
        };
        let line = command_line(args);
        info!(command = %line, "Running external command");
        ledger.add_command(&line);

        let mut cmd = Command::new(program);
        cmd.args(rest).stdin(Stdio::null());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        Ok((cmd, line))
    }
}

fn check_output(program: &str, line: &str, output: &Output) -> Result<(), PipelineError> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if output.status.success() {
        for l in stderr.lines().filter(|l| !l.trim().is_empty()) {
            info!(tool = program, "{l}");
        }
        return Ok(());
    }
    warn!(tool = program, command = %line, stderr = ?stderr.trim_end(), "Tool exited with an error");
    let tail = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no stderr output");
    let status = output
        .status
        .code()
        .map_or_else(|| "killed by signal".to_string(), |code| format!("exit status {code}"));
    Err(PipelineError::tool(program, format!("{status}: {tail} (command: {line})")))
}

/// Sibling path used while a file is being written.
#[must_use]
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Render an argument vector as a copy-pasteable shell line.
#[must_use]
pub fn command_line(args: &[String]) -> String {
    args.iter()
        .map(|a| {
            if !a.is_empty() && a.chars().all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c)) {
                a.clone()
            } else {
                format!("'{}'", a.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
