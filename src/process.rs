//! Running the host and boot-time tools.
//!
//! The composer runs `depmod` over the staged module tree; the init process
//! runs `modprobe`, `losetup` and the console shell. All of them go through
//! [`Cmd`], so a failure reports the tool's exit code and stderr.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// Exit status and captured output of a finished tool.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, -1 when killed by a signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// `losetup --show` prints the attached device here.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// One invocation of an external tool.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    allow_fail: bool,
    error_prefix: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            allow_fail: false,
            error_prefix: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    /// Staging and image paths are passed lossily; they are ASCII in practice.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Hand a non-zero exit back to the caller instead of failing.
    ///
    /// `modprobe` uses this so a missing module is a warning, and the shell
    /// uses it because any exit status is fine there.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Replace the default "'tool' failed" prefix of the error.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    fn failure(self, code: i32, stderr: &str) -> anyhow::Error {
        let prefix = self
            .error_prefix
            .unwrap_or_else(|| format!("'{}' failed", self.program));
        if stderr.is_empty() {
            anyhow::anyhow!("{} (exit code {})", prefix, code)
        } else {
            anyhow::anyhow!("{} (exit code {}):\n{}", prefix, code, stderr)
        }
    }

    /// Run to completion with stdout and stderr captured.
    pub fn run(self) -> Result<CommandResult> {
        let output = self
            .command()
            .output()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !self.allow_fail && !result.success() {
            let stderr = result.stderr_trimmed().to_string();
            return Err(self.failure(result.code(), &stderr));
        }
        Ok(result)
    }

    /// Run on the console with inherited stdio, for the shells.
    pub fn run_interactive(self) -> Result<ExitStatus> {
        let status = self
            .command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        if !self.allow_fail && !status.success() {
            return Err(self.failure(status.code().unwrap_or(-1), ""));
        }
        Ok(status)
    }
}

/// Location of a host tool on `PATH`, for preflight.
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}
