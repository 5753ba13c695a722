/// Command execution for docker, kind, kubectl and helm
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::ProvisionError;

/// A fully described external command, independent of how it gets executed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl Invocation {
    /// Program and arguments joined for logging. Never includes stdin.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Whether the arguments start with the given words
    #[cfg(test)]
    pub fn starts_with(&self, words: &[&str]) -> bool {
        self.args.len() >= words.len() && self.args.iter().zip(words).all(|(a, w)| a == w)
    }

    /// Value following a flag such as `-n` or `--name`
    #[cfg(test)]
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

/// Result from command execution with captured output
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub program: String,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Create from a finished process
    fn from_output(program: &str, output: std::process::Output) -> Self {
        Self {
            program: program.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        }
    }

    /// Successful output with the given stdout
    #[cfg(test)]
    pub fn ok(program: &str, stdout: impl Into<String>) -> Self {
        Self {
            program: program.to_string(),
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
            code: Some(0),
        }
    }

    /// Failed output with the given exit code and stderr
    #[cfg(test)]
    pub fn failed(program: &str, code: i32, stderr: impl Into<String>) -> Self {
        Self {
            program: program.to_string(),
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
            code: Some(code),
        }
    }

    /// Return stdout if successful, otherwise a `CommandFailed` error
    pub fn into_result(self) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(ProvisionError::CommandFailed {
                program: self.program,
                code: self.code,
                stderr: self.stderr,
            }
            .into())
        }
    }
}

/// Something that can execute an invocation
///
/// The system implementation spawns real processes; tests substitute an
/// in-memory cluster.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs invocations as child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start {}", invocation.program))?;

        let stdin = child.stdin.take();
        let input = invocation.stdin.clone();
        let writer = async move {
            if let (Some(mut stdin), Some(input)) = (stdin, input) {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };

        let (written, output) = tokio::join!(writer, child.wait_with_output());
        let output = output
            .with_context(|| format!("Failed to wait for {}", invocation.program))?;
        written.with_context(|| format!("Failed to write stdin of {}", invocation.program))?;

        Ok(CommandOutput::from_output(&invocation.program, output))
    }
}

/// Builder for executing external commands with common patterns
pub struct CommandBuilder {
    invocation: Invocation,
    context_msg: Option<String>,
}

impl CommandBuilder {
    /// Create a new command builder
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            invocation: Invocation {
                program: program.as_ref().to_string_lossy().to_string(),
                ..Default::default()
            },
            context_msg: None,
        }
    }

    /// Add a single argument
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.invocation
            .args
            .push(arg.as_ref().to_string_lossy().to_string());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.invocation.args.extend(
            args.into_iter()
                .map(|a| a.as_ref().to_string_lossy().to_string()),
        );
        self
    }

    /// Set an environment variable
    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.invocation.env.push((
            key.as_ref().to_string_lossy().to_string(),
            val.as_ref().to_string_lossy().to_string(),
        ));
        self
    }

    /// Set KUBECONFIG environment variable
    pub fn kubeconfig(self, path: &Path) -> Self {
        self.env("KUBECONFIG", path)
    }

    /// Feed text to the command's stdin
    pub fn stdin<S: Into<String>>(mut self, input: S) -> Self {
        self.invocation.stdin = Some(input.into());
        self
    }

    /// Set context message for error reporting
    pub fn context<S: Into<String>>(mut self, msg: S) -> Self {
        self.context_msg = Some(msg.into());
        self
    }

    /// The invocation this builder describes
    #[cfg(test)]
    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    /// Execute and return raw output
    pub async fn output(self, runner: &dyn CommandRunner) -> Result<CommandOutput> {
        debug!("$ {}", self.invocation.command_line());
        let result = runner.execute(&self.invocation).await;
        match self.context_msg {
            Some(ctx) => result.context(ctx),
            None => result,
        }
    }

    /// Execute and return stdout on success, error on failure
    pub async fn run(self, runner: &dyn CommandRunner) -> Result<String> {
        let ctx = self.context_msg.clone();
        let result = self.output(runner).await?.into_result();
        match ctx {
            Some(ctx) => result.context(ctx),
            None => result,
        }
    }

    /// Execute and ignore output (just check success)
    pub async fn run_silent(self, runner: &dyn CommandRunner) -> Result<()> {
        self.run(runner).await.map(|_| ())
    }
}

/// Check if a command-line tool is installed
pub async fn check_tool_installed(
    runner: &dyn CommandRunner,
    tool_name: &str,
    version_args: &[&str],
    install_url: &str,
) -> Result<()> {
    let output = CommandBuilder::new(tool_name)
        .args(version_args)
        .output(runner)
        .await;

    match output {
        Ok(out) if out.success => Ok(()),
        _ => anyhow::bail!(
            "{} is not installed or not in PATH. Please install from {}",
            tool_name,
            install_url
        ),
    }
}
