//! Shell command execution for provider back-ends and test scripts.
//!
//! Back-ends drive their infrastructure through user-supplied command
//! templates (cloud CLIs, PowerShell on hypervisor hosts, ssh). This module
//! renders those templates and runs them with a timeout.
//!
//! # Templates
//!
//! Placeholders are written `{name}` and substituted with shell-quoted
//! values, so a value containing spaces stays one argument:
//!
//! ```
//! use fleetrun::shell::render;
//!
//! let cmd = render("az group create -n {name} -l {location}", &[
//!     ("name", "rg-1"),
//!     ("location", "west us"),
//! ]);
//! assert_eq!(cmd, "az group create -n rg-1 -l 'west us'");
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::provider::{ProviderError, ProviderResult};

/// Substitutes `{key}` placeholders with shell-quoted values.
///
/// The template is scanned once from left to right, so braces inside a
/// substituted value are never expanded again. Braces that do not name a
/// key are kept as written.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let key = &after[..close];
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, value)| (close, *value))
        });
        match value {
            Some((close, value)) => {
                out.push_str(&shell_words::quote(value));
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Output of a finished shell command.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, or the exit code when stderr is empty.
    pub fn error_line(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("exit code {}", self.exit_code))
    }
}

/// Runs command strings through a shell.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            working_dir: None,
            env: HashMap::new(),
            timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs a command with the default timeout.
    pub async fn run(&self, command: &str) -> ProviderResult<ShellOutput> {
        self.run_with(command, &[], self.timeout).await
    }

    /// Runs a command with extra environment variables and an explicit timeout.
    ///
    /// The child is killed when the timeout elapses.
    ///
    /// # Errors
    ///
    /// - `ProviderError::ExecFailed` - the shell could not be started
    /// - `ProviderError::Timeout` - the command ran longer than `timeout`
    pub async fn run_with(
        &self,
        command: &str,
        extra_env: &[(String, String)],
        timeout: Duration,
    ) -> ProviderResult<ShellOutput> {
        debug!("Running: {}", command);
        let start = Instant::now();

        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c").arg(command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        for (key, value) in extra_env {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ProviderError::ExecFailed(format!("Failed to spawn {}: {}", self.shell, e)))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ProviderError::Timeout(format!("'{}' did not finish within {:?}", command, timeout))
            })?
            .map_err(|e| ProviderError::ExecFailed(format!("Failed to run '{}': {}", command, e)))?;

        Ok(ShellOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }

    /// Runs a command and turns a non-zero exit code into an error.
    pub async fn run_checked(&self, what: &str, command: &str) -> ProviderResult<ShellOutput> {
        let output = self.run(command).await?;
        if !output.success() {
            return Err(ProviderError::CommandFailed {
                what: what.to_string(),
                detail: output.error_line(),
            });
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_quotes_values() {
        let cmd = render("deploy {name} {image}", &[
            ("name", "rg-1"),
            ("image", "canonical ubuntuserver 18.04-lts latest"),
        ]);
        assert_eq!(
            cmd,
            "deploy rg-1 'canonical ubuntuserver 18.04-lts latest'"
        );
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        assert_eq!(render("echo {other}", &[("name", "x")]), "echo {other}");
    }

    #[test]
    fn test_render_never_expands_inside_values() {
        let cmd = render("run {name} in {location}", &[
            ("name", "T{location}"),
            ("location", "westus2"),
        ]);
        assert_eq!(cmd, "run 'T{location}' in westus2");
    }

    #[test]
    fn test_render_keeps_shell_braces() {
        let cmd = render("[ {name} = a ] || { echo {name}; exit 1; }", &[("name", "b")]);
        assert_eq!(cmd, "[ b = a ] || { echo b; exit 1; }");
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let runner = ShellRunner::new("/bin/sh");
        let output = runner.run("echo out; echo err >&2; exit 3").await.unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.error_line(), "err");
    }

    #[tokio::test]
    async fn test_run_passes_env() {
        let mut env = HashMap::new();
        env.insert("FLEET_BASE".to_string(), "base".to_string());
        let runner = ShellRunner::new("/bin/sh").with_env(env);

        let output = runner
            .run_with(
                "echo $FLEET_BASE-$FLEET_EXTRA",
                &[("FLEET_EXTRA".to_string(), "extra".to_string())],
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "base-extra");
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let runner = ShellRunner::new("/bin/sh").with_timeout(Duration::from_millis(100));
        let err = runner.run("sleep 5").await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_run_checked_fails_on_exit_code() {
        let runner = ShellRunner::new("/bin/sh");
        let err = runner
            .run_checked("delete", "echo 'quota exceeded' >&2; exit 1")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "delete failed: quota exceeded");
    }
}
