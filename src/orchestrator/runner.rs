//! Runs one test case's script against a live environment.
//!
//! The [`CaseRunner`] is the caller of a test script. It enforces the test
//! timeout and turns whatever the script did into exactly one
//! [`ExecutionOutcome`]; it never fails in any other way.
//!
//! # Script Protocol
//!
//! The script runs locally through the configured shell with the target
//! environment described in `FLEET_*` variables:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `FLEET_TEST_NAME` | test case name |
//! | `FLEET_ITERATION` | iteration index, empty when not repeating |
//! | `FLEET_ENVIRONMENT` | environment name |
//! | `FLEET_MACHINES` | comma-separated machine names |
//! | `FLEET_ADDRESSES` | comma-separated machine addresses |
//! | `FLEET_LOCATION` | location, if any |
//! | `FLEET_IMAGE` | image, if any |
//! | `FLEET_LOG_DIR` | directory for the script's logs |
//!
//! The outcome is the last status token printed on its own line
//! (`TestCompleted`, `TestFailed`, `TestAborted`, `TestSkipped`), falling
//! back to the exit code. The last stdout line that parses as a JSON object
//! becomes the outcome's telemetry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::catalog::TestCase;
use crate::outcome::{ExecutionOutcome, Outcome};
use crate::provider::{Environment, ProviderError};
use crate::shell::{ShellOutput, ShellRunner};

/// Executes a test case against an environment.
#[async_trait]
pub trait CaseRunner: Send + Sync {
    async fn run_case(&self, environment: &Environment, case: &TestCase) -> ExecutionOutcome;
}

#[async_trait]
impl<R: CaseRunner + ?Sized> CaseRunner for std::sync::Arc<R> {
    async fn run_case(&self, environment: &Environment, case: &TestCase) -> ExecutionOutcome {
        (**self).run_case(environment, case).await
    }
}

/// Runs test scripts through a local shell.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    shell: ShellRunner,
    base_dir: PathBuf,
    log_dir: PathBuf,
}

impl ScriptRunner {
    /// Creates a runner resolving relative script paths against `base_dir`
    /// and giving each test a log directory under `log_dir`.
    pub fn new(shell: ShellRunner, base_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell,
            base_dir: base_dir.into(),
            log_dir: log_dir.into(),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
        let path = PathBuf::from(expanded);
        if path.is_absolute() {
            path
        } else {
            self.base_dir.join(path)
        }
    }

    fn case_env(environment: &Environment, case: &TestCase, log_dir: &Path) -> Vec<(String, String)> {
        let machines = environment
            .machines
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let cfg = &case.setup_config;
        vec![
            ("FLEET_TEST_NAME".to_string(), case.name.clone()),
            (
                "FLEET_ITERATION".to_string(),
                cfg.iteration.map(|i| i.to_string()).unwrap_or_default(),
            ),
            ("FLEET_ENVIRONMENT".to_string(), environment.name.clone()),
            ("FLEET_MACHINES".to_string(), machines),
            ("FLEET_ADDRESSES".to_string(), environment.addresses()),
            (
                "FLEET_LOCATION".to_string(),
                cfg.location.clone().unwrap_or_default(),
            ),
            ("FLEET_IMAGE".to_string(), cfg.image.clone().unwrap_or_default()),
            (
                "FLEET_LOG_DIR".to_string(),
                log_dir.to_string_lossy().into_owned(),
            ),
        ]
    }
}

#[async_trait]
impl CaseRunner for ScriptRunner {
    async fn run_case(&self, environment: &Environment, case: &TestCase) -> ExecutionOutcome {
        let script = self.resolve(&case.script);
        if !script.is_file() {
            return ExecutionOutcome::aborted(format!("script not found: {}", script.display()));
        }
        for file in &case.files {
            let path = self.resolve(file);
            if !path.exists() {
                return ExecutionOutcome::aborted(format!(
                    "missing dependency: {}",
                    path.display()
                ));
            }
        }

        let log_dir = self
            .log_dir
            .join(&environment.name)
            .join(case.display_name().replace('#', "-"));
        if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
            warn!("Could not create log directory {}: {}", log_dir.display(), e);
        }

        let env = Self::case_env(environment, case, &log_dir);
        let cmd = shell_words::quote(&script.to_string_lossy()).into_owned();
        let timeout = Duration::from_secs(case.timeout_secs);

        debug!("Running {} against {}", case.display_name(), environment.name);
        match self.shell.run_with(&cmd, &env, timeout).await {
            Ok(output) => interpret(&output),
            Err(ProviderError::Timeout(_)) => {
                ExecutionOutcome::aborted(format!("timed out after {}s", case.timeout_secs))
            }
            Err(e) => ExecutionOutcome::aborted(e.to_string()),
        }
    }
}

fn status_token(line: &str) -> Option<Outcome> {
    match line.trim() {
        "TestCompleted" => Some(Outcome::Pass),
        "TestFailed" => Some(Outcome::Fail),
        "TestAborted" => Some(Outcome::Aborted),
        "TestSkipped" => Some(Outcome::Skipped),
        _ => None,
    }
}

/// Maps script output to an outcome.
fn interpret(output: &ShellOutput) -> ExecutionOutcome {
    let reported = output.stdout.lines().rev().find_map(status_token);

    let telemetry = output.stdout.lines().rev().find_map(|line| {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .filter(|v| v.is_object())
    });

    let outcome = match reported {
        Some(outcome) => outcome,
        None if output.success() => Outcome::Pass,
        None => Outcome::Fail,
    };

    let summary = match outcome {
        Outcome::Pass => format!("completed in {:.1}s", output.duration.as_secs_f64()),
        _ if !output.stderr.trim().is_empty() || !output.success() => output.error_line(),
        _ => outcome.as_str().to_lowercase(),
    };

    let result = ExecutionOutcome::new(outcome, summary);
    match telemetry {
        Some(telemetry) => result.with_telemetry(telemetry),
        None => result,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Machine;

    fn env() -> Environment {
        Environment::new("rg-1", "ready").with_machine(Machine::new("vm-0", "10.0.0.4"))
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn runner(dir: &Path) -> ScriptRunner {
        ScriptRunner::new(ShellRunner::new("/bin/sh"), dir, dir.join("logs"))
    }

    #[tokio::test]
    async fn test_exit_code_maps_to_outcome() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "ok.sh", "exit 0");
        write_script(dir.path(), "bad.sh", "echo 'assertion failed' >&2; exit 1");
        let runner = runner(dir.path());

        let ok = TestCase::new("OK", "small").with_script("ok.sh");
        assert_eq!(runner.run_case(&env(), &ok).await.outcome, Outcome::Pass);

        let bad = TestCase::new("BAD", "small").with_script("bad.sh");
        let outcome = runner.run_case(&env(), &bad).await;
        assert_eq!(outcome.outcome, Outcome::Fail);
        assert_eq!(outcome.summary, "assertion failed");
    }

    #[tokio::test]
    async fn test_status_token_wins_over_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "skip.sh", "echo TestSkipped; exit 1");
        let runner = runner(dir.path());

        let case = TestCase::new("SKIP", "small").with_script("skip.sh");
        assert_eq!(runner.run_case(&env(), &case).await.outcome, Outcome::Skipped);
    }

    #[tokio::test]
    async fn test_script_sees_environment_and_reports_telemetry() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "perf.sh",
            r#"echo "{\"target\": \"$FLEET_ADDRESSES\", \"test\": \"$FLEET_TEST_NAME\"}"
echo TestCompleted"#,
        );
        let runner = runner(dir.path());

        let case = TestCase::new("PERF", "small").with_script("perf.sh");
        let outcome = runner.run_case(&env(), &case).await;

        assert_eq!(outcome.outcome, Outcome::Pass);
        let telemetry = outcome.telemetry.unwrap();
        assert_eq!(telemetry["target"], "10.0.0.4");
        assert_eq!(telemetry["test"], "PERF");
        assert!(dir.path().join("logs/rg-1/PERF").is_dir());
    }

    #[tokio::test]
    async fn test_missing_dependency_aborts() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "ok.sh", "exit 0");
        let runner = runner(dir.path());

        let mut case = TestCase::new("DEP", "small").with_script("ok.sh");
        case.files.push(PathBuf::from("missing.tar.gz"));

        let outcome = runner.run_case(&env(), &case).await;
        assert_eq!(outcome.outcome, Outcome::Aborted);
        assert!(outcome.summary.starts_with("missing dependency"));

        let missing = TestCase::new("NOPE", "small").with_script("nope.sh");
        assert_eq!(
            runner.run_case(&env(), &missing).await.outcome,
            Outcome::Aborted
        );
    }

    #[tokio::test]
    async fn test_timeout_aborts() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "slow.sh", "sleep 5");
        let runner = runner(dir.path());

        let mut case = TestCase::new("SLOW", "small").with_script("slow.sh");
        case.timeout_secs = 1;

        let outcome = runner.run_case(&env(), &case).await;
        assert_eq!(outcome.outcome, Outcome::Aborted);
        assert_eq!(outcome.summary, "timed out after 1s");
    }
}
