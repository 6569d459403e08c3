//! Machine-level lifecycle commands shared by every back-end.
//!
//! Restart, reachability probes and the per-test setup/cleanup hooks work
//! the same way regardless of how an environment was created: a command
//! template is rendered once per machine and run through the shell layer.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{Environment, Machine, ProviderError, ProviderResult};
use crate::catalog::TestCase;
use crate::config::LifecycleCommands;
use crate::shell::{ShellRunner, render};

/// Lifecycle command templates bound to a shell runner.
#[derive(Debug, Clone)]
pub struct MachineCommands {
    runner: ShellRunner,
    config: LifecycleCommands,
}

impl MachineCommands {
    pub fn new(config: LifecycleCommands) -> Self {
        let runner = ShellRunner::new(config.shell.clone())
            .with_env(config.env.clone())
            .with_timeout(Duration::from_secs(config.command_timeout_secs));
        Self { runner, config }
    }

    /// Shell runner configured with the provider's shell, env and timeout.
    pub fn runner(&self) -> &ShellRunner {
        &self.runner
    }

    pub fn config(&self) -> &LifecycleCommands {
        &self.config
    }

    fn render_for(
        template: &str,
        environment: &Environment,
        machine: &Machine,
        case: Option<&TestCase>,
    ) -> String {
        let test = case.map(|c| c.name.as_str()).unwrap_or("");
        render(template, &[
            ("name", &environment.name),
            ("machine", &machine.name),
            ("address", &machine.address),
            ("test", test),
        ])
    }

    /// Whether every machine answers the probe command.
    ///
    /// Without a probe command every environment counts as reachable.
    pub async fn probe(&self, environment: &Environment) -> bool {
        let Some(template) = &self.config.probe_command else {
            return true;
        };

        for machine in &environment.machines {
            let cmd = Self::render_for(template, environment, machine, None);
            let probe_timeout = Duration::from_secs(self.config.probe_interval_secs.max(1) * 3);
            match self.runner.run_with(&cmd, &[], probe_timeout).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    debug!(
                        "{} ({}) not reachable: {}",
                        machine.name,
                        machine.address,
                        output.error_line()
                    );
                    return false;
                }
                Err(e) => {
                    debug!("Probe of {} failed: {}", machine.name, e);
                    return false;
                }
            }
        }
        true
    }

    /// Probes until the environment answers or `timeout` elapses.
    pub async fn wait_until_reachable(&self, environment: &Environment, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let interval = Duration::from_secs(self.config.probe_interval_secs);

        loop {
            if self.probe(environment).await {
                return true;
            }
            if Instant::now() + interval > deadline {
                return false;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Restarts every machine, then waits for the environment to come back.
    pub async fn restart(&self, environment: &Environment) -> bool {
        let Some(template) = &self.config.restart_command else {
            warn!(
                "No restart_command configured, cannot restart {}",
                environment.name
            );
            return false;
        };

        for machine in &environment.machines {
            let cmd = Self::render_for(template, environment, machine, None);
            match self.runner.run(&cmd).await {
                Ok(output) if output.success() => {
                    info!("Restarted {} in {}", machine.name, environment.name);
                }
                Ok(output) => {
                    warn!(
                        "Restart of {} failed: {}",
                        machine.name,
                        output.error_line()
                    );
                    return false;
                }
                Err(e) => {
                    warn!("Restart of {} failed: {}", machine.name, e);
                    return false;
                }
            }
        }

        let timeout = Duration::from_secs(self.config.restart_timeout_secs);
        if self.wait_until_reachable(environment, timeout).await {
            true
        } else {
            warn!(
                "{} not reachable within {:?} after restart",
                environment.name, timeout
            );
            false
        }
    }

    /// Runs the setup hook on every machine.
    pub async fn run_setup(&self, environment: &Environment, case: &TestCase) -> ProviderResult<()> {
        match &self.config.setup_command {
            Some(template) => self.run_each("setup", template, environment, case).await,
            None => Ok(()),
        }
    }

    /// Runs the per-test cleanup hook on every machine.
    pub async fn run_case_cleanup(
        &self,
        environment: &Environment,
        case: &TestCase,
    ) -> ProviderResult<()> {
        match &self.config.case_cleanup_command {
            Some(template) => self.run_each("cleanup", template, environment, case).await,
            None => Ok(()),
        }
    }

    async fn run_each(
        &self,
        what: &str,
        template: &str,
        environment: &Environment,
        case: &TestCase,
    ) -> ProviderResult<()> {
        for machine in &environment.machines {
            let cmd = Self::render_for(template, environment, machine, Some(case));
            self.runner
                .run_checked(what, &cmd)
                .await
                .map_err(|e| match e {
                    ProviderError::CommandFailed { what, detail } => ProviderError::CommandFailed {
                        what: format!("{} on {}", what, machine.name),
                        detail,
                    },
                    other => other,
                })?;
        }
        Ok(())
    }
}

/// Parses `name address` lines printed by deploy commands.
///
/// Blank lines and lines starting with `#` are skipped. A line with a single
/// word is a machine whose name is also its address.
pub fn parse_machines(stdout: &str) -> Vec<Machine> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let address = parts.next().unwrap_or(name);
            Some(Machine::new(name, address))
        })
        .collect()
}
