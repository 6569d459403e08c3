//! Per-run context shared by the bucketizer, state machine and providers.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::catalog::SetupCatalog;
use crate::config::RunPolicy;

/// Which slice of a parallel run this process or task is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSlot {
    /// Zero-based worker index.
    pub index: usize,
    /// Total number of workers.
    pub count: usize,
}

impl WorkerSlot {
    /// Suffix that keeps resource names of different workers apart.
    pub fn suffix(&self) -> String {
        format!("w{}", self.index)
    }
}

impl fmt::Display for WorkerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

impl FromStr for WorkerSlot {
    type Err = String;

    /// Parses `i/N` with `0 <= i < N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, count) = s
            .split_once('/')
            .ok_or_else(|| format!("expected worker slot '{}' in the form i/N", s))?;
        let index: usize = index
            .trim()
            .parse()
            .map_err(|e| format!("invalid worker index '{}': {}", index, e))?;
        let count: usize = count
            .trim()
            .parse()
            .map_err(|e| format!("invalid worker count '{}': {}", count, e))?;
        if count == 0 || index >= count {
            return Err(format!("worker index {} out of range for {} workers", index, count));
        }
        Ok(Self { index, count })
    }
}

/// Everything a run needs besides its collaborators.
///
/// Built once per run (or once per parallel worker) and passed down by
/// reference; nothing in the crate reads run settings from globals.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: String,
    policy: RunPolicy,
    setups: Arc<SetupCatalog>,
    worker: Option<WorkerSlot>,
    output_dir: PathBuf,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, policy: RunPolicy, setups: Arc<SetupCatalog>) -> Self {
        Self {
            run_id: run_id.into(),
            policy,
            setups,
            worker: None,
            output_dir: PathBuf::from("test-results"),
        }
    }

    /// Generates a run id of the form `20240131235959-AB12`.
    pub fn generate_run_id() -> String {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let tag: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(4)
            .collect();
        format!("{}-{}", stamp, tag.to_uppercase())
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Returns a copy of this context scoped to one parallel worker.
    pub fn for_worker(&self, slot: WorkerSlot) -> Self {
        let mut ctx = self.clone();
        ctx.worker = Some(slot);
        ctx
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn policy(&self) -> &RunPolicy {
        &self.policy
    }

    pub fn setups(&self) -> &SetupCatalog {
        &self.setups
    }

    pub fn worker(&self) -> Option<WorkerSlot> {
        self.worker
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.output_dir
    }

    /// Name under which an environment is provisioned.
    ///
    /// With `use_existing_rg` this is the configured existing environment;
    /// otherwise it is derived from the run id, setup type, group index and a
    /// per-group deployment sequence number. Parallel workers always get a
    /// worker suffix so two workers never share an environment.
    pub fn environment_name(&self, setup_type: &str, group: usize, deployment: usize) -> String {
        let base = match (&self.policy.existing_environment, self.policy.use_existing_rg) {
            (Some(existing), true) => existing.clone(),
            _ => format!(
                "{}-{}-{}-g{}-d{}",
                self.policy.resource_prefix, self.run_id, setup_type, group, deployment
            ),
        };
        let name = match self.worker {
            Some(slot) if slot.count > 1 => format!("{}-{}", base, slot.suffix()),
            _ => base,
        };
        sanitize_name(&name)
    }
}

/// Lowercases and replaces anything outside `[a-z0-9-]` with `-`.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' }
        })
        .collect()
}
