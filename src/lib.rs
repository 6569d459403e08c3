//! fleetrun: a test orchestrator that provisions virtual machines.
//!
//! Test cases declare the shape of environment they need. fleetrun groups
//! cases that can share an environment, provisions one environment per group
//! through a pluggable back-end, runs the cases on it in priority order, and
//! decides after every case whether to reuse, restart, replace, preserve or
//! destroy it.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Bucketizer** ([`bucket`]): expands iterations and locations, groups
//!   cases by setup requirements
//! - **Providers** ([`provider`]): provision and destroy environments (cloud,
//!   Hyper-V hosts, ready machines, guest VMs)
//! - **Orchestrator** ([`orchestrator`]): the per-group state machine and the
//!   parallel dispatcher
//! - **Report** ([`report`]): console and JSON-lines result sinks
//!
//! # Example
//!
//! ```no_run
//! use fleetrun::config::load_config;
//! use fleetrun::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("fleetrun.toml"))?;
//!     // ... set up provider, runner, sink ...
//!     Ok(())
//! }
//! ```

pub mod bucket;
pub mod catalog;
pub mod config;
pub mod context;
pub mod orchestrator;
pub mod outcome;
pub mod provider;
pub mod report;
pub mod shell;

// Re-export commonly used types
pub use bucket::{Bucketizer, ConfigurationError, SetupGroup};
pub use catalog::{SetupCatalog, SetupConfig, SetupType, TestCase};
pub use config::{Config, load_config};
pub use context::{RunContext, WorkerSlot};
pub use orchestrator::{Orchestrator, ParallelDispatcher, RunResult};
pub use outcome::{AggregateSummary, CaseResult, Outcome};
pub use provider::{Environment, Provider};
pub use report::ResultSink;
