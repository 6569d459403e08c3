//! fleetrun CLI - VM test orchestrator.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fleetrun::bucket::Bucketizer;
use fleetrun::catalog::TestCase;
use fleetrun::config::{self, Config, ProviderConfig, ReportConfig, ResourceCleanup, WorkerMode};
use fleetrun::context::{RunContext, WorkerSlot};
use fleetrun::orchestrator::{
    Orchestrator, ParallelDispatcher, ProcessLauncher, RunResult, Scheduler, ScriptRunner,
    TaskLauncher, WorkerLauncher,
};
use fleetrun::provider::{
    Provider, cloud::CloudProvider, guest::GuestProvider, hyperv::HyperVProvider,
    ready::ReadyProvider,
};
use fleetrun::report::{ConsoleSink, JsonLinesSink, MultiSink, ResultSink};
use fleetrun::shell::ShellRunner;

#[derive(Parser)]
#[command(name = "fleetrun")]
#[command(about = "Test orchestrator that provisions virtual machines", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "fleetrun.toml")]
    config: PathBuf,

    /// Test catalog file, replacing the [[tests]] of the configuration
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run(RunArgs),

    /// Print how tests are grouped onto environments
    Groups,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Provider type (cloud, hyperv, ready, guest)
        #[arg(short, long, default_value = "ready")]
        provider: String,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Override the number of parallel workers
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Never destroy environments
    #[arg(long, conflicts_with = "delete")]
    keep: bool,

    /// Always destroy environments, even after failures
    #[arg(long)]
    delete: bool,

    /// Run id shared by all workers of a run
    #[arg(long)]
    run_id: Option<String>,

    /// Run only this worker's share of the catalog (i/N)
    #[arg(long, requires = "summary_file")]
    worker: Option<WorkerSlot>,

    /// Where a worker writes its summary
    #[arg(long)]
    summary_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(ref args) => run_tests(&cli, args).await,
        Commands::Groups => print_groups(&cli.config, cli.catalog.as_deref()),
        Commands::Validate => validate_config(&cli.config, cli.catalog.as_deref()),
        Commands::Init { ref provider } => init_config(&cli.config, provider),
    }
}

fn load(config_path: &Path, catalog_path: Option<&Path>) -> Result<(Config, Vec<TestCase>)> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let catalog = match catalog_path {
        Some(path) => config::load_catalog(path)?,
        None => config.tests.clone(),
    };
    Ok((config, catalog))
}

async fn run_tests(cli: &Cli, args: &RunArgs) -> Result<()> {
    let (mut config, catalog) = load(&cli.config, cli.catalog.as_deref())?;

    // Apply overrides
    if let Some(parallel) = args.parallel {
        config.run.parallel_workers = parallel;
    }
    if args.keep {
        config.run.resource_cleanup = ResourceCleanup::Keep;
    } else if args.delete {
        config.run.resource_cleanup = ResourceCleanup::Delete;
    }
    config.run.validate().context("Invalid run policy")?;

    if catalog.is_empty() {
        anyhow::bail!("No tests selected in {}", cli.config.display());
    }

    info!("Loaded configuration from {}", cli.config.display());

    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(RunContext::generate_run_id);
    let ctx = RunContext::new(
        run_id.clone(),
        config.run.clone(),
        Arc::new(config.setups.clone()),
    )
    .with_output_dir(config.report.output_dir.clone());

    let provider: Arc<dyn Provider> = Arc::from(build_provider(&config.provider, args.worker));
    info!("Using provider: {} (run {})", provider.name(), run_id);

    let base_dir = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let runner = Arc::new(ScriptRunner::new(
        ShellRunner::new("/bin/sh").with_working_dir(&base_dir),
        base_dir,
        config.report.output_dir.join("logs"),
    ));

    if let Some(slot) = args.worker {
        let cases = Scheduler::new(slot.count)
            .partition(&catalog)
            .into_iter()
            .nth(slot.index)
            .unwrap_or_default();
        info!("Worker {} running {} of {} tests", slot, cases.len(), catalog.len());

        let sink = build_sink(&config.report, Some(slot), cli.verbose);
        let orchestrator = Orchestrator::new(ctx.for_worker(slot), provider, runner, sink);
        let result = if cases.is_empty() {
            RunResult::default()
        } else {
            orchestrator.run(&cases).await?
        };
        finish(&config.report, &result);

        if let Some(path) = &args.summary_file {
            write_summary_file(path, &result)?;
        }
        std::process::exit(result.exit_code());
    }

    let workers = config.run.parallel_workers;
    if workers <= 1 {
        let sink = build_sink(&config.report, None, cli.verbose);
        let orchestrator = Orchestrator::new(ctx, provider, runner, sink);
        let result = orchestrator.run(&catalog).await?;
        finish(&config.report, &result);
        std::process::exit(result.exit_code());
    }

    let expected = Bucketizer::new(&config.setups, &config.run)
        .expand(&catalog)
        .len();
    let poll_interval = Duration::from_secs(config.run.poll_interval_secs);
    let sink = Arc::new(build_sink(&config.report, None, cli.verbose));

    let code = match config.run.worker_mode {
        WorkerMode::Task => {
            let launcher = TaskLauncher::new(ctx, provider, runner, sink.clone());
            dispatch(launcher, workers, poll_interval, &catalog, expected, &sink, &config).await
        }
        WorkerMode::Process => {
            let mut base_args = vec!["--config".to_string(), cli.config.display().to_string()];
            if let Some(path) = &cli.catalog {
                base_args.push("--catalog".to_string());
                base_args.push(path.display().to_string());
            }
            if cli.verbose {
                base_args.push("--verbose".to_string());
            }
            base_args.push("run".to_string());
            if args.keep {
                base_args.push("--keep".to_string());
            } else if args.delete {
                base_args.push("--delete".to_string());
            }

            let launcher = ProcessLauncher::current_exe(
                base_args,
                run_id,
                config.report.output_dir.join("workers"),
            )
            .context("Cannot locate the fleetrun executable")?;
            dispatch(launcher, workers, poll_interval, &catalog, expected, &sink, &config).await
        }
    };
    std::process::exit(code);
}

/// Runs the parallel dispatcher and reports the merged result. Returns the
/// exit code.
async fn dispatch<L: WorkerLauncher>(
    launcher: L,
    workers: usize,
    poll_interval: Duration,
    catalog: &[TestCase],
    expected: usize,
    sink: &Arc<MultiSink>,
    config: &Config,
) -> i32 {
    sink.on_run_start(expected).await;
    let dispatched = ParallelDispatcher::new(launcher, workers)
        .with_poll_interval(poll_interval)
        .dispatch(catalog, expected)
        .await;

    match dispatched {
        Ok(result) => {
            sink.on_run_complete(&result).await;
            finish(&config.report, &result);
            result.exit_code()
        }
        Err(e) => {
            let partial = e.partial().cloned().unwrap_or_default();
            sink.on_run_complete(&partial).await;
            finish(&config.report, &partial);
            error!("{}", e);
            1
        }
    }
}

/// Builds the configured provider. A worker process only gets its share of
/// ready machines.
fn build_provider(config: &ProviderConfig, worker: Option<WorkerSlot>) -> Box<dyn Provider> {
    match config {
        ProviderConfig::Cloud(cfg) => Box::new(CloudProvider::new(cfg.clone())),
        ProviderConfig::HyperV(cfg) => Box::new(HyperVProvider::new(cfg.clone())),
        ProviderConfig::Ready(cfg) => match worker {
            Some(slot) => Box::new(ReadyProvider::for_worker(cfg.clone(), slot)),
            None => Box::new(ReadyProvider::new(cfg.clone())),
        },
        ProviderConfig::Guest(cfg) => {
            let host = build_provider(&cfg.host, worker);
            Box::new(GuestProvider::new(cfg.clone(), host))
        }
    }
}

fn build_sink(report: &ReportConfig, worker: Option<WorkerSlot>, verbose: bool) -> MultiSink {
    let mut multi = MultiSink::new();

    if report.console {
        multi = multi.with_sink(ConsoleSink::new(verbose));
    }

    multi.with_sink(JsonLinesSink::new(results_path(report, worker)))
}

/// Results file, with a worker suffix so workers never share one.
fn results_path(report: &ReportConfig, worker: Option<WorkerSlot>) -> PathBuf {
    let Some(slot) = worker else {
        return report.output_dir.join(&report.results_file);
    };
    let file = Path::new(&report.results_file);
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results".to_string());
    let name = match file.extension() {
        Some(ext) => format!("{}-{}.{}", stem, slot.suffix(), ext.to_string_lossy()),
        None => format!("{}-{}", stem, slot.suffix()),
    };
    report.output_dir.join(name)
}

/// Without the console sink, still print the terminal summary line.
fn finish(report: &ReportConfig, result: &RunResult) {
    if !report.console {
        println!("{}", result.summary);
    }
}

/// Writes the worker's free-text summary followed by the summary line.
fn write_summary_file(path: &Path, result: &RunResult) -> Result<()> {
    let mut text = String::new();
    for note in &result.notes {
        let _ = writeln!(text, "{}", note);
    }
    for r in result.results.iter().filter(|r| !r.outcome.is_pass_like()) {
        let _ = writeln!(text, "{} [{}]: {}", r.display_name(), r.outcome, r.summary);
    }
    for failure in &result.cleanup_failures {
        let _ = writeln!(text, "cleanup failed: {}", failure);
    }
    let _ = writeln!(text, "{}", result.summary);

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write summary file {}", path.display()))
}

fn print_groups(config_path: &Path, catalog_path: Option<&Path>) -> Result<()> {
    let (config, catalog) = load(config_path, catalog_path)?;
    let bucketized = Bucketizer::new(&config.setups, &config.run).bucketize(&catalog);

    println!(
        "{} tests in {} groups:",
        bucketized.case_count(),
        bucketized.groups.len()
    );
    for (index, group) in bucketized.groups.iter().enumerate() {
        println!();
        println!("Group {}: {}", index, group.key());
        for case in group.cases() {
            println!("  {} (priority {})", case.display_name(), case.priority);
        }
    }

    if !bucketized.rejected.is_empty() {
        println!();
        println!("Rejected:");
        for rejected in &bucketized.rejected {
            println!("  {}: {}", rejected.case.display_name(), rejected.error);
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path, catalog_path: Option<&Path>) -> Result<()> {
    match load(config_path, catalog_path) {
        Ok((config, catalog)) => {
            let bucketized = Bucketizer::new(&config.setups, &config.run).bucketize(&catalog);

            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Provider: {}", config.provider.kind());
            println!("  Resource cleanup: {:?}", config.run.resource_cleanup);
            println!("  Parallel workers: {}", config.run.parallel_workers);
            println!("  Test iterations: {}", config.run.test_iterations);
            println!("  Setup types: {}", config.setups.len());
            println!("  Tests: {}", catalog.len());
            println!("  Groups: {}", bucketized.groups.len());

            if !bucketized.rejected.is_empty() {
                println!();
                println!("Tests that will abort:");
                for rejected in &bucketized.rejected {
                    println!("  {}: {}", rejected.case.display_name(), rejected.error);
                }
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path, provider: &str) -> Result<()> {
    let provider_config = match provider {
        "cloud" => {
            r#"[provider]
type = "cloud"
exists_command = "az group exists -n {name} | grep -q true"
list_command = "./scripts/list-vms.sh {name}"
deploy_command = "./scripts/deploy.sh {name} {location} {vm_size} {vm_count} {image}"
delete_command = "az group delete -n {name} --yes --no-wait"
restart_command = "az vm restart -g {name} -n {machine}"
probe_command = "nc -z -w 5 {address} 22"
default_location = "westus2""#
        }
        "hyperv" => {
            r#"[provider]
type = "hyperv"
hosts = ["hv-01", "hv-02"]
copy_image_command = "./scripts/copy-image.sh {host} {image}"
create_vm_command = "./scripts/create-vm.sh {host} {vm} {image} {vm_size}"
address_command = "./scripts/vm-address.sh {host} {vm}"
remove_vm_command = "./scripts/remove-vm.sh {host} {vm}"
probe_command = "nc -z -w 5 {address} 22""#
        }
        "ready" => {
            r#"[provider]
type = "ready"
machines = [{ name = "lab-01", address = "127.0.0.1" }]
probe_command = "ping -c 1 -W 2 {address}""#
        }
        "guest" => {
            r#"[provider]
type = "guest"
start_guest_command = "ssh root@{host_address} ./start-guest.sh {guest} {image}"
stop_guest_command = "ssh root@{host_address} ./stop-guest.sh {guest}"
guests_per_host = 1

[provider.host]
type = "ready"
machines = [{ name = "host-01", address = "10.0.0.9" }]"#
        }
        _ => {
            eprintln!(
                "Unknown provider: {}. Use: cloud, hyperv, ready, guest",
                provider
            );
            std::process::exit(1);
        }
    };

    let config = format!(
        r#"# fleetrun configuration file

[run]
resource_cleanup = "default"
reuse_vm_on_failure = false
deploy_vm_per_each_test = false
test_iterations = 1
parallel_workers = 1

{}

[setups.small]
vm_count = 1
size_class = "Standard_D2s_v3"

[[tests]]
name = "VERIFY-BOOT"
setup_type = "small"
priority = 0
script = "scripts/verify_boot.sh"

[report]
output_dir = "test-results"
results_file = "results.jsonl"
"#,
        provider_config
    );

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, config)?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  fleetrun run");

    Ok(())
}
