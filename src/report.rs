//! Result sinks and console output.
//!
//! The orchestrator reports every test case exactly once through a
//! [`ResultSink`]. Sinks only observe; they never influence execution.
//!
//! | Sink | Output |
//! |------|--------|
//! | [`NullSink`] | nothing |
//! | [`MultiSink`] | fans out to several sinks |
//! | [`ConsoleSink`] | progress bar, per-test lines, final summary |
//! | [`JsonLinesSink`] | one JSON record per test plus a summary record |

pub mod jsonl;

pub use jsonl::JsonLinesSink;

use std::sync::Mutex;

use async_trait::async_trait;

use crate::catalog::TestCase;
use crate::orchestrator::RunResult;
use crate::outcome::{CaseResult, Outcome};

/// Receives test results as they are produced.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Called once with the number of test cases the run will report.
    async fn on_run_start(&self, total: usize);

    async fn on_case_start(&self, case: &TestCase);

    async fn on_case_complete(&self, result: &CaseResult);

    async fn on_run_complete(&self, result: &RunResult);
}

#[async_trait]
impl<S: ResultSink + ?Sized> ResultSink for std::sync::Arc<S> {
    async fn on_run_start(&self, total: usize) {
        (**self).on_run_start(total).await
    }

    async fn on_case_start(&self, case: &TestCase) {
        (**self).on_case_start(case).await
    }

    async fn on_case_complete(&self, result: &CaseResult) {
        (**self).on_case_complete(result).await
    }

    async fn on_run_complete(&self, result: &RunResult) {
        (**self).on_run_complete(result).await
    }
}

/// Sink that discards everything.
pub struct NullSink;

#[async_trait]
impl ResultSink for NullSink {
    async fn on_run_start(&self, _total: usize) {}
    async fn on_case_start(&self, _case: &TestCase) {}
    async fn on_case_complete(&self, _result: &CaseResult) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// Forwards every event to each contained sink in order.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink<S: ResultSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl ResultSink for MultiSink {
    async fn on_run_start(&self, total: usize) {
        for s in &self.sinks {
            s.on_run_start(total).await;
        }
    }

    async fn on_case_start(&self, case: &TestCase) {
        for s in &self.sinks {
            s.on_case_start(case).await;
        }
    }

    async fn on_case_complete(&self, result: &CaseResult) {
        for s in &self.sinks {
            s.on_case_complete(result).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for s in &self.sinks {
            s.on_run_complete(result).await;
        }
    }
}

fn styled(outcome: Outcome) -> console::StyledObject<&'static str> {
    match outcome {
        Outcome::Pass => console::style("PASS").green(),
        Outcome::Fail => console::style("FAIL").red(),
        Outcome::Aborted => console::style("ABRT").red().bold(),
        Outcome::Skipped => console::style("SKIP").yellow(),
    }
}

/// Console sink showing a progress bar and a summary.
pub struct ConsoleSink {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleSink {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }
}

#[async_trait]
impl ResultSink for ConsoleSink {
    async fn on_run_start(&self, total: usize) {
        println!("Running {} tests", total);

        let pb = indicatif::ProgressBar::new(total as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    async fn on_case_start(&self, case: &TestCase) {
        if self.verbose {
            let line = format!("Running: {}", case.display_name());
            let guard = self.progress.lock().ok();
            match guard.as_deref().and_then(Option::as_ref) {
                Some(pb) => pb.println(line),
                None => println!("{}", line),
            }
        }
    }

    async fn on_case_complete(&self, result: &CaseResult) {
        let Ok(progress) = self.progress.lock() else {
            return;
        };
        let line = format!(
            "{} {} {}",
            styled(result.outcome),
            result.display_name(),
            console::style(&result.summary).dim()
        );
        match progress.as_ref() {
            Some(pb) => {
                pb.inc(1);
                if self.verbose || !result.outcome.is_pass_like() {
                    pb.println(line);
                }
            }
            None => println!("{}", line),
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Some(pb) = self.progress.lock().ok().and_then(|mut p| p.take()) {
            pb.finish_and_clear();
        }
        print_summary(result);
    }
}

/// Prints the final summary of a run.
pub fn print_summary(result: &RunResult) {
    let summary = &result.summary;

    println!();
    println!("Test Results:");
    println!("  Total:   {}", summary.total());
    println!("  Passed:  {}", console::style(summary.passed).green());
    println!("  Failed:  {}", console::style(summary.failed).red());
    println!("  Aborted: {}", console::style(summary.aborted).red().bold());
    println!("  Skipped: {}", console::style(summary.skipped).yellow());
    println!("  Duration: {:.1}s", summary.elapsed.as_secs_f64());

    if !result.notes.is_empty() {
        println!();
        for note in &result.notes {
            println!("  {}", console::style(note).dim());
        }
    }

    if !result.cleanup_failures.is_empty() {
        println!();
        println!(
            "{}",
            console::style("Resources that could not be cleaned up:").yellow().bold()
        );
        for failure in &result.cleanup_failures {
            println!("  - {}", failure);
        }
    }

    println!();
    if summary.success() {
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
        println!();
        for r in result
            .results
            .iter()
            .filter(|r| !r.outcome.is_pass_like())
        {
            println!("  - {} [{}]", r.display_name(), r.outcome);
            if !r.summary.is_empty() {
                println!("    {}", console::style(&r.summary).dim());
            }
        }
    }

    // The terminal summary line; parallel workers are read back through it.
    println!("{}", summary);
}
