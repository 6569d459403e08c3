//! JSON-lines result file.
//!
//! One record per test case, appended as soon as the case completes, then a
//! final summary record:
//!
//! ```text
//! {"type":"case","name":"VERIFY-BOOT","iteration":null,"group":"small/...","outcome":"pass",...}
//! {"type":"summary","summary":{"passed":1,"failed":0,"aborted":0,"skipped":0,"elapsed":12.5},"cleanup_failures":[]}
//! ```
//!
//! Parent directories are created automatically.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use super::ResultSink;
use crate::catalog::TestCase;
use crate::orchestrator::RunResult;
use crate::outcome::{AggregateSummary, CaseResult, CleanupFailure};

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Record<'a> {
    Case(&'a CaseResult),
    Summary {
        summary: &'a AggregateSummary,
        cleanup_failures: &'a [CleanupFailure],
    },
}

/// Sink writing one JSON object per line.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> std::io::Result<BufWriter<File>> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(BufWriter::new(File::create(&self.path)?))
    }

    fn write(&self, record: &Record<'_>) {
        let Ok(mut guard) = self.writer.lock() else {
            return;
        };
        if guard.is_none() {
            match self.open() {
                Ok(w) => *guard = Some(w),
                Err(e) => {
                    warn!("Cannot open {}: {}", self.path.display(), e);
                    return;
                }
            }
        }
        let Some(writer) = guard.as_mut() else {
            return;
        };

        let result = serde_json::to_writer(&mut *writer, record)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(e) = result {
            warn!("Failed to write to {}: {}", self.path.display(), e);
        }
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn on_run_start(&self, _total: usize) {
        match self.open() {
            Ok(w) => {
                if let Ok(mut guard) = self.writer.lock() {
                    *guard = Some(w);
                }
            }
            Err(e) => warn!("Cannot create {}: {}", self.path.display(), e),
        }
    }

    async fn on_case_start(&self, _case: &TestCase) {}

    async fn on_case_complete(&self, result: &CaseResult) {
        self.write(&Record::Case(result));
    }

    async fn on_run_complete(&self, result: &RunResult) {
        self.write(&Record::Summary {
            summary: &result.summary,
            cleanup_failures: &result.cleanup_failures,
        });
    }
}
