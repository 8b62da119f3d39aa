// Pipeline module: upload, poll and download of workflow executions. Every
// file is uploaded first, one after the other, creating one execution per
// file. The pending executions are then swept round-robin until each one has
// completed (and its result was downloaded) or ended in any other state.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::auth::{Bearer, SessionProvider};
use crate::error::{AuthError, CatalogError, ExecutionError};
use crate::files;
use crate::workflow::Workflow;

/// Status string recorded for executions abandoned after the maximum wait.
pub const TIMED_OUT: &str = "TIMED_OUT";

/// The processing API's endpoints.
pub trait ProcessingApi {
    fn list_workflows(&self, bearer: &Bearer) -> Result<Vec<Workflow>, CatalogError>;

    /// Upload `file` and start `workflow_id` on it, returning the execution id.
    fn create_execution(
        &self,
        bearer: &Bearer,
        workflow_id: &str,
        file: &Path,
    ) -> Result<String, ExecutionError>;

    fn execution_status(&self, bearer: &Bearer, execution_id: &str)
        -> Result<StatusReport, ExecutionError>;

    fn fetch_result(&self, bearer: &Bearer, result_path: &str) -> Result<Vec<u8>, ExecutionError>;
}

/// Status of an execution as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Created,
    Active,
    Completed,
    /// Any other status. The server's string is kept for the failure summary.
    Failed(String),
}

impl ExecutionStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, ExecutionStatus::Created | ExecutionStatus::Active)
    }
}

impl From<String> for ExecutionStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            "CREATED" => ExecutionStatus::Created,
            "ACTIVE" => ExecutionStatus::Active,
            "COMPLETED" => ExecutionStatus::Completed,
            _ => ExecutionStatus::Failed(status),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Created => f.write_str("CREATED"),
            ExecutionStatus::Active => f.write_str("ACTIVE"),
            ExecutionStatus::Completed => f.write_str("COMPLETED"),
            ExecutionStatus::Failed(status) => f.write_str(status),
        }
    }
}

/// One status query's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: ExecutionStatus,
    pub result_path: Option<String>,
}

/// A workflow run on one uploaded image.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: String,
    pub source: PathBuf,
    pub status: ExecutionStatus,
    pub result_path: Option<String>,
}

/// A result written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub path: PathBuf,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFile {
    pub path: PathBuf,
    pub status: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: Vec<FailedFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Pause after each sweep that left executions pending.
    pub sweep_delay: Duration,
    /// Give up on executions still pending after this long. `None` waits forever.
    pub max_wait: Option<Duration>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            sweep_delay: Duration::from_secs(1),
            max_wait: None,
        }
    }
}

/// Progress callbacks for a running batch.
pub trait BatchReporter {
    fn uploaded(&mut self, _file: &Path) {}
    fn sweep(&mut self, _pending: usize) {}
    fn downloaded(&mut self, _file: &Path, _download: &Download) {}
    fn failed(&mut self, _file: &Path, _status: &str) {}
}

impl BatchReporter for () {}

pub struct ExecutionPipeline<'a, A: ?Sized> {
    api: &'a A,
    options: BatchOptions,
    sleep: fn(Duration),
}

impl<'a, A: ProcessingApi + ?Sized> ExecutionPipeline<'a, A> {
    pub fn new(api: &'a A, options: BatchOptions) -> Self {
        Self {
            api,
            options,
            sleep: std::thread::sleep,
        }
    }

    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn submit<S>(
        &self,
        auth: &mut S,
        workflow_id: &str,
        file: &Path,
    ) -> Result<String, ExecutionError>
    where
        S: SessionProvider + ?Sized,
    {
        let bearer = auth.bearer()?;
        let id = self.api.create_execution(&bearer, workflow_id, file)?;
        info!("Created execution {id} for {}", file.display());
        Ok(id)
    }

    /// A single status query. Scheduling is up to the caller.
    pub fn poll_status<S>(
        &self,
        auth: &mut S,
        execution_id: &str,
    ) -> Result<StatusReport, ExecutionError>
    where
        S: SessionProvider + ?Sized,
    {
        let bearer = auth.bearer()?;
        self.api.execution_status(&bearer, execution_id)
    }

    /// Fetch a result and write it to the `autoRetouch` folder next to `source`.
    pub fn download<S>(
        &self,
        auth: &mut S,
        result_path: &str,
        source: &Path,
    ) -> Result<Download, ExecutionError>
    where
        S: SessionProvider + ?Sized,
    {
        let bearer = auth.bearer()?;
        let bytes = self.api.fetch_result(&bearer, result_path)?;

        let dest = files::result_destination(source, result_path);
        if let Some(dir) = dest.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ExecutionError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&dest, &bytes).map_err(|source| ExecutionError::Io {
            path: dest.clone(),
            source,
        })?;

        info!("Wrote {} ({} bytes)", dest.display(), bytes.len());
        Ok(Download {
            path: dest,
            bytes: bytes.len(),
        })
    }

    /// Upload every file, then sweep the pending executions until none are left.
    ///
    /// Per-file failures are collected in the report. Only authentication
    /// errors end the batch early.
    pub fn run_batch<S>(
        &self,
        auth: &mut S,
        workflow_id: &str,
        files: &[PathBuf],
        reporter: &mut dyn BatchReporter,
    ) -> Result<BatchReport, AuthError>
    where
        S: SessionProvider + ?Sized,
    {
        let mut report = BatchReport::default();
        let mut pending = Vec::with_capacity(files.len());

        for file in files {
            match self.submit(auth, workflow_id, file) {
                Ok(id) => {
                    reporter.uploaded(file);
                    pending.push(Execution {
                        id,
                        source: file.clone(),
                        status: ExecutionStatus::Created,
                        result_path: None,
                    });
                }
                Err(e) => record(&mut report, reporter, file, describe(e)?),
            }
        }

        let started = Instant::now();
        while !pending.is_empty() {
            reporter.sweep(pending.len());
            pending = self.sweep(auth, pending, &mut report, reporter)?;
            if pending.is_empty() {
                break;
            }

            if let Some(limit) = self.options.max_wait {
                if started.elapsed() >= limit {
                    warn!("Giving up on {} executions after {:?}", pending.len(), limit);
                    for execution in pending.drain(..) {
                        record(&mut report, reporter, &execution.source, TIMED_OUT.to_string());
                    }
                    break;
                }
            }
            (self.sleep)(self.options.sweep_delay);
        }

        Ok(report)
    }

    /// Poll every pending execution once and return those still pending.
    fn sweep<S>(
        &self,
        auth: &mut S,
        pending: Vec<Execution>,
        report: &mut BatchReport,
        reporter: &mut dyn BatchReporter,
    ) -> Result<Vec<Execution>, AuthError>
    where
        S: SessionProvider + ?Sized,
    {
        let mut still_pending = Vec::with_capacity(pending.len());
        for mut execution in pending {
            let status = match self.poll_status(auth, &execution.id) {
                Ok(status) => status,
                Err(e) => {
                    record(report, reporter, &execution.source, describe(e)?);
                    continue;
                }
            };
            debug!("Execution {} is {}", execution.id, status.status);
            execution.status = status.status;
            execution.result_path = status.result_path;

            if execution.status.is_pending() {
                still_pending.push(execution);
                continue;
            }
            match (&execution.status, execution.result_path.as_deref()) {
                (ExecutionStatus::Completed, Some(result_path)) => {
                    match self.download(auth, result_path, &execution.source) {
                        Ok(download) => {
                            report.succeeded += 1;
                            reporter.downloaded(&execution.source, &download);
                        }
                        Err(e) => record(report, reporter, &execution.source, describe(e)?),
                    }
                }
                (ExecutionStatus::Completed, None) => record(
                    report,
                    reporter,
                    &execution.source,
                    "COMPLETED without result path".to_string(),
                ),
                (status, _) => {
                    let status = status.to_string();
                    record(report, reporter, &execution.source, status);
                }
            }
        }
        Ok(still_pending)
    }
}

/// Turn a per-file error into the text shown in the summary, passing
/// authentication errors through.
fn describe(err: ExecutionError) -> Result<String, AuthError> {
    match err {
        ExecutionError::Auth(e) => Err(e),
        other => Ok(other.to_string()),
    }
}

fn record(report: &mut BatchReport, reporter: &mut dyn BatchReporter, file: &Path, status: String) {
    warn!("{} failed: {}", file.display(), status);
    reporter.failed(file, &status);
    report.failed.push(FailedFile {
        path: file.to_path_buf(),
        status,
    });
}
