use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use autoretouch_batch::auth::{Bearer, SessionProvider};
use autoretouch_batch::error::{AuthError, CatalogError, ExecutionError};
use autoretouch_batch::files::{self, OUTPUT_DIR};
use autoretouch_batch::pipeline::{
    BatchOptions, BatchReporter, Download, ExecutionPipeline, ExecutionStatus, FailedFile,
    ProcessingApi, StatusReport, TIMED_OUT,
};
use autoretouch_batch::workflow::{self, Workflow};

/// Hands out a fixed bearer and counts how often it was asked.
#[derive(Default)]
struct StaticSession {
    calls: usize,
    fail: bool,
}

impl SessionProvider for StaticSession {
    fn bearer(&mut self) -> Result<Bearer, AuthError> {
        self.calls += 1;
        if self.fail {
            return Err(AuthError::RefreshFailed("HTTP 403: invalid_grant".into()));
        }
        Ok(Bearer {
            access_token: "token".into(),
            organization_id: "org".into(),
            user_agent: "test-pc".into(),
        })
    }
}

/// Processing API whose execution statuses are scripted per source file name.
#[derive(Default)]
struct FakeApi {
    scripts: HashMap<String, VecDeque<&'static str>>,
    reject_upload: Vec<String>,
    executions: RefCell<HashMap<String, String>>,
    polls: RefCell<Vec<String>>,
    downloads: Cell<usize>,
}

impl FakeApi {
    fn script(mut self, file: &str, statuses: &[&'static str]) -> Self {
        self.scripts
            .insert(file.to_string(), statuses.iter().copied().collect());
        self
    }

    fn poll_count(&self, id: &str) -> usize {
        self.polls.borrow().iter().filter(|p| p.as_str() == id).count()
    }
}

impl ProcessingApi for FakeApi {
    fn list_workflows(&self, bearer: &Bearer) -> Result<Vec<Workflow>, CatalogError> {
        assert_eq!(bearer.access_token, "token");
        Ok(vec![
            Workflow {
                id: "wf-b".into(),
                display_name: "Background".into(),
            },
            Workflow {
                id: "wf-a".into(),
                display_name: "Alpha".into(),
            },
        ])
    }

    fn create_execution(
        &self,
        _bearer: &Bearer,
        workflow_id: &str,
        file: &Path,
    ) -> Result<String, ExecutionError> {
        assert_eq!(workflow_id, "wf-1");
        let name = file.file_name().unwrap().to_string_lossy().into_owned();
        if self.reject_upload.contains(&name) {
            return Err(ExecutionError::Upload {
                path: file.to_path_buf(),
                status: 402,
                body: "no credits".into(),
            });
        }
        let id = format!("exec-{name}");
        self.executions.borrow_mut().insert(id.clone(), name);
        Ok(id)
    }

    fn execution_status(
        &self,
        _bearer: &Bearer,
        execution_id: &str,
    ) -> Result<StatusReport, ExecutionError> {
        self.polls.borrow_mut().push(execution_id.to_string());
        let name = self.executions.borrow()[execution_id].clone();
        let script = &self.scripts[&name];
        let index = self.poll_count(execution_id) - 1;
        let status = script[index.min(script.len() - 1)];
        let result_path = (status == "COMPLETED").then(|| format!("/image/{execution_id}/{name}"));
        Ok(StatusReport {
            status: status.to_string().into(),
            result_path,
        })
    }

    fn fetch_result(&self, _bearer: &Bearer, result_path: &str) -> Result<Vec<u8>, ExecutionError> {
        self.downloads.set(self.downloads.get() + 1);
        Ok(format!("retouched {result_path}").into_bytes())
    }
}

#[derive(Default)]
struct RecordingReporter {
    uploaded: Vec<PathBuf>,
    downloaded: Vec<PathBuf>,
    failed: Vec<(PathBuf, String)>,
    sweeps: Vec<usize>,
}

impl BatchReporter for RecordingReporter {
    fn uploaded(&mut self, file: &Path) {
        self.uploaded.push(file.to_path_buf());
    }

    fn sweep(&mut self, pending: usize) {
        self.sweeps.push(pending);
    }

    fn downloaded(&mut self, _file: &Path, download: &Download) {
        self.downloaded.push(download.path.clone());
    }

    fn failed(&mut self, file: &Path, status: &str) {
        self.failed.push((file.to_path_buf(), status.to_string()));
    }
}

fn no_sleep(_: Duration) {}

fn images(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            fs::write(&path, b"raw image").unwrap();
            path
        })
        .collect()
}

fn output_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir.join(OUTPUT_DIR))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn failed_execution_is_reported_and_others_downloaded() {
    let dir = tempfile::tempdir().unwrap();
    let files = images(dir.path(), &["file1.jpg", "file2.jpg", "file3.png"]);
    let api = FakeApi::default()
        .script("file1.jpg", &["CREATED", "ACTIVE", "COMPLETED"])
        .script("file2.jpg", &["ACTIVE", "ERROR"])
        .script("file3.png", &["COMPLETED"]);
    let mut session = StaticSession::default();
    let mut reporter = RecordingReporter::default();

    let report = ExecutionPipeline::new(&api, BatchOptions::default())
        .with_sleep(no_sleep)
        .run_batch(&mut session, "wf-1", &files, &mut reporter)
        .unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(
        report.failed,
        vec![FailedFile {
            path: files[1].clone(),
            status: "ERROR".into(),
        }]
    );
    assert_eq!(api.downloads.get(), 2);
    assert_eq!(output_files(dir.path()), vec!["file1.jpg", "file3.png"]);
    assert_eq!(reporter.uploaded, files);
    assert_eq!(reporter.sweeps, vec![3, 2, 1]);
}

#[test]
fn terminal_executions_are_never_polled_again() {
    let dir = tempfile::tempdir().unwrap();
    let files = images(dir.path(), &["slow.jpg", "fast.jpg"]);
    let api = FakeApi::default()
        .script("slow.jpg", &["CREATED", "ACTIVE", "ACTIVE", "ACTIVE", "COMPLETED"])
        .script("fast.jpg", &["CANCELLED"]);
    let mut session = StaticSession::default();

    let report = ExecutionPipeline::new(&api, BatchOptions::default())
        .with_sleep(no_sleep)
        .run_batch(&mut session, "wf-1", &files, &mut ())
        .unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed[0].status, "CANCELLED");
    assert_eq!(api.poll_count("exec-fast.jpg"), 1);
    assert_eq!(api.poll_count("exec-slow.jpg"), 5);
}

#[test]
fn session_is_checked_before_every_call() {
    let dir = tempfile::tempdir().unwrap();
    let files = images(dir.path(), &["a.jpg"]);
    let api = FakeApi::default().script("a.jpg", &["ACTIVE", "COMPLETED"]);
    let mut session = StaticSession::default();

    ExecutionPipeline::new(&api, BatchOptions::default())
        .with_sleep(no_sleep)
        .run_batch(&mut session, "wf-1", &files, &mut ())
        .unwrap();

    // One upload, two polls, one download.
    assert_eq!(session.calls, 4);
}

#[test]
fn rejected_upload_is_recorded_and_batch_continues() {
    let dir = tempfile::tempdir().unwrap();
    let files = images(dir.path(), &["ok.jpg", "broke.jpg"]);
    let mut api = FakeApi::default().script("ok.jpg", &["COMPLETED"]);
    api.reject_upload.push("broke.jpg".into());
    let mut session = StaticSession::default();

    let report = ExecutionPipeline::new(&api, BatchOptions::default())
        .with_sleep(no_sleep)
        .run_batch(&mut session, "wf-1", &files, &mut ())
        .unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].path, files[1]);
    assert!(report.failed[0].status.contains("402"));
}

#[test]
fn auth_failure_aborts_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let files = images(dir.path(), &["a.jpg"]);
    let api = FakeApi::default().script("a.jpg", &["COMPLETED"]);
    let mut session = StaticSession {
        fail: true,
        ..Default::default()
    };

    let err = ExecutionPipeline::new(&api, BatchOptions::default())
        .with_sleep(no_sleep)
        .run_batch(&mut session, "wf-1", &files, &mut ())
        .unwrap_err();

    assert!(matches!(err, AuthError::RefreshFailed(_)));
    assert_eq!(api.downloads.get(), 0);
}

#[test]
fn max_wait_gives_up_on_pending_executions() {
    let dir = tempfile::tempdir().unwrap();
    let files = images(dir.path(), &["stuck.jpg"]);
    let api = FakeApi::default().script("stuck.jpg", &["ACTIVE"]);
    let mut session = StaticSession::default();
    let options = BatchOptions {
        sweep_delay: Duration::ZERO,
        max_wait: Some(Duration::ZERO),
    };

    let report = ExecutionPipeline::new(&api, options)
        .with_sleep(no_sleep)
        .run_batch(&mut session, "wf-1", &files, &mut ())
        .unwrap();

    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed[0].status, TIMED_OUT);
    assert_eq!(api.poll_count("exec-stuck.jpg"), 1);
}

#[test]
fn download_creates_output_dir_once() {
    let dir = tempfile::tempdir().unwrap();
    let source = images(dir.path(), &["pic.jpg"]).remove(0);
    fs::create_dir(dir.path().join(OUTPUT_DIR)).unwrap();
    let api = FakeApi::default();
    let mut session = StaticSession::default();
    let pipeline = ExecutionPipeline::new(&api, BatchOptions::default());

    let download = pipeline
        .download(&mut session, "/image/1/pic_result.jpg", &source)
        .unwrap();

    assert_eq!(download.path, files::result_destination(&source, "/image/1/pic_result.jpg"));
    assert_eq!(fs::read(&download.path).unwrap(), b"retouched /image/1/pic_result.jpg");
    assert_eq!(download.bytes, "retouched /image/1/pic_result.jpg".len());
}

#[test]
fn poll_status_is_a_single_query() {
    let dir = tempfile::tempdir().unwrap();
    let files = images(dir.path(), &["a.jpg"]);
    let api = FakeApi::default().script("a.jpg", &["ACTIVE", "COMPLETED"]);
    let mut session = StaticSession::default();
    let pipeline = ExecutionPipeline::new(&api, BatchOptions::default());

    let id = pipeline.submit(&mut session, "wf-1", &files[0]).unwrap();
    let first = pipeline.poll_status(&mut session, &id).unwrap();

    assert_eq!(first.status, ExecutionStatus::Active);
    assert_eq!(first.result_path, None);
    assert_eq!(api.poll_count(&id), 1);
}

#[test]
fn catalog_keeps_api_order() {
    let api = FakeApi::default();
    let mut session = StaticSession::default();

    let workflows = workflow::list_workflows(&api, &mut session).unwrap();

    let names: Vec<&str> = workflows.iter().map(|w| w.display_name.as_str()).collect();
    assert_eq!(names, vec!["Background", "Alpha"]);
    assert_eq!(workflow::resolve_choice(&workflows, 2), Ok("wf-a"));
}
