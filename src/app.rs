// Orchestration of one run: check the input, log in, pick a workflow and
// process every image found under the given folders.

use anyhow::{bail, Context, Result};
use log::info;
use std::path::PathBuf;

use crate::api::ApiClient;
use crate::auth::{Authenticator, DeviceAuthFlow};
use crate::credentials::CredentialStore;
use crate::files::{preflight, Preflight};
use crate::pipeline::ExecutionPipeline;
use crate::settings::Settings;
use crate::{ui, workflow};

/// Run the batch for the folders given on the command line.
pub fn run(dirs: Vec<PathBuf>) -> Result<()> {
    let files = match preflight(&dirs) {
        Preflight::NoFolders => {
            ui::notice("No folders given. Please drag one or more folders onto the app.");
            return Ok(());
        }
        Preflight::NoImages => {
            ui::notice("No images detected.");
            return Ok(());
        }
        Preflight::Ready(files) => files,
    };
    info!("Found {} images in {} folders", files.len(), dirs.len());

    let settings = Settings::from_env()?;
    let client = ApiClient::new(&settings)?;
    let store = CredentialStore::new(&settings.config_path);
    let session = store.load();

    let flow = DeviceAuthFlow::new(&client, store, ui::announce_device_code);
    let mut auth = Authenticator::new(flow, session);
    auth.ensure_session().context("Could not authorise this device")?;

    let workflows = workflow::list_workflows(&client, &mut auth)?;
    if workflows.is_empty() {
        bail!("No workflows are available for this organization");
    }
    let workflow_id = ui::choose_workflow(&workflows)?;

    println!("\n");
    let pipeline = ExecutionPipeline::new(&client, settings.batch_options());
    let mut reporter = ui::ConsoleReporter::new(files.len());
    let report = pipeline.run_batch(&mut auth, &workflow_id, &files, &mut reporter);
    reporter.finish();
    let report = report?;

    ui::print_summary(&report);
    ui::wait_for_enter()
}
