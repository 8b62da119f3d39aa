// UI layer: everything the user sees. Prompts use `dialoguer`, progress uses
// `indicatif` and the failure summary is coloured with `crossterm`. The
// functions are small and synchronous; the work itself happens in `app`.

use anyhow::Result;
use crossterm::style::Stylize;
use dialoguer::Input;
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::auth::DeviceCode;
use crate::pipeline::{BatchReport, BatchReporter, Download};
use crate::workflow::{parse_choice, Workflow};

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Print a message and leave it on screen briefly before the window closes.
pub fn notice(message: &str) {
    println!("{message}");
    thread::sleep(Duration::from_secs(2));
}

/// Show the user code and open the verification page in the browser.
pub fn announce_device_code(code: &DeviceCode) {
    println!("Performing first-time setup.");
    println!("Confirm the user code {} in your browser...", code.user_code.as_str().bold());
    thread::sleep(Duration::from_secs(2));
    if let Err(e) = open::that(&code.verification_uri_complete) {
        warn!("Failed to open browser: {e}");
        println!("Open {} to continue.", code.verification_uri_complete);
    }
}

/// List the workflows and ask for a 1-based number until a valid one is given.
pub fn choose_workflow(workflows: &[Workflow]) -> Result<String> {
    println!("Please choose a workflow.\n");
    for (index, workflow) in workflows.iter().enumerate() {
        println!("{}   {}", index + 1, workflow.display_name);
    }
    println!();

    loop {
        let input: String = Input::new()
            .with_prompt("Workflow number")
            .allow_empty(true)
            .interact_text()?;
        match parse_choice(workflows, &input) {
            Ok(id) => return Ok(id.to_string()),
            Err(_) => println!("\nInvalid input. Please try again."),
        }
    }
}

/// Renders batch progress as a bar over finished files, downloaded or failed.
pub struct ConsoleReporter {
    bar: ProgressBar,
}

impl ConsoleReporter {
    pub fn new(files: usize) -> Self {
        let bar = ProgressBar::new(files as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message("Uploading images to be processed...");
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl BatchReporter for ConsoleReporter {
    fn uploaded(&mut self, file: &Path) {
        self.bar.println(format!("   {} uploaded.", file_name(file)));
    }

    fn sweep(&mut self, pending: usize) {
        self.bar
            .set_message(format!("Checking for processed images... ({pending} pending)"));
    }

    fn downloaded(&mut self, file: &Path, _download: &Download) {
        self.bar.println(format!("   {} downloaded.", file_name(file)));
        self.bar.inc(1);
    }

    fn failed(&mut self, file: &Path, status: &str) {
        self.bar
            .println(format!("   {}", format!("{} failed: {status}", file_name(file)).red()));
        self.bar.inc(1);
    }
}

/// Print the failed files and how many results were downloaded.
pub fn print_summary(report: &BatchReport) {
    println!();
    for failed in &report.failed {
        let line = format!(
            "   {} could not be processed. Status: {}",
            file_name(&failed.path),
            failed.status
        );
        println!("{}", line.red());
    }
    println!(
        "{} processed, {} failed.",
        report.succeeded.to_string().green(),
        report.failed.len()
    );
}

/// Block until the user presses Enter.
pub fn wait_for_enter() -> Result<()> {
    let _: String = Input::new()
        .with_prompt("\nBatch complete. Press enter to quit")
        .allow_empty(true)
        .interact_text()?;
    Ok(())
}
