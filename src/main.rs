// Entrypoint for the batch client.
// - Every argument is a folder to search for images.
// - Logging goes to stderr, `warn` and above unless RUST_LOG says otherwise.

use env_logger::{Builder, Env};
use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
    Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp_secs()
        .init();

    let dirs: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    autoretouch_batch::app::run(dirs)
}
