// Image discovery and output locations.

use std::path::{Path, PathBuf};

use log::warn;
use walkdir::WalkDir;

/// Extensions picked up from the input folders, compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Name of the folder results are written to, next to each source image.
pub const OUTPUT_DIR: &str = "autoRetouch";

/// Outcome of checking the command line before anything touches the network.
#[derive(Debug, PartialEq, Eq)]
pub enum Preflight {
    NoFolders,
    NoImages,
    Ready(Vec<PathBuf>),
}

/// Decide whether there is any work to do for the given folders.
pub fn preflight(dirs: &[PathBuf]) -> Preflight {
    if dirs.is_empty() {
        return Preflight::NoFolders;
    }
    let images = collect_images(dirs);
    if images.is_empty() {
        Preflight::NoImages
    } else {
        Preflight::Ready(images)
    }
}

/// Recursively collect image files under every folder, in walk order.
pub fn collect_images(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut images = Vec::new();
    for dir in dirs {
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", dir.display(), e);
                    continue;
                }
            };
            if entry.file_type().is_file() && is_image(entry.path()) {
                images.push(entry.into_path());
            }
        }
    }
    images
}

fn extension_lowercase(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

pub fn is_image(path: &Path) -> bool {
    extension_lowercase(path)
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Content type sent with the upload. Anything that isn't a PNG goes up as JPEG.
pub fn mime_for(path: &Path) -> &'static str {
    match extension_lowercase(path).as_deref() {
        Some("png") => "image/png",
        _ => "image/jpeg",
    }
}

/// Where the result for `source` is written: `<source dir>/autoRetouch/<result file name>`.
pub fn result_destination(source: &Path, result_path: &str) -> PathBuf {
    let file_name = result_path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("result");
    output_dir_for(source).join(file_name)
}

pub fn output_dir_for(source: &Path) -> PathBuf {
    source
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(OUTPUT_DIR)
}
