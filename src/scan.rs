use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::AppResult;

/// Quarantine for terminally failed uploads.
pub const FAILED_DIR: &str = "_failed";
/// Non-activity files parked by the external pre-sweep.
pub const JUNK_DIR: &str = "_junk";
/// In-flight markers; reserved for external tooling.
pub const PROCESSING_DIR: &str = "_processing";

/// Create the reserved sibling directories inside the working folder.
pub fn setup_folders(root: &Path) -> AppResult<()> {
    for name in [FAILED_DIR, JUNK_DIR, PROCESSING_DIR] {
        fs::create_dir_all(root.join(name))?;
    }
    Ok(())
}

/// Candidate `.fit` files directly under `root`, sorted by path. Only
/// direct children qualify, so the reserved subdirectories are never
/// picked up as new candidates.
pub fn scan_candidates(root: &Path) -> AppResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_file() && has_fit_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn has_fit_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("fit"))
        .unwrap_or(false)
}
