use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const PIPELINE_DIR: &str = ".pipeline";
pub const CONFIG_FILE: &str = ".pipeline/config.yaml";

/// Default lock location, overridable through `paths.lock_file`.
pub const LOCK_FILE: &str = ".pipeline/run.lock";
/// Default task file location, overridable through `paths.task_file`.
pub const TASK_FILE: &str = ".pipeline/prd.json";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn pipeline_dir(root: &Path) -> PathBuf {
    root.join(PIPELINE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Resolve a configured path against the project root. Absolute paths are
/// kept as-is.
pub fn resolve(root: &Path, configured: &str) -> PathBuf {
    let p = Path::new(configured);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}
