use std::path::{Path, PathBuf};

use pipeline_core::paths;

/// Resolve the project root.
///
/// Priority:
/// 1. `--root` flag / `PIPELINE_ROOT` env var (passed in as `explicit`)
/// 2. Nearest ancestor of `cwd` containing `.pipeline/`
/// 3. Nearest ancestor of `cwd` containing `.git/`
/// 4. `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_root_from(&cwd)
}

fn find_root_from(start: &Path) -> PathBuf {
    nearest_with(start, paths::PIPELINE_DIR)
        .or_else(|| nearest_with(start, ".git"))
        .unwrap_or_else(|| start.to_path_buf())
}

fn nearest_with(start: &Path, marker: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(marker).is_dir())
        .map(Path::to_path_buf)
}
