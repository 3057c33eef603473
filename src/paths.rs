use std::path::{Path, PathBuf};

use crate::config::CONFIG_DIR;

/// Directory the project's relative paths resolve against.
///
/// That is the directory holding `.ttyjobs/` when a config file was found,
/// otherwise `cwd`.
pub fn project_root(config_path: Option<&Path>, cwd: &Path) -> PathBuf {
    config_path
        .and_then(|p| p.parent())
        .filter(|dir| dir.file_name().is_some_and(|n| n == CONFIG_DIR))
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.to_path_buf())
}

/// Resolve a configured path: absolute paths stay, relative ones hang off
/// `root`.
pub fn resolve(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}
