use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const LOG_FOLDER_NAME: &str = "devel-install-logs";

/// Resolve the install root (absolute path).
///
/// An explicit root wins; otherwise the current working directory is used.
pub fn resolve_install_root(explicit: Option<&Path>) -> Result<PathBuf> {
    let base = match explicit {
        Some(p) => p.to_path_buf(),
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };

    if base.is_absolute() {
        return Ok(base);
    }

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    Ok(cwd.join(base))
}

/// Resolve a path relative to the install root unless it is already absolute.
pub fn resolve_under_root(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Resolve log folder (absolute path)
///
/// Logs never go inside the install root: everything there is re-owned and re-moded by the
/// permission-fix stage.
pub fn resolve_log_folder(explicit: Option<&Path>) -> Result<PathBuf> {
    let log_dir = match explicit {
        Some(p) => p.to_path_buf(),
        None => match dirs::data_local_dir() {
            Some(base) => base.join("devel-install").join("logs"),
            None => std::env::temp_dir().join(LOG_FOLDER_NAME),
        },
    };

    std::fs::create_dir_all(&log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder {:?}: {}", log_dir, e))?;
    Ok(log_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_absolute_root_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let root = resolve_install_root(Some(dir.path())).unwrap();
        assert_eq!(root, dir.path());
    }

    #[test]
    fn relative_root_is_made_absolute() {
        let root = resolve_install_root(Some(Path::new("site"))).unwrap();
        assert!(root.is_absolute());
        assert!(root.ends_with("site"));
    }

    #[test]
    fn resolve_under_root_keeps_absolute_paths() {
        let root = Path::new("/srv/www");
        assert_eq!(
            resolve_under_root(root, Path::new("/etc/profile.ini")),
            PathBuf::from("/etc/profile.ini")
        );
        assert_eq!(
            resolve_under_root(root, Path::new("devel_install_profile.ini")),
            PathBuf::from("/srv/www/devel_install_profile.ini")
        );
    }

    #[test]
    fn explicit_log_folder_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("logs");
        let resolved = resolve_log_folder(Some(&target)).unwrap();
        assert_eq!(resolved, target);
        assert!(target.is_dir());
    }
}
