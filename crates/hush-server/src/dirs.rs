//! Where the store file lives on disk.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;

/// File name of the redb store inside the data directory.
pub const DB_FILE: &str = "hush.db";

/// The configured data directory, or the platform one
/// (`~/.local/share/hush/` on Linux). Created if missing.
pub fn data_dir(configured: Option<&Path>) -> Result<PathBuf> {
    let path = match configured {
        Some(dir) => dir.to_owned(),
        None => platform_dir()?,
    };
    ensure_dir(&path)?;
    Ok(path)
}

/// Path of the store file inside [`data_dir`].
pub fn db_path(configured: Option<&Path>) -> Result<PathBuf> {
    Ok(data_dir(configured)?.join(DB_FILE))
}

fn platform_dir() -> Result<PathBuf> {
    ProjectDirs::from("", "", "hush")
        .map(|dirs| dirs.data_dir().to_owned())
        .context("could not determine platform data directory")
}

fn ensure_dir(path: &Path) -> Result<()> {
    if path.exists() && !path.is_dir() {
        bail!("data dir is not a directory: {}", path.display());
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("create data dir: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        assert_eq!(data_dir(Some(&nested)).unwrap(), nested);
        assert!(nested.is_dir());
    }

    #[test]
    fn db_file_sits_in_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_path(Some(dir.path())).unwrap();
        assert_eq!(path, dir.path().join(DB_FILE));
        assert!(!path.exists());
    }

    #[test]
    fn file_in_the_way_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("taken");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let err = data_dir(Some(&blocker)).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }
}
