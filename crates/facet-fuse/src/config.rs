//! Mount configuration.

use std::io;
use std::path::{Path, PathBuf};

/// Options for a facetfs mount.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Directory where the overlay becomes visible.
    pub mountpoint: PathBuf,
    /// Backing store root. Defaults to `<mountpoint>.store`.
    pub store: Option<PathBuf>,
    /// Allow access from users other than the mounting one.
    pub allow_other: bool,
}

impl MountConfig {
    pub fn new(mountpoint: PathBuf) -> Self {
        Self {
            mountpoint,
            store: None,
            allow_other: false,
        }
    }

    /// Effective backing-store root.
    pub fn store_path(&self) -> PathBuf {
        self.store.clone().unwrap_or_else(|| {
            let mut p = self.mountpoint.clone().into_os_string();
            p.push(".store");
            PathBuf::from(p)
        })
    }

    /// Checks the mountpoint/store pair is usable: both must be
    /// existing directories and must not be the same path, or the
    /// overlay would recurse into itself.
    pub fn validate(&self) -> io::Result<()> {
        let store = self.store_path();
        ensure_dir(&self.mountpoint)?;
        ensure_dir(&store)?;
        if same_path(&self.mountpoint, &store) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "backing store must not be the mountpoint itself",
            ));
        }
        Ok(())
    }
}

fn ensure_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", path.display()),
        ))
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_defaults_to_sibling() {
        let config = MountConfig::new(PathBuf::from("/mnt/media"));
        assert_eq!(config.store_path(), PathBuf::from("/mnt/media.store"));
    }

    #[test]
    fn explicit_store_wins() {
        let mut config = MountConfig::new(PathBuf::from("/mnt/media"));
        config.store = Some(PathBuf::from("/data/masters"));
        assert_eq!(config.store_path(), PathBuf::from("/data/masters"));
    }

    #[test]
    fn validate_requires_existing_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = MountConfig::new(tmp.path().join("mnt"));
        config.store = Some(tmp.path().join("store"));
        assert!(config.validate().is_err());

        std::fs::create_dir(tmp.path().join("mnt")).unwrap();
        std::fs::create_dir(tmp.path().join("store")).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_store_equal_to_mountpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = MountConfig::new(tmp.path().to_path_buf());
        config.store = Some(tmp.path().to_path_buf());
        assert!(config.validate().is_err());
    }
}
