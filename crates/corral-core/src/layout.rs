use crate::CoreError;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout of a Corral storage root.
///
/// ```text
/// <root>/.lock
/// <root>/bases/<version>/
/// <root>/<handle>/
/// <root>/<handle>/workspace/
/// ```
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn bases_dir(&self) -> PathBuf {
        self.root.join("bases")
    }

    #[inline]
    pub fn base_path(&self, version: &str) -> PathBuf {
        self.bases_dir().join(version)
    }

    #[inline]
    pub fn env_path(&self, handle: &str) -> PathBuf {
        self.root.join(handle)
    }

    #[inline]
    pub fn workspace_dir(&self, handle: &str) -> PathBuf {
        self.env_path(handle).join("workspace")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn initialize(&self) -> Result<(), CoreError> {
        fs::create_dir_all(self.bases_dir())?;
        Ok(())
    }
}

/// `~/.corral/envs`, or a temp-dir fallback when `HOME` is unset.
pub fn default_storage_root() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".corral").join("envs"),
        None => std::env::temp_dir().join("corral").join("envs"),
    }
}

/// Version tags become directory names, so only a conservative character
/// set is accepted.
pub(crate) fn validate_version(version: &str) -> Result<(), CoreError> {
    let ok = !version.is_empty()
        && version != "."
        && version != ".."
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidArgument(format!(
            "invalid version tag: {version:?}"
        )))
    }
}
