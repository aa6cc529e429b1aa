//! Temporary build artifacts living in the cache directory.
//!
//! Every file created through an [`ArtifactCache`] is recorded by name and
//! removed when the cache is cleaned up or dropped, on success and failure
//! alike. In debug mode the files are kept for inspection.
//!
//! One cache instance belongs to one build. Two builds sharing a cache
//! directory at the same time will clobber each other's files; nothing here
//! locks against that.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{BuildError, Result};

#[derive(Debug)]
pub struct ArtifactCache {
    dir: PathBuf,
    retain: bool,
    artifacts: Vec<String>,
}

impl ArtifactCache {
    /// Open the cache at `dir`, creating it if needed.
    ///
    /// With `retain` set, [`cleanup`](Self::cleanup) leaves files on disk.
    pub fn open(dir: impl Into<PathBuf>, retain: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| BuildError::io(format!("creating cache dir '{}'", dir.display()), e))?;
        Ok(Self {
            dir,
            retain,
            artifacts: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Names registered so far, in creation order.
    pub fn artifacts(&self) -> &[String] {
        &self.artifacts
    }

    /// Create (or truncate) `name` in the cache and register it for cleanup.
    pub fn create(&mut self, name: &str) -> Result<File> {
        validate_name(name)?;
        let path = self.path(name);
        let file = File::create(&path)
            .map_err(|e| BuildError::io(format!("creating '{}'", path.display()), e))?;
        if !self.artifacts.iter().any(|known| known == name) {
            self.artifacts.push(name.to_string());
        }
        debug!(artifact = name, "registered cache artifact");
        Ok(file)
    }

    /// Write `contents` to a registered artifact and return its path.
    pub fn write(&mut self, name: &str, contents: &str) -> Result<PathBuf> {
        let mut file = self.create(name)?;
        let path = self.path(name);
        file.write_all(contents.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| BuildError::io(format!("writing '{}'", path.display()), e))?;
        Ok(path)
    }

    /// Remove every registered artifact unless the cache retains them.
    ///
    /// Files already gone are not an error. All removals are attempted even
    /// if one fails; the first failure is returned.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.retain {
            if !self.artifacts.is_empty() {
                info!(
                    count = self.artifacts.len(),
                    dir = %self.dir.display(),
                    "debug mode: keeping temporary files"
                );
            }
            self.artifacts.clear();
            return Ok(());
        }

        let mut first_err = None;
        for name in self.artifacts.drain(..) {
            let path = self.dir.join(&name);
            match fs::remove_file(&path) {
                Ok(()) => debug!(artifact = %name, "removed cache artifact"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to remove temporary file");
                    first_err.get_or_insert(BuildError::io(
                        format!("removing '{}'", path.display()),
                        e,
                    ));
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for ArtifactCache {
    fn drop(&mut self) {
        if self.artifacts.is_empty() {
            return;
        }
        if let Err(e) = self.cleanup() {
            warn!(error = %e, "cleanup of temporary files incomplete");
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(BuildError::io(
            format!("invalid cache artifact name '{name}'"),
            io::Error::from(io::ErrorKind::InvalidInput),
        ));
    }
    Ok(())
}
