//! Per-user directories and shipped resource locations.
//!
//! Resolution order for each root:
//! 1. `MALBOXES_CONFIG_DIR` / `MALBOXES_CACHE_DIR` / `MALBOXES_DATA_DIR`
//! 2. Platform default (`dirs::config_dir()/malboxes`, `dirs::cache_dir()/malboxes`)
//! 3. For the data root, `data/` next to the crate manifest

use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "malboxes";
const BUNDLED_DATA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data");

/// File name of the base configuration inside the config dir.
pub const CONFIG_FILE: &str = "config.js";

/// Directories used by one invocation.
#[derive(Debug, Clone)]
pub struct AppDirs {
    config_dir: PathBuf,
    cache_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppDirs {
    pub fn new(
        config_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config_dir: config_dir.into(),
            cache_dir: cache_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Resolve directories from the environment, falling back to platform defaults.
    pub fn discover() -> Result<Self> {
        let config_dir = match env::var_os("MALBOXES_CONFIG_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::config_dir()
                .context("cannot determine the user config directory")?
                .join(APP_NAME),
        };
        let cache_dir = match env::var_os("MALBOXES_CACHE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::cache_dir()
                .unwrap_or_else(env::temp_dir)
                .join(APP_NAME),
        };
        let data_dir = env::var_os("MALBOXES_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(BUNDLED_DATA_DIR));

        Ok(Self::new(config_dir, cache_dir, data_dir))
    }

    /// Create the config and cache directories if they don't exist.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.cache_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating directory '{}'", dir.display()))?;
        }
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Install root holding templates, answer files and scripts.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Shipped default config copied on first run.
    pub fn example_config(&self) -> PathBuf {
        self.data_dir.join("config-example.js")
    }

    pub fn profile_file(&self, profile: &str) -> PathBuf {
        self.config_dir.join("profiles").join(format!("{profile}.js"))
    }

    /// Directory of per-profile user scripts written by the profile-editing commands.
    pub fn user_scripts_dir(&self) -> PathBuf {
        self.config_dir.join("scripts").join("user").join("windows")
    }

    pub fn user_script(&self, profile: &str) -> PathBuf {
        self.user_scripts_dir().join(format!("{profile}.ps1"))
    }

    /// Index listing every profile that has a user script.
    pub fn user_scripts_index(&self) -> PathBuf {
        self.config_dir
            .join("scripts")
            .join("windows")
            .join("user_scripts.ps1")
    }
}

/// Render a path with forward slashes so templates work the same on every host.
pub fn slash_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_in_the_config_dir() {
        let dirs = AppDirs::new("/cfg", "/cache", "/data");
        assert_eq!(dirs.config_file(), PathBuf::from("/cfg/config.js"));
        assert_eq!(
            dirs.profile_file("maldoc"),
            PathBuf::from("/cfg/profiles/maldoc.js")
        );
        assert_eq!(
            dirs.user_script("alice"),
            PathBuf::from("/cfg/scripts/user/windows/alice.ps1")
        );
        assert_eq!(
            dirs.user_scripts_index(),
            PathBuf::from("/cfg/scripts/windows/user_scripts.ps1")
        );
    }

    #[test]
    fn slash_path_normalizes_backslashes() {
        assert_eq!(
            slash_path(Path::new(r"C:\Users\me\AppData")),
            "C:/Users/me/AppData"
        );
    }

    #[test]
    fn ensure_creates_config_and_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dirs = AppDirs::new(
            tmp.path().join("cfg"),
            tmp.path().join("cache"),
            tmp.path().join("data"),
        );
        dirs.ensure().unwrap();
        assert!(dirs.config_dir().is_dir());
        assert!(dirs.cache_dir().is_dir());
        assert!(!dirs.data_dir().exists());
    }
}
