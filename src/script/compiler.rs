//! Operation lists to PowerShell, and the user-script files they land in.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{InvalidOperation, Operation, CRLF};
use crate::error::{BuildError, Result};
use crate::paths::AppDirs;

/// Compiled commands for one profile, in operation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningScript {
    profile: String,
    lines: Vec<String>,
    skipped: Vec<InvalidOperation>,
}

impl ProvisioningScript {
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Commands without line terminators.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Operations that produced no command, in input order.
    pub fn skipped(&self) -> &[InvalidOperation] {
        &self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Script text, every line CRLF-terminated.
    pub fn text(&self) -> String {
        self.lines.iter().map(|l| format!("{l}{CRLF}")).collect()
    }

    /// Append the script to `path`, creating it and its parents if needed.
    pub fn append_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BuildError::io(format!("creating '{}'", parent.display()), e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| BuildError::io(format!("opening '{}'", path.display()), e))?;
        file.write_all(self.text().as_bytes())
            .map_err(|e| BuildError::io(format!("appending to '{}'", path.display()), e))
    }
}

/// Compile operations in order. Invalid ones are reported and skipped.
pub fn compile_operations(profile: &str, operations: &[Operation]) -> ProvisioningScript {
    let mut lines = Vec::with_capacity(operations.len());
    let mut skipped = Vec::new();
    for op in operations {
        match op.command() {
            Ok(line) => lines.push(line),
            Err(e) => {
                warn!(profile, operation = op.kind(), "{e}; skipping");
                skipped.push(e);
            }
        }
    }
    ProvisioningScript {
        profile: profile.to_string(),
        lines,
        skipped,
    }
}

/// Appends compiled operations to per-profile user scripts.
#[derive(Debug, Clone)]
pub struct ScriptCompiler {
    script_dir: PathBuf,
    index: PathBuf,
}

impl ScriptCompiler {
    pub fn new(script_dir: impl Into<PathBuf>, index: impl Into<PathBuf>) -> Self {
        Self {
            script_dir: script_dir.into(),
            index: index.into(),
        }
    }

    /// Compiler writing into the user's config dir.
    pub fn for_user(dirs: &AppDirs) -> Self {
        Self::new(dirs.user_scripts_dir(), dirs.user_scripts_index())
    }

    pub fn script_path(&self, profile: &str) -> PathBuf {
        self.script_dir.join(format!("{profile}.ps1"))
    }

    /// Compile `operations` and append them to the profile's script.
    ///
    /// The profile is registered in the index only when something was
    /// appended.
    pub fn compile(&self, profile: &str, operations: &[Operation]) -> Result<ProvisioningScript> {
        let script = compile_operations(profile, operations);
        if script.is_empty() {
            debug!(profile, "no commands compiled");
            return Ok(script);
        }
        script.append_to(&self.script_path(profile))?;
        self.register_profile(profile)?;
        Ok(script)
    }

    /// Add `<profile>.ps1` to the index unless a line already names it.
    ///
    /// Lines are compared whole rather than by substring, so registering
    /// `alice` is not suppressed by an existing `malice.ps1`.
    ///
    /// Returns whether the index changed.
    pub fn register_profile(&self, profile: &str) -> Result<bool> {
        let entry = format!("{profile}.ps1");
        let content = match fs::read_to_string(&self.index) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(BuildError::io(
                    format!("reading '{}'", self.index.display()),
                    e,
                ))
            }
        };
        if content.lines().any(|line| line.trim() == entry) {
            return Ok(false);
        }

        let mut addition = String::new();
        if !content.is_empty() && !content.ends_with('\n') {
            addition.push_str(CRLF);
        }
        addition.push_str(&entry);
        addition.push_str(CRLF);

        if let Some(parent) = self.index.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BuildError::io(format!("creating '{}'", parent.display()), e))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.index)
            .and_then(|mut f| f.write_all(addition.as_bytes()))
            .map_err(|e| BuildError::io(format!("updating '{}'", self.index.display()), e))?;
        debug!(profile, index = %self.index.display(), "registered user script");
        Ok(true)
    }
}
