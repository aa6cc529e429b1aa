//! Error taxonomy for a build.
//!
//! Every failure aborts the remaining pipeline stages. The binary turns a
//! [`BuildError`] into a process exit code with [`BuildError::exit_code`],
//! except for [`BuildError::Interrupted`], which is re-raised as SIGINT once
//! temporary artifacts are gone.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::template::TemplateError;

/// Exit code for a missing target or profile.
pub const EXIT_NOT_FOUND: i32 = 2;
/// Exit code for a failed builder run.
pub const EXIT_BUILDER_FAILED: i32 = 3;
/// Exit code for a failed importer run.
pub const EXIT_IMPORTER_FAILED: i32 = 4;
/// Exit code for an output file that already exists.
pub const EXIT_OUTPUT_CONFLICT: i32 = 5;
/// Exit code for a builder binary that is not on `PATH`.
pub const EXIT_TOOL_MISSING: i32 = 254;
/// Exit code for every other fatal error.
pub const EXIT_GENERIC: i32 = 1;

/// Which external tool a process failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStage {
    /// The image builder (packer).
    Builder,
    /// The box importer (vagrant).
    Importer,
}

impl fmt::Display for ToolStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolStage::Builder => write!(f, "packer"),
            ToolStage::Importer => write!(f, "vagrant box add"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{kind} doesn't exist: {name} (looked in {})", path.display())]
    ConfigNotFound {
        kind: &'static str,
        name: String,
        path: PathBuf,
    },

    #[error("malformed {origin}: {reason}")]
    ConfigParse { origin: String, reason: String },

    #[error(transparent)]
    Template(TemplateError),

    #[error("{} already exists. Please move it away", path.display())]
    OutputConflict { path: PathBuf },

    #[error("{tool} not found (tried: {}). {hint}", candidates.join(", "))]
    ToolMissing {
        tool: &'static str,
        candidates: Vec<String>,
        hint: &'static str,
    },

    #[error("{stage} failed with return code {code}")]
    ToolFailed { stage: ToolStage, code: i32 },

    #[error("interrupted while running {stage}")]
    Interrupted { stage: ToolStage },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BuildError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn parse(origin: impl Into<String>, reason: impl fmt::Display) -> Self {
        BuildError::ConfigParse {
            origin: origin.into(),
            reason: reason.to_string(),
        }
    }

    /// Process exit code for this failure.
    ///
    /// `Interrupted` has no code of its own; callers re-raise the signal
    /// instead, so the generic code is only a fallback.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::ConfigNotFound { .. } => EXIT_NOT_FOUND,
            BuildError::ToolFailed {
                stage: ToolStage::Builder,
                ..
            } => EXIT_BUILDER_FAILED,
            BuildError::ToolFailed {
                stage: ToolStage::Importer,
                ..
            } => EXIT_IMPORTER_FAILED,
            BuildError::OutputConflict { .. } => EXIT_OUTPUT_CONFLICT,
            BuildError::ToolMissing { .. } => EXIT_TOOL_MISSING,
            BuildError::ConfigParse { .. }
            | BuildError::Template(_)
            | BuildError::Interrupted { .. }
            | BuildError::Io { .. } => EXIT_GENERIC,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, BuildError::Interrupted { .. })
    }
}

impl From<TemplateError> for BuildError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::NotFound { path } => BuildError::ConfigNotFound {
                kind: "Template",
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path,
            },
            other => BuildError::Template(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
