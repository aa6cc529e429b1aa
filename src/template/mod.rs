//! Rendering of build specs, answer files and Vagrantfiles.
//!
//! Templates live under the install root in one directory per category:
//!
//! ```text
//! data/
//! ├── templates/<target>.json              build specs (+ snippets/ for includes)
//! ├── installconfig/<os-id>/Autounattend.xml
//! └── vagrantfiles/analyst_<hypervisor>.rb, box_win.rb
//! ```
//!
//! Rendering only substitutes and expands the markup described in
//! [`syntax`]; what comes out is opaque text. Build specs are re-parsed as
//! JSON by their consumers, and a parse failure there is a config error,
//! not a template error.

mod guest;
mod render;
mod syntax;

pub use guest::guest_os_id;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::cache::ArtifactCache;
use crate::config::{Config, Hypervisor};
use crate::error::BuildError;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("{name}:{line}: {message}")]
    Syntax {
        name: String,
        line: usize,
        message: String,
    },

    #[error("rendering {name}: {message}")]
    Render { name: String, message: String },

    #[error("reading template {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A parsed template.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    nodes: Vec<syntax::Node>,
}

impl Template {
    pub fn parse(name: &str, source: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            name: name.to_string(),
            nodes: syntax::parse(name, source)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn nodes(&self) -> &[syntax::Node] {
        &self.nodes
    }

    pub(crate) fn render(
        &self,
        ctx: &Map<String, Value>,
        loader: &dyn render::Loader,
    ) -> Result<String, TemplateError> {
        let mut out = String::new();
        render::Renderer::new(&self.name, ctx, loader).render(&self.nodes, &mut out)?;
        Ok(out)
    }
}

/// Which template to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateId {
    /// `templates/<name>.json`
    BuildSpec(String),
    /// `installconfig/<os-id>/Autounattend.xml`
    AnswerFile(String),
    /// `vagrantfiles/analyst_<hypervisor>.rb`
    EnvDescriptor(Hypervisor),
    /// `vagrantfiles/box_win.rb`, embedded into the built box.
    BoxVagrantfile,
}

impl TemplateId {
    fn category(&self) -> &'static str {
        match self {
            TemplateId::BuildSpec(_) => "templates",
            TemplateId::AnswerFile(_) => "installconfig",
            TemplateId::EnvDescriptor(_) | TemplateId::BoxVagrantfile => "vagrantfiles",
        }
    }

    fn relative_path(&self) -> PathBuf {
        match self {
            TemplateId::BuildSpec(name) => PathBuf::from(format!("{name}.json")),
            TemplateId::AnswerFile(os_id) => Path::new(os_id).join("Autounattend.xml"),
            TemplateId::EnvDescriptor(hv) => PathBuf::from(format!("analyst_{hv}.rb")),
            TemplateId::BoxVagrantfile => PathBuf::from("box_win.rb"),
        }
    }
}

/// Loads templates from the install root and renders them.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    root: PathBuf,
}

impl TemplateEngine {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into(),
        }
    }

    pub fn path_of(&self, id: &TemplateId) -> PathBuf {
        self.root.join(id.category()).join(id.relative_path())
    }

    /// Sorted names of every shipped build spec.
    pub fn build_specs(&self) -> Result<Vec<String>, TemplateError> {
        let dir = self.root.join("templates");
        let entries = fs::read_dir(&dir).map_err(|source| TemplateError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| TemplateError::Io {
                    path: dir.clone(),
                    source,
                })?
                .path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn render(&self, id: &TemplateId, config: &Config) -> Result<String, TemplateError> {
        let path = self.path_of(id);
        debug!(template = %path.display(), "rendering");
        let template = self.load_path(&path)?;
        let loader = CategoryLoader {
            engine: self,
            dir: self.root.join(id.category()),
        };
        template.render(config.as_map(), &loader)
    }

    /// Render the answer file for the config's guest OS into the cache.
    pub fn write_answer_file(
        &self,
        config: &Config,
        cache: &mut ArtifactCache,
    ) -> Result<PathBuf, BuildError> {
        let os_id = guest_os_id(config)?;
        let text = self.render(&TemplateId::AnswerFile(os_id), config)?;
        cache.write("Autounattend.xml", &text)
    }

    /// Render the Vagrantfile embedded into the box into the cache.
    pub fn write_box_vagrantfile(
        &self,
        config: &Config,
        cache: &mut ArtifactCache,
    ) -> Result<PathBuf, BuildError> {
        let text = self.render(&TemplateId::BoxVagrantfile, config)?;
        cache.write("box_win.rb", &text)
    }

    fn load_path(&self, path: &Path) -> Result<Template, TemplateError> {
        let source = fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                TemplateError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                TemplateError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let name = path
            .strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        Template::parse(&name, &source)
    }
}

/// Resolves includes relative to the including template's category dir.
struct CategoryLoader<'a> {
    engine: &'a TemplateEngine,
    dir: PathBuf,
}

impl render::Loader for CategoryLoader<'_> {
    fn load(&self, name: &str) -> Result<Template, TemplateError> {
        let relative = Path::new(name);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(TemplateError::Render {
                name: name.to_string(),
                message: "include paths must stay inside the template directory".into(),
            });
        }
        self.engine.load_path(&self.dir.join(relative))
    }
}
