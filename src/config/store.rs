//! Resolution of a target's configuration from the files on disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::{debug, info};

use super::jsonc::strip_comments;
use super::{apply_defaults, builtin_defaults, merge_layers, Config, ConfigMap, Hypervisor};
use crate::error::{BuildError, Result};
use crate::paths::{slash_path, AppDirs};
use crate::script::Profile;
use crate::template::{TemplateEngine, TemplateId};

/// A named build spec resolved to its template file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    pub name: String,
    pub spec_path: PathBuf,
    pub hypervisor: Hypervisor,
}

/// Everything [`ConfigStore::load`] produces for one build.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub target: BuildTarget,
    /// All layers merged.
    pub config: Config,
    /// The rendered build spec, with profile provisioners attached.
    pub build_spec: ConfigMap,
    /// Customization profile named by the config, if any.
    pub profile: Option<Profile>,
}

pub struct ConfigStore<'a> {
    dirs: &'a AppDirs,
    engine: &'a TemplateEngine,
}

impl<'a> ConfigStore<'a> {
    pub fn new(dirs: &'a AppDirs, engine: &'a TemplateEngine) -> Self {
        Self { dirs, engine }
    }

    /// Resolve `target` and merge every configuration layer for it.
    pub fn load(&self, config_file: &Path, target: &str) -> Result<ResolvedConfig> {
        let spec_id = TemplateId::BuildSpec(target.to_string());
        let spec_path = self.engine.path_of(&spec_id);
        if !spec_path.is_file() {
            return Err(BuildError::ConfigNotFound {
                kind: "Template",
                name: target.to_string(),
                path: spec_path,
            });
        }

        self.bootstrap(config_file)?;

        let mut base = read_config_map(config_file)?;
        self.inject_derived(&mut base, target);
        apply_defaults(&mut base, builtin_defaults());

        let rendered = self
            .engine
            .render(&spec_id, &Config::from_map(base.clone()))?;
        let mut build_spec = parse_object(&rendered, &format!("build spec '{target}'"))?;

        let merged = merge_layers([base, build_spec.clone()]);

        let mut overlay = ConfigMap::new();
        let profile = match merged.get("profile").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => {
                let profile = self.load_profile(name)?;
                let script = format!(
                    "{}/{}",
                    slash_path(self.dirs.cache_dir()),
                    profile.script_name()
                );
                attach_profile_script(&mut build_spec, &script);
                overlay.insert("profile_script".into(), Value::String(script));
                if let Some(provisioners) = build_spec.get("provisioners") {
                    overlay.insert("provisioners".into(), provisioners.clone());
                }
                Some(profile)
            }
            _ => None,
        };

        let config = Config::from_map(merge_layers([merged, overlay]));
        let target = BuildTarget {
            name: target.to_string(),
            spec_path,
            hypervisor: config.hypervisor(),
        };
        debug!(target = %target.name, hypervisor = %target.hypervisor, "configuration resolved");

        Ok(ResolvedConfig {
            target,
            config,
            build_spec,
            profile,
        })
    }

    /// Load a customization profile from the config dir.
    pub fn load_profile(&self, name: &str) -> Result<Profile> {
        let path = self.dirs.profile_file(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BuildError::ConfigNotFound {
                    kind: "Profile",
                    name: name.to_string(),
                    path,
                })
            }
            Err(e) => {
                return Err(BuildError::io(
                    format!("reading profile '{}'", path.display()),
                    e,
                ))
            }
        };
        let stripped = strip_comments(&text)
            .map_err(|e| BuildError::parse(path.display().to_string(), e))?;
        Profile::from_json(name, &stripped)
            .map_err(|e| BuildError::parse(path.display().to_string(), e))
    }

    /// First run: populate the base config from the shipped example.
    fn bootstrap(&self, config_file: &Path) -> Result<()> {
        if config_file.exists() {
            return Ok(());
        }
        println!(
            "Default configuration doesn't exist. Populating one: {}",
            config_file.display()
        );
        if let Some(parent) = config_file.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BuildError::io(format!("creating '{}'", parent.display()), e))?;
        }
        let example = self.dirs.example_config();
        fs::copy(&example, config_file).map_err(|e| {
            BuildError::io(
                format!(
                    "copying default config '{}' to '{}'",
                    example.display(),
                    config_file.display()
                ),
                e,
            )
        })?;
        info!(path = %config_file.display(), "created default configuration");
        Ok(())
    }

    /// Path and identity keys templates rely on. These replace user values.
    fn inject_derived(&self, map: &mut ConfigMap, target: &str) {
        let derived = [
            ("cache_dir", slash_path(self.dirs.cache_dir())),
            ("dir", slash_path(self.dirs.data_dir())),
            ("template_name", target.to_string()),
            ("config_dir", slash_path(self.dirs.config_dir())),
        ];
        for (key, value) in derived {
            map.insert(key.into(), Value::String(value));
        }
    }
}

/// Read a comment-tolerant config file and return it as strict JSON text.
pub fn read_stripped(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path)
        .map_err(|e| BuildError::io(format!("reading '{}'", path.display()), e))?;
    strip_comments(&text).map_err(|e| BuildError::parse(path.display().to_string(), e))
}

fn read_config_map(path: &Path) -> Result<ConfigMap> {
    let stripped = read_stripped(path)?;
    parse_object(&stripped, &path.display().to_string())
}

fn parse_object(text: &str, origin: &str) -> Result<ConfigMap> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(BuildError::parse(
            origin,
            format!("expected a JSON object, found {}", kind_of(&other)),
        )),
        Err(e) => Err(BuildError::parse(origin, e)),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Append a PowerShell provisioner running `script` unless one already does.
fn attach_profile_script(build_spec: &mut ConfigMap, script: &str) {
    let provisioners = build_spec
        .entry("provisioners")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(list) = provisioners else {
        return;
    };
    let referenced = list.iter().any(|p| {
        p.get("scripts")
            .and_then(Value::as_array)
            .is_some_and(|scripts| scripts.iter().any(|s| s.as_str() == Some(script)))
    });
    if !referenced {
        list.push(json!({
            "type": "powershell",
            "scripts": [script],
        }));
    }
}
