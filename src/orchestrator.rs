//! The build pipeline and the other top-level workflows.
//!
//! A build walks `ConfigResolved → ArtifactsRendered → Built → Imported →
//! Done`. Any failure aborts the remaining stages; the [`ArtifactCache`] owned
//! by the build removes its files on every exit path unless debug mode keeps
//! them.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tracing::{debug, info};

use crate::cache::ArtifactCache;
use crate::config::{read_stripped, ConfigMap, ConfigStore, ResolvedConfig};
use crate::error::{BuildError, Result, ToolStage};
use crate::paths::AppDirs;
use crate::process::{self, ExternalTool, ProcessRunner, PACKER, VAGRANT};
use crate::script::{compile_operations, Operation, ProvisioningScript, ScriptCompiler};
use crate::template::{TemplateEngine, TemplateId};

/// Placeholder the builder substitutes with its `name` variable.
const BOX_NAME_PLACEHOLDER: &str = "{{user `name`}}";

const VAR_FILE: &str = "packer_var_file.json";

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Let both tools overwrite existing outputs.
    pub force: bool,
    pub skip_build: bool,
    pub skip_import: bool,
}

/// Pipeline position of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    ConfigResolved,
    ArtifactsRendered,
    Built,
    Imported,
    Done,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildState::ConfigResolved => "config resolved",
            BuildState::ArtifactsRendered => "artifacts rendered",
            BuildState::Built => "built",
            BuildState::Imported => "imported",
            BuildState::Done => "done",
        };
        f.write_str(s)
    }
}

/// Files rendered into the cache for one build.
struct RenderedArtifacts {
    template: PathBuf,
    var_file: PathBuf,
}

pub struct Orchestrator {
    dirs: AppDirs,
    engine: TemplateEngine,
    runner: ProcessRunner,
    debug: bool,
    tool_path: Option<OsString>,
}

impl Orchestrator {
    pub fn new(dirs: AppDirs, debug: bool) -> Self {
        let engine = TemplateEngine::new(dirs.data_dir());
        Self {
            dirs,
            engine,
            runner: ProcessRunner::new(),
            debug,
            tool_path: None,
        }
    }

    pub fn with_runner(mut self, runner: ProcessRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Search `path` for external tools instead of `PATH`.
    pub fn with_tool_path(mut self, path: impl Into<OsString>) -> Self {
        self.tool_path = Some(path.into());
        self
    }

    pub fn dirs(&self) -> &AppDirs {
        &self.dirs
    }

    /// Names of every shipped build target.
    pub fn list_targets(&self) -> Result<Vec<String>> {
        Ok(self.engine.build_specs()?)
    }

    /// Build `target` and import it as a Vagrant box.
    pub fn build(&self, target: &str, opts: &BuildOptions) -> Result<BuildState> {
        let store = ConfigStore::new(&self.dirs, &self.engine);
        let resolved = store.load(&self.dirs.config_file(), target)?;
        self.advance(target, BuildState::ConfigResolved);

        let box_path = if opts.skip_build && opts.skip_import {
            None
        } else {
            Some(self.box_path(&resolved)?)
        };
        if let Some(path) = &box_path {
            if !opts.force && !opts.skip_build && path.exists() {
                return Err(BuildError::OutputConflict { path: path.clone() });
            }
        }

        let mut cache = ArtifactCache::open(self.dirs.cache_dir(), self.debug)?;

        println!("Generating configuration files...");
        let artifacts = self.render_artifacts(&resolved, &mut cache)?;
        println!("Configuration files are ready");
        self.advance(target, BuildState::ArtifactsRendered);

        if opts.skip_build {
            info!("skipping packer build");
        } else {
            self.run_builder(&artifacts, opts)?;
        }
        self.advance(target, BuildState::Built);

        match (&box_path, opts.skip_import) {
            (Some(path), false) => self.run_importer(path, target, opts)?,
            _ => info!("skipping vagrant box add"),
        }
        self.advance(target, BuildState::Imported);

        cache.cleanup()?;
        self.advance(target, BuildState::Done);

        if !opts.skip_import {
            print_build_summary(target, self.dirs.cache_dir());
        }
        Ok(BuildState::Done)
    }

    /// Write a `Vagrantfile` for a new analysis VM named `name` into `dest`.
    ///
    /// Fails before loading any configuration if `dest` already has one.
    pub fn spin(&self, target: &str, name: &str, dest: &Path) -> Result<PathBuf> {
        let vagrantfile = dest.join("Vagrantfile");
        if vagrantfile.exists() {
            return Err(BuildError::OutputConflict { path: vagrantfile });
        }

        let store = ConfigStore::new(&self.dirs, &self.engine);
        let resolved = store.load(&self.dirs.config_file(), target)?;

        println!("Creating a Vagrantfile");
        let config = resolved.config.with_overrides([
            ("name", Value::String(name.to_string())),
            ("template_name", Value::String(target.to_string())),
        ]);
        let text = self
            .engine
            .render(&TemplateId::EnvDescriptor(resolved.target.hypervisor), &config)?;
        fs::write(&vagrantfile, text)
            .map_err(|e| BuildError::io(format!("writing '{}'", vagrantfile.display()), e))?;

        println!(
            "Vagrantfile generated. You can move it in your analysis directory \
             and issue a `vagrant up` to get started with your VM."
        );
        Ok(vagrantfile)
    }

    /// Append one operation to the user script of `profile`.
    pub fn edit_profile(&self, profile: &str, op: Operation) -> Result<ProvisioningScript> {
        ScriptCompiler::for_user(&self.dirs).compile(profile, &[op])
    }

    fn advance(&self, target: &str, state: BuildState) {
        debug!(target, %state, "build state");
    }

    fn box_path(&self, resolved: &ResolvedConfig) -> Result<PathBuf> {
        let output = box_output(&resolved.build_spec, &resolved.target.name)?;
        Ok(self.dirs.cache_dir().join(output))
    }

    fn render_artifacts(
        &self,
        resolved: &ResolvedConfig,
        cache: &mut ArtifactCache,
    ) -> Result<RenderedArtifacts> {
        let config = &resolved.config;
        self.engine.write_answer_file(config, cache)?;
        self.engine.write_box_vagrantfile(config, cache)?;

        if let Some(profile) = &resolved.profile {
            let script = compile_operations(profile.name(), profile.operations());
            cache.write(&profile.script_name(), &script.text())?;
        }

        let spec = serde_json::to_string_pretty(&Value::Object(resolved.build_spec.clone()))
            .map_err(|e| BuildError::parse(format!("build spec '{}'", resolved.target.name), e))?;
        let template = cache.write(&format!("{}.json", resolved.target.name), &spec)?;

        let vars = read_stripped(&self.dirs.config_file())?;
        let var_file = cache.write(VAR_FILE, &vars)?;

        Ok(RenderedArtifacts { template, var_file })
    }

    fn locate(&self, tool: &ExternalTool) -> Result<PathBuf> {
        match &self.tool_path {
            Some(path) => tool.locate_in(path),
            None => tool.locate(),
        }
    }

    fn run_builder(&self, artifacts: &RenderedArtifacts, opts: &BuildOptions) -> Result<()> {
        let packer = self.locate(&PACKER)?;
        let cache_dir = self.dirs.cache_dir();

        let mut cmd = Command::new(&packer);
        cmd.arg("build")
            .arg(format!("-var-file={}", artifacts.var_file.display()));
        if opts.force {
            cmd.arg("-force");
        }
        cmd.arg(&artifacts.template)
            .env("PACKER_CACHE_DIR", cache_dir)
            .env("TMPDIR", cache_dir);
        if self.debug {
            cmd.env("PACKER_LOG", "1");
        }

        println!("Starting packer to generate the VM");
        println!("----------------------------------");
        let code = process::with_working_dir(cache_dir, || {
            self.runner
                .run(cmd, ToolStage::Builder, &mut |line| println!("{line}"))
        })?;
        println!("----------------------------------");
        println!("packer completed with return code: {code}");

        if code != 0 {
            return Err(BuildError::ToolFailed {
                stage: ToolStage::Builder,
                code,
            });
        }
        Ok(())
    }

    fn run_importer(&self, box_path: &Path, target: &str, opts: &BuildOptions) -> Result<()> {
        let vagrant = self.locate(&VAGRANT)?;

        let mut cmd = Command::new(&vagrant);
        cmd.arg("box")
            .arg("add")
            .arg(box_path)
            .arg(format!("--name={target}"));
        if opts.force {
            cmd.arg("--force");
        }

        println!("Adding box into vagrant");
        println!("--------------------------");
        let code = self
            .runner
            .run(cmd, ToolStage::Importer, &mut |line| println!("{line}"))?;
        println!("--------------------------");
        println!("vagrant box add completed with return code: {code}");

        if code != 0 {
            return Err(BuildError::ToolFailed {
                stage: ToolStage::Importer,
                code,
            });
        }
        Ok(())
    }
}

/// `post-processors[0].output` with the box name filled in.
fn box_output(build_spec: &ConfigMap, target: &str) -> Result<String> {
    build_spec
        .get("post-processors")
        .and_then(|p| p.get(0))
        .and_then(|p| p.get("output"))
        .and_then(Value::as_str)
        .map(|output| output.replace(BOX_NAME_PLACEHOLDER, target))
        .ok_or_else(|| {
            BuildError::parse(
                format!("build spec '{target}'"),
                "missing post-processors[0].output",
            )
        })
}

fn print_build_summary(target: &str, cache_dir: &Path) {
    println!();
    println!("===============================================================");
    println!("A base box was imported into your local Vagrant box repository.");
    println!("You should generate a Vagrantfile configuration in order to");
    println!("launch an instance of your box:");
    println!();
    println!("malboxes spin {target} <analysis_name>");
    println!();
    println!("You can safely remove the {}/boxes/", cache_dir.display());
    println!("directory if you don't plan on hosting or sharing your base box.");
    println!();
    println!("You can re-use this base box several times by using `malboxes");
    println!("spin`. Each VM will be independent of each other.");
    println!("===============================================================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    const SPEC: &str = r#"{
  "builders": [{"type": "virtualbox-iso", "guest_os_type": "Windows7_64"}],
  "provisioners": [],
  "post-processors": [{"type": "vagrant", "output": "boxes/{% raw %}{{user `name`}}{% endraw %}.box"}]
}"#;

    struct Fixture {
        tmp: TempDir,
        orchestrator: Orchestrator,
    }

    impl Fixture {
        fn new(debug: bool, runner: ProcessRunner) -> Self {
            let tmp = TempDir::new().unwrap();
            let data = tmp.path().join("data");
            write(&data.join("templates/win7.json"), SPEC);
            write(&data.join("config-example.js"), "{\n  // user\n  \"username\": \"malboxes\"\n}\n");
            write(
                &data.join("installconfig/windows7_64/Autounattend.xml"),
                "<user>{{ username }}</user>",
            );
            write(&data.join("vagrantfiles/box_win.rb"), "# box {{ template_name }}\n");
            write(
                &data.join("vagrantfiles/analyst_virtualbox.rb"),
                "config.vm.box = \"{{ template_name }}\"\nvb.name = \"{{ name }}\"\n",
            );
            fs::create_dir_all(tmp.path().join("bin")).unwrap();
            fs::create_dir_all(tmp.path().join("work")).unwrap();

            let dirs = AppDirs::new(tmp.path().join("cfg"), tmp.path().join("cache"), &data);
            let orchestrator = Orchestrator::new(dirs, debug)
                .with_runner(runner)
                .with_tool_path(tmp.path().join("bin"));
            Self { tmp, orchestrator }
        }

        fn tool(&self, name: &str, script: &str) {
            let path = self.tmp.path().join("bin").join(name);
            write(&path, &format!("#!/bin/sh\n{script}\n"));
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }

        fn cache(&self) -> PathBuf {
            self.tmp.path().join("cache")
        }

        fn log(&self) -> String {
            fs::read_to_string(self.tmp.path().join("calls.log")).unwrap_or_default()
        }

        fn log_path(&self) -> String {
            self.tmp.path().join("calls.log").display().to_string()
        }
    }

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn runner() -> ProcessRunner {
        static NEVER: AtomicBool = AtomicBool::new(false);
        ProcessRunner::with_interrupt_flag(&NEVER)
    }

    fn cache_is_empty_except_boxes(dir: &Path) -> bool {
        fs::read_dir(dir)
            .unwrap()
            .all(|e| e.unwrap().file_name() == "boxes")
    }

    #[test]
    #[serial]
    fn full_build_runs_both_tools_and_cleans_up() {
        let fx = Fixture::new(false, runner());
        let log = fx.log_path();
        fx.tool(
            "packer",
            &format!("echo \"packer $* cwd=$(pwd)\" >> {log}\nmkdir -p boxes && touch boxes/win7.box"),
        );
        fx.tool("vagrant", &format!("echo \"vagrant $*\" >> {log}"));

        let state = fx.orchestrator.build("win7", &BuildOptions::default()).unwrap();
        assert_eq!(state, BuildState::Done);

        let log = fx.log();
        let cache = fx.cache().canonicalize().unwrap();
        assert!(log.contains(&format!("-var-file={}", fx.cache().join(VAR_FILE).display())));
        assert!(log.contains(&format!("cwd={}", cache.display())));
        assert!(log.contains(&format!(
            "vagrant box add {} --name=win7",
            fx.cache().join("boxes/win7.box").display()
        )));
        assert!(!log.contains("-force"));
        assert!(cache_is_empty_except_boxes(&fx.cache()));
    }

    #[test]
    #[serial]
    fn builder_failure_maps_to_exit_three_and_cleans_up() {
        let fx = Fixture::new(false, runner());
        fx.tool("packer", "echo broken; exit 1");
        fx.tool("vagrant", "exit 0");

        let err = fx
            .orchestrator
            .build("win7", &BuildOptions::default())
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(cache_is_empty_except_boxes(&fx.cache()));
    }

    #[test]
    #[serial]
    fn interrupted_builder_cleans_up() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let fx = Fixture::new(false, ProcessRunner::with_interrupt_flag(&FLAG));
        let log = fx.log_path();
        fx.tool(
            "packer",
            &format!(
                "trap 'echo caught >> {log}; exit 130' INT\n\
                 i=0\n\
                 while [ $i -lt 50 ]; do sleep 0.1; i=$((i+1)); done\n\
                 echo finished >> {log}"
            ),
        );
        fx.tool("vagrant", &format!("echo vagrant >> {log}"));

        let setter = std::thread::spawn(|| {
            std::thread::sleep(std::time::Duration::from_millis(300));
            FLAG.store(true, Ordering::SeqCst);
        });
        let err = fx
            .orchestrator
            .build("win7", &BuildOptions::default())
            .unwrap_err();
        setter.join().unwrap();

        assert!(err.is_interrupt(), "{err:?}");
        assert_eq!(fx.log(), "caught\n");
        assert!(cache_is_empty_except_boxes(&fx.cache()));
    }

    #[test]
    #[serial]
    fn importer_failure_maps_to_exit_four() {
        let fx = Fixture::new(false, runner());
        fx.tool("packer", "exit 0");
        fx.tool("vagrant", "exit 2");

        let err = fx
            .orchestrator
            .build("win7", &BuildOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::ToolFailed {
                stage: ToolStage::Importer,
                code: 2
            }
        ));
        assert_eq!(err.exit_code(), 4);
        assert!(cache_is_empty_except_boxes(&fx.cache()));
    }

    #[test]
    fn missing_builder_is_tool_missing() {
        let fx = Fixture::new(false, runner());
        let err = fx
            .orchestrator
            .build("win7", &BuildOptions::default())
            .unwrap_err();
        assert_eq!(err.exit_code(), 254);
    }

    #[test]
    fn skipping_both_stages_only_renders() {
        let fx = Fixture::new(true, runner());
        let opts = BuildOptions {
            skip_build: true,
            skip_import: true,
            ..Default::default()
        };
        let state = fx.orchestrator.build("win7", &opts).unwrap();
        assert_eq!(state, BuildState::Done);

        // Debug mode keeps the rendered files for inspection.
        let cache = fx.cache();
        assert_eq!(
            fs::read_to_string(cache.join("Autounattend.xml")).unwrap(),
            "<user>malboxes</user>"
        );
        assert_eq!(fs::read_to_string(cache.join("box_win.rb")).unwrap(), "# box win7\n");
        let spec: Value =
            serde_json::from_str(&fs::read_to_string(cache.join("win7.json")).unwrap()).unwrap();
        assert_eq!(spec["post-processors"][0]["output"], "boxes/{{user `name`}}.box");
        let vars: Value =
            serde_json::from_str(&fs::read_to_string(cache.join(VAR_FILE)).unwrap()).unwrap();
        assert_eq!(vars["username"], "malboxes");
    }

    #[test]
    fn existing_box_without_force_is_a_conflict() {
        let fx = Fixture::new(false, runner());
        write(&fx.cache().join("boxes/win7.box"), "");
        let err = fx
            .orchestrator
            .build("win7", &BuildOptions::default())
            .unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert!(!fx.cache().join("Autounattend.xml").exists());
    }

    #[test]
    #[serial]
    fn force_is_passed_to_both_tools() {
        let fx = Fixture::new(false, runner());
        write(&fx.cache().join("boxes/win7.box"), "");
        let log = fx.log_path();
        fx.tool("packer", &format!("echo \"packer $*\" >> {log}"));
        fx.tool("vagrant", &format!("echo \"vagrant $*\" >> {log}"));

        let opts = BuildOptions {
            force: true,
            ..Default::default()
        };
        fx.orchestrator.build("win7", &opts).unwrap();
        let log = fx.log();
        assert!(log.contains("packer build -var-file="));
        assert!(log.contains(" -force "));
        assert!(log.contains("--name=win7 --force"));
    }

    #[test]
    fn spin_refuses_existing_vagrantfile_before_loading_config() {
        let fx = Fixture::new(false, runner());
        let work = fx.tmp.path().join("work");
        write(&work.join("Vagrantfile"), "keep me");

        let err = fx.orchestrator.spin("no-such-target", "vm", &work).unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert_eq!(fs::read_to_string(work.join("Vagrantfile")).unwrap(), "keep me");
        assert!(!fx.orchestrator.dirs().config_file().exists());
    }

    #[test]
    fn spin_renders_descriptor_for_hypervisor() {
        let fx = Fixture::new(false, runner());
        let work = fx.tmp.path().join("work");
        let path = fx.orchestrator.spin("win7", "Cryptolocker_XYZ", &work).unwrap();
        assert_eq!(
            fs::read_to_string(path).unwrap(),
            "config.vm.box = \"win7\"\nvb.name = \"Cryptolocker_XYZ\"\n"
        );
    }

    #[test]
    fn box_output_substitutes_target_name() {
        let spec: ConfigMap = serde_json::from_str(
            r#"{"post-processors": [{"output": "boxes/{{user `name`}}.box"}]}"#,
        )
        .unwrap();
        assert_eq!(box_output(&spec, "win10_64_analyst").unwrap(), "boxes/win10_64_analyst.box");
        assert!(box_output(&ConfigMap::new(), "x").is_err());
    }

    #[test]
    fn profile_edits_go_to_user_scripts() {
        let fx = Fixture::new(false, runner());
        fx.orchestrator
            .edit_profile(
                "alice",
                Operation::PackageInstall {
                    name: "7zip".into(),
                },
            )
            .unwrap();
        let dirs = fx.orchestrator.dirs();
        assert_eq!(
            fs::read_to_string(dirs.user_script("alice")).unwrap(),
            "cinst 7zip -y\r\n"
        );
        assert_eq!(
            fs::read_to_string(dirs.user_scripts_index()).unwrap(),
            "alice.ps1\r\n"
        );
    }
}
