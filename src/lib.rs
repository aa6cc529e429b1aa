//! Builds Windows analysis VMs as Vagrant boxes.
//!
//! A build composes layered configuration, renders the builder template,
//! the unattended-install answer file and the box Vagrantfile into a cache
//! directory, then runs packer and `vagrant box add` in the foreground.
//!
//! - **Configuration** - comment-tolerant base config, built-in defaults,
//!   per-target build specs and customization profiles
//! - **Templates** - a small Jinja-style engine over the merged config
//! - **Scripts** - registry, file and package operations compiled to PowerShell
//! - **Processes** - streamed child output with SIGINT forwarding
//!
//! # Architecture
//!
//! ```text
//! malboxes build <target>
//!     │
//!     ├── ConfigStore::load        config.js + defaults + templates/<target>.json + profile
//!     ├── TemplateEngine           Autounattend.xml, box_win.rb, <target>.json → cache
//!     ├── compile_operations       profile-<name>.ps1 → cache
//!     ├── ProcessRunner            packer build (cwd = cache)
//!     ├── ProcessRunner            vagrant box add
//!     └── ArtifactCache::cleanup   unless --debug
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod paths;
pub mod process;
pub mod script;
pub mod template;

pub use cache::ArtifactCache;
pub use config::{Config, ConfigStore, Hypervisor, ResolvedConfig};
pub use error::{BuildError, Result, ToolStage};
pub use orchestrator::{BuildOptions, BuildState, Orchestrator};
pub use paths::AppDirs;
pub use process::{ExternalTool, ProcessRunner};
pub use script::{ModType, Operation, Profile, ProvisioningScript, ScriptCompiler};
pub use template::{TemplateEngine, TemplateError, TemplateId};
