//! malboxes CLI
//!
//! ```bash
//! # Show buildable targets
//! malboxes list
//!
//! # Build a base box and import it into vagrant
//! malboxes build win10_64_analyst
//!
//! # Generate a Vagrantfile for one analysis VM
//! malboxes spin win10_64_analyst Cryptolocker_XYZ
//!
//! # Extend a user script
//! malboxes registry alice add 'HKLM:\Software\X' Debugger 1 DWORD
//! malboxes package alice wireshark
//! ```

use std::env;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use malboxes::error::EXIT_GENERIC;
use malboxes::process::{install_interrupt_handler, interrupt_requested, reraise_interrupt};
use malboxes::{AppDirs, BuildError, BuildOptions, ModType, Operation, Orchestrator};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "malboxes")]
#[command(author, version, about = "Vagrant box builder and config generator for malware analysis", long_about = None)]
struct Cli {
    /// Keep temporary files and enable verbose builder logs
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available targets
    List,

    /// Build a Vagrant box from a target
    Build {
        /// Target to build (see `list`)
        target: String,
        /// Overwrite existing builder and box outputs
        #[arg(long)]
        force: bool,
        /// Skip the packer build phase. Only useful for debugging
        #[arg(long = "skip-packer-build")]
        skip_packer_build: bool,
        /// Skip the vagrant box add phase. Only useful for debugging
        #[arg(long = "skip-vagrant-box-add")]
        skip_vagrant_box_add: bool,
    },

    /// Create a Vagrantfile for a built target in the current directory
    Spin {
        target: String,
        /// Name of the VM. Must be unique on your system. Ex: Cryptolocker_XYZ
        name: String,
    },

    /// Add a registry modification to a profile's user script
    Registry {
        profile: String,
        /// add, modify or delete
        modtype: String,
        key: String,
        name: Option<String>,
        value: Option<String>,
        /// DWORD for integers, String for strings
        valuetype: Option<String>,
    },

    /// Add a directory creation or removal to a profile's user script
    Directory {
        profile: String,
        /// add or delete
        modtype: String,
        dirpath: String,
    },

    /// Add a file creation or removal to a profile's user script
    Document {
        profile: String,
        /// add or delete
        modtype: String,
        docpath: String,
    },

    /// Add a Chocolatey package to a profile's user script
    Package { profile: String, package: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let Some(command) = cli.command else {
        // Help output failing is not worth reporting.
        let _ = Cli::command().print_help();
        println!("\n");
        if let Err(e) = discover(false).and_then(|o| cmd_list(&o)) {
            eprintln!("Error: {:#}", e);
        }
        return ExitCode::from(EXIT_GENERIC as u8);
    };

    let result = discover(cli.debug).and_then(|orchestrator| run(&orchestrator, command));

    // Cleanup has already run by the time a build returns.
    let interrupted = interrupt_requested()
        || matches!(&result, Err(e) if e.downcast_ref::<BuildError>().is_some_and(BuildError::is_interrupt));
    if interrupted {
        eprintln!("Interrupted");
        reraise_interrupt();
        return ExitCode::from(130);
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            let code = e
                .downcast_ref::<BuildError>()
                .map(BuildError::exit_code)
                .unwrap_or(EXIT_GENERIC);
            ExitCode::from(code as u8)
        }
    }
}

fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn discover(debug: bool) -> Result<Orchestrator> {
    let dirs = AppDirs::discover()?;
    dirs.ensure()?;
    Ok(Orchestrator::new(dirs, debug))
}

fn run(orchestrator: &Orchestrator, command: Commands) -> Result<()> {
    match command {
        Commands::List => cmd_list(orchestrator),
        Commands::Build {
            target,
            force,
            skip_packer_build,
            skip_vagrant_box_add,
        } => {
            install_interrupt_handler()?;
            let opts = BuildOptions {
                force,
                skip_build: skip_packer_build,
                skip_import: skip_vagrant_box_add,
            };
            orchestrator.build(&target, &opts)?;
            Ok(())
        }
        Commands::Spin { target, name } => {
            let cwd = env::current_dir().context("reading current directory")?;
            orchestrator.spin(&target, &name, &cwd)?;
            Ok(())
        }
        Commands::Registry {
            profile,
            modtype,
            key,
            name,
            value,
            valuetype,
        } => cmd_edit(
            orchestrator,
            &profile,
            Operation::RegistryEdit {
                modtype: ModType::parse(&modtype),
                key,
                name,
                value,
                valuetype,
            },
        ),
        Commands::Directory {
            profile,
            modtype,
            dirpath,
        } => cmd_edit(
            orchestrator,
            &profile,
            Operation::DirectoryOp {
                modtype: ModType::parse(&modtype),
                path: dirpath,
            },
        ),
        Commands::Document {
            profile,
            modtype,
            docpath,
        } => cmd_edit(
            orchestrator,
            &profile,
            Operation::DocumentOp {
                modtype: ModType::parse(&modtype),
                path: docpath,
            },
        ),
        Commands::Package { profile, package } => cmd_edit(
            orchestrator,
            &profile,
            Operation::PackageInstall { name: package },
        ),
    }
}

fn cmd_list(orchestrator: &Orchestrator) -> Result<()> {
    println!("supported targets:\n");
    for target in orchestrator.list_targets()? {
        println!("{target}");
    }
    println!();
    Ok(())
}

fn cmd_edit(orchestrator: &Orchestrator, profile: &str, op: Operation) -> Result<()> {
    let script = orchestrator
        .edit_profile(profile, op)
        .with_context(|| format!("updating user script for profile '{profile}'"))?;
    if script.is_empty() {
        println!("Nothing added to {profile}.ps1");
    }
    for line in script.lines() {
        println!("Adding: {line}");
    }
    Ok(())
}
