//! Labship - virtual network topologies for security labs
//!
//! Declares isolated networks and attacker/target hosts in a TOML manifest,
//! validates the topology and materializes it against a container runtime.

mod cli;
mod error;
mod manifest;
mod materializer;
mod network;
mod runtime;
mod topology;

use cli::{Cli, Commands};
use env_logger::Env;
use error::{Error, Result};
use materializer::Materializer;
use manifest::LabManifest;
use runtime::{Discovered, MemoryRuntime, Runtime, RuntimeKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use topology::{AddressBinding, ValidationError};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let paths = cli.manifests();
    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            Ok(())
        }
        Commands::List { json } => list(&cli.labs_dir, json),
        Commands::Check { json } => check(&paths, json),
        Commands::Up {
            runtime,
            dry_run,
            json,
        } => up(&paths, runtime, dry_run, json),
        Commands::Status { runtime, json } => status(&paths, runtime, json),
        Commands::Down { runtime } => down(&paths, runtime),
        Commands::Restart { runtime } => restart(&paths, runtime),
    }
}

/// Load the manifest and connect to its runtime
fn connect(
    paths: &[PathBuf],
    kind: Option<RuntimeKind>,
) -> Result<(LabManifest, Arc<dyn Runtime>)> {
    let manifest = manifest::load_merged(paths)?;
    let kind = kind.unwrap_or(manifest.config.runtime);
    let backend = runtime::from_config(kind, &manifest.config, &manifest.config.project_name())?;
    Ok((manifest, backend))
}

/// Print the bundled lab catalog
fn list(labs_dir: &Path, json: bool) -> Result<()> {
    let labs = manifest::catalog(labs_dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&labs)?);
        return Ok(());
    }

    if labs.is_empty() {
        println!("No labs found in {}", labs_dir.display());
        return Ok(());
    }

    println!("{:<16} {:<9} {:<6} DESCRIPTION", "NAME", "NETWORKS", "HOSTS");
    for lab in &labs {
        let description = match (&lab.error, &lab.description) {
            (Some(error), _) => format!("(invalid: {})", error),
            (None, Some(description)) => description.clone(),
            (None, None) => String::new(),
        };
        println!(
            "{:<16} {:<9} {:<6} {}",
            lab.name, lab.networks, lab.hosts, description
        );
    }
    Ok(())
}

/// Show what the runtime reports for the lab's project
fn status(paths: &[PathBuf], kind: Option<RuntimeKind>, json: bool) -> Result<()> {
    let (manifest, backend) = connect(paths, kind)?;
    let project = manifest.config.project_name();
    let discovered = backend.discover(&project)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&discovered)?);
        return Ok(());
    }

    if discovered.is_empty() {
        println!("Lab '{}' is not running", project);
        return Ok(());
    }
    print_status(&discovered);
    Ok(())
}

/// Remove every resource of the lab's project
fn down(paths: &[PathBuf], kind: Option<RuntimeKind>) -> Result<()> {
    let (manifest, backend) = connect(paths, kind)?;
    let project = manifest.config.project_name();

    let report = materializer::remove_project(backend.as_ref(), &project)?;
    for failure in &report.failures {
        eprintln!("Warning: {}", failure);
    }
    println!(
        "Removed {} host(s) and {} network(s) of lab '{}'",
        report.hosts_removed, report.networks_removed, project
    );
    Ok(())
}

/// Restart the lab's hosts in place
fn restart(paths: &[PathBuf], kind: Option<RuntimeKind>) -> Result<()> {
    let (manifest, backend) = connect(paths, kind)?;
    let project = manifest.config.project_name();

    let restarted = materializer::restart_project(backend.as_ref(), &project)?;
    if restarted == 0 {
        println!("Lab '{}' is not running", project);
    } else {
        println!("Restarted {} host(s) of lab '{}'", restarted, project);
    }
    Ok(())
}

/// Validate the topology and print its diagnostics
fn check(paths: &[PathBuf], json: bool) -> Result<()> {
    let manifest = manifest::load_merged(paths)?;
    // Validation never touches the runtime
    let mut materializer = Materializer::from_manifest(&manifest, Arc::new(MemoryRuntime::new()));

    match materializer.validate() {
        Ok(()) => {
            let topology = materializer.topology();
            if json {
                println!("[]");
            } else {
                println!(
                    "Topology '{}' is valid: {} network(s), {} host(s)",
                    topology.project,
                    topology.networks.len(),
                    topology.hosts.len()
                );
            }
            Ok(())
        }
        Err(Error::InvalidTopology(errors)) => {
            print_diagnostics(&errors, json)?;
            Err(Error::InvalidTopology(errors))
        }
        Err(e) => Err(e),
    }
}

/// Realize the topology, hold it until Ctrl+C, then tear it down
fn up(paths: &[PathBuf], kind: Option<RuntimeKind>, dry_run: bool, json: bool) -> Result<()> {
    let manifest = manifest::load_merged(paths)?;
    let project = manifest.config.project_name();
    let kind = kind.unwrap_or(manifest.config.runtime);

    let backend: Arc<dyn Runtime> = if dry_run {
        Arc::new(MemoryRuntime::new())
    } else {
        runtime::from_config(kind, &manifest.config, &project)?
    };
    let mut materializer = Materializer::from_manifest(&manifest, backend.clone());

    if let Err(e) = materializer.validate() {
        if let Error::InvalidTopology(errors) = &e {
            print_diagnostics(errors, json)?;
        }
        return Err(e);
    }

    if dry_run {
        let plan = materializer.plan()?;
        print_bindings(&plan, json)?;
        return Ok(());
    }

    materializer::ensure_no_running_lab(backend.as_ref())?;

    // Ctrl+C cancels an in-flight realize, then releases the wait below
    let rt = tokio::runtime::Runtime::new()?;
    let cancel = materializer.cancel_token();
    let (interrupted_tx, interrupted_rx) = crossbeam::channel::bounded::<()>(1);
    rt.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
            let _ = interrupted_tx.send(());
        }
    });

    let bindings = materializer.realize()?.to_vec();
    print_bindings(&bindings, json)?;
    if !json {
        println!("Lab '{}' is up. Press Ctrl+C to tear down.", project);
    }

    // Sender is dropped if the signal handler could not be installed
    let _ = interrupted_rx.recv();

    if !json {
        println!("\nTearing down...");
    }
    let report = materializer.teardown()?;
    for failure in &report.failures {
        eprintln!("Warning: {}", failure);
    }
    if !json {
        println!(
            "Removed {} host(s) and {} network(s)",
            report.hosts_removed, report.networks_removed
        );
    }

    Ok(())
}

fn print_diagnostics(errors: &[ValidationError], json: bool) -> Result<()> {
    let diagnostics: Vec<_> = errors.iter().map(ValidationError::diagnostic).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&diagnostics)?);
        return Ok(());
    }

    println!("{:<10} {:<24} MESSAGE", "STAGE", "SUBJECT");
    for diagnostic in &diagnostics {
        println!(
            "{:<10} {:<24} {}",
            diagnostic.stage.to_string(),
            diagnostic.subject,
            diagnostic.message
        );
    }
    Ok(())
}

fn print_status(discovered: &Discovered) {
    println!("{:<20} {:<12} ID", "HOST", "STATE");
    for host in &discovered.hosts {
        println!(
            "{:<20} {:<12} {}",
            host.handle.name(),
            host.state,
            host.handle.id()
        );
    }

    println!("\n{:<20} ID", "NETWORK");
    for network in &discovered.networks {
        println!("{:<20} {}", network.name(), network.id());
    }
}

fn print_bindings(bindings: &[AddressBinding], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(bindings)?);
        return Ok(());
    }

    println!("{:<20} {:<20} ADDRESS", "HOST", "NETWORK");
    for binding in bindings {
        println!(
            "{:<20} {:<20} {}",
            binding.host, binding.network, binding.address
        );
    }
    Ok(())
}
