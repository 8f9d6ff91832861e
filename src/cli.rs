//! Command-line interface for Labship
//!
//! Uses clap with derive for type-safe CLI parsing

use crate::runtime::RuntimeKind;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Manifest used when neither `--lab` nor `-c` is given
const DEFAULT_MANIFEST: &str = "labship.toml";

/// Labship - virtual network topologies for security labs
#[derive(Parser)]
#[command(name = "labship")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Manifest file path (repeat to merge; later files override earlier ones)
    #[arg(short, long, action = clap::ArgAction::Append)]
    pub config: Vec<PathBuf>,

    /// Bundled lab to use as the base manifest (`<labs-dir>/<LAB>.toml`)
    #[arg(short, long)]
    pub lab: Option<String>,

    /// Directory holding bundled lab manifests
    #[arg(long, default_value = "labs")]
    pub labs_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Validate the lab topology and print diagnostics
    Check {
        /// Output diagnostics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create the lab, hold it until Ctrl+C, then tear it down
    Up {
        /// Runtime backend (defaults to the manifest's setting)
        #[arg(long, value_enum)]
        runtime: Option<RuntimeKind>,

        /// Print the address plan without creating anything
        #[arg(long)]
        dry_run: bool,

        /// Output bindings as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the bundled labs
    List {
        /// Output the catalog as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the hosts and networks of a running lab
    Status {
        /// Runtime backend (defaults to the manifest's setting)
        #[arg(long, value_enum)]
        runtime: Option<RuntimeKind>,

        /// Output status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove a lab started by another `up`
    Down {
        /// Runtime backend (defaults to the manifest's setting)
        #[arg(long, value_enum)]
        runtime: Option<RuntimeKind>,
    },

    /// Restart the hosts of a running lab
    Restart {
        /// Runtime backend (defaults to the manifest's setting)
        #[arg(long, value_enum)]
        runtime: Option<RuntimeKind>,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Manifest files to merge, in order
    ///
    /// A selected lab comes first so `-c` files can override it. Without
    /// either, `labship.toml` in the current directory is used.
    pub fn manifests(&self) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(self.config.len() + 1);
        if let Some(lab) = &self.lab {
            paths.push(self.labs_dir.join(format!("{}.toml", lab)));
        }
        paths.extend(self.config.iter().cloned());
        if paths.is_empty() {
            paths.push(PathBuf::from(DEFAULT_MANIFEST));
        }
        paths
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "labship", &mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_manifest() {
        let cli = Cli::try_parse_from(["labship", "check"]).unwrap();
        assert_eq!(cli.manifests(), vec![PathBuf::from("labship.toml")]);
        assert!(matches!(cli.command, Commands::Check { json: false }));
    }

    #[test]
    fn test_multiple_manifests() {
        let cli = Cli::try_parse_from([
            "labship",
            "-c",
            "lab.toml",
            "-c",
            "override.toml",
            "up",
            "--runtime",
            "memory",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(
            cli.manifests(),
            vec![PathBuf::from("lab.toml"), PathBuf::from("override.toml")]
        );
        assert!(matches!(
            cli.command,
            Commands::Up {
                runtime: Some(RuntimeKind::Memory),
                dry_run: true,
                json: false,
            }
        ));
    }

    #[test]
    fn test_lab_comes_before_overrides() {
        let cli = Cli::try_parse_from([
            "labship",
            "--lab",
            "privesc",
            "--labs-dir",
            "/srv/labs",
            "-c",
            "local.toml",
            "down",
        ])
        .unwrap();
        assert_eq!(
            cli.manifests(),
            vec![
                PathBuf::from("/srv/labs/privesc.toml"),
                PathBuf::from("local.toml")
            ]
        );
        assert!(matches!(cli.command, Commands::Down { runtime: None }));
    }

    #[test]
    fn test_lab_uses_default_labs_dir() {
        let cli = Cli::try_parse_from(["labship", "-l", "privesc", "status", "--json"]).unwrap();
        assert_eq!(cli.manifests(), vec![PathBuf::from("labs/privesc.toml")]);
        assert!(matches!(
            cli.command,
            Commands::Status {
                runtime: None,
                json: true
            }
        ));
    }

    #[test]
    fn test_list_and_restart() {
        let cli = Cli::try_parse_from(["labship", "list"]).unwrap();
        assert!(matches!(cli.command, Commands::List { json: false }));

        let cli = Cli::try_parse_from(["labship", "restart", "--runtime", "docker"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Restart {
                runtime: Some(RuntimeKind::Docker)
            }
        ));
    }
}
