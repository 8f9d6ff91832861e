//! Lab manifest parsing
//!
//! Parses `labship.toml` manifests using serde and turns them into a declared
//! [`Topology`].

use crate::error::{Error, Result};
use crate::runtime::RuntimeKind;
use crate::topology::{Driver, HostSpec, NetworkRequest, NetworkSpec, Topology};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Fallback project name when none can be derived
const DEFAULT_PROJECT: &str = "labship";

/// Load a manifest from a file
pub fn load(path: &Path) -> Result<LabManifest> {
    load_merged(&[path.to_path_buf()])
}

/// Load and merge multiple manifest files
///
/// Files are merged in order, with later files overriding earlier ones.
/// Networks are replaced by name, hosts are deep-merged by name.
pub fn load_merged(paths: &[PathBuf]) -> Result<LabManifest> {
    let Some(first_path) = paths.first() else {
        return Err(Error::ConfigValidation("No manifest files provided".into()));
    };

    let mut base: Option<LabManifest> = None;
    for path in paths {
        let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let manifest: LabManifest = toml::from_str(&content)?;
        log::debug!("Loaded manifest {}", path.display());

        base = Some(match base {
            None => manifest,
            Some(b) => b.merge(manifest),
        });
    }

    let Some(mut manifest) = base else {
        return Err(Error::ConfigValidation("No manifest files provided".into()));
    };

    // Set default project name from the first manifest's directory
    if manifest.config.project.is_none() {
        manifest.config.project = Some(project_from_path(first_path));
    }

    manifest.validate()?;
    Ok(manifest)
}

/// A lab manifest found in the labs directory
#[derive(Debug, Serialize)]
pub struct LabSummary {
    /// File stem, as passed to `--lab`
    pub name: String,
    pub project: Option<String>,
    pub description: Option<String>,
    pub networks: usize,
    pub hosts: usize,
    /// Why the manifest failed to load
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// List the `.toml` manifests in a labs directory, sorted by name
///
/// Broken manifests are listed with their error instead of failing the
/// whole catalog.
pub fn catalog(dir: &Path) -> Result<Vec<LabSummary>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::ConfigRead {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut labs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "toml") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let summary = match load(&path) {
            Ok(manifest) => LabSummary {
                name: name.to_string(),
                project: Some(manifest.config.project_name()),
                description: manifest.config.description.clone(),
                networks: manifest.networks.len(),
                hosts: manifest.hosts.len(),
                error: None,
            },
            Err(e) => {
                log::debug!("Skipping details of {}: {}", path.display(), e);
                LabSummary {
                    name: name.to_string(),
                    project: None,
                    description: None,
                    networks: 0,
                    hosts: 0,
                    error: Some(e.to_string()),
                }
            }
        };
        labs.push(summary);
    }

    labs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(labs)
}

/// Derive a project name from the directory holding a manifest
fn project_from_path(path: &Path) -> String {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty() && p.as_os_str() != ".")
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
        .or_else(|| {
            // Manifest in current directory - use cwd name
            std::env::current_dir()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        })
        .unwrap_or_else(|| DEFAULT_PROJECT.to_string())
}

/// Resource names must be usable as container and network names
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Root manifest structure
#[derive(Debug, Default, Deserialize)]
pub struct LabManifest {
    /// Global settings
    #[serde(default)]
    pub config: GlobalConfig,

    /// Network definitions
    #[serde(default)]
    pub networks: Vec<NetworkDef>,

    /// Host definitions
    #[serde(default)]
    pub hosts: Vec<HostDef>,
}

impl LabManifest {
    /// Structural checks
    ///
    /// Topology semantics (overlaps, references, addresses) are left to the
    /// topology validator so they can be reported all at once.
    pub fn validate(&self) -> Result<()> {
        if self.config.workers == 0 {
            return Err(Error::ConfigValidation(
                "workers must be at least 1".into(),
            ));
        }

        let project = self.config.project_name();
        if !is_valid_name(&project) {
            return Err(Error::ConfigValidation(format!(
                "Invalid project name '{}'",
                project
            )));
        }

        for network in &self.networks {
            if !is_valid_name(&network.name) {
                return Err(Error::ConfigValidation(format!(
                    "Invalid network name '{}'",
                    network.name
                )));
            }
        }

        for host in &self.hosts {
            if !is_valid_name(&host.name) {
                return Err(Error::ConfigValidation(format!(
                    "Invalid host name '{}'",
                    host.name
                )));
            }
            if host.image.as_deref().is_none_or(|i| i.trim().is_empty()) {
                return Err(Error::ConfigValidation(format!(
                    "Host '{}' has no image",
                    host.name
                )));
            }
        }

        Ok(())
    }

    /// Merge another manifest into this one
    ///
    /// Later values override earlier ones at the field level.
    pub fn merge(mut self, other: LabManifest) -> LabManifest {
        self.config = self.config.merge(other.config);

        // Merge networks by name
        for net in other.networks {
            if let Some(existing) = self.networks.iter_mut().find(|n| n.name == net.name) {
                *existing = net;
            } else {
                self.networks.push(net);
            }
        }

        // Merge hosts by name (deep merge)
        for host in other.hosts {
            if let Some(existing) = self.hosts.iter_mut().find(|h| h.name == host.name) {
                *existing = existing.clone().merge(host);
            } else {
                self.hosts.push(host);
            }
        }

        self
    }

    /// Build the declared topology, keeping declaration order
    pub fn topology(&self) -> Topology {
        Topology {
            project: self.config.project_name(),
            networks: self.networks.iter().map(NetworkDef::to_spec).collect(),
            hosts: self.hosts.iter().map(HostDef::to_spec).collect(),
        }
    }
}

/// Global settings
#[derive(Debug, Deserialize)]
pub struct GlobalConfig {
    /// Project name (used as prefix for runtime resource names)
    /// If not set, the manifest's directory name is used
    pub project: Option<String>,

    /// One-line summary shown by `labship list`
    pub description: Option<String>,

    /// Worker threads per realization stage
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Runtime backend
    #[serde(default)]
    pub runtime: RuntimeKind,

    /// Binary used by the docker runtime
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,

    /// Run runtime commands through sudo
    /// Unset means "not specified", so an overlay can switch it either way
    pub sudo: Option<bool>,

    /// Retry/backoff configuration for runtime operations
    pub retry: Option<RetryConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            project: None,
            description: None,
            workers: default_workers(),
            runtime: RuntimeKind::default(),
            docker_binary: default_docker_binary(),
            sudo: None,
            retry: None,
        }
    }
}

impl GlobalConfig {
    /// Get the effective project name
    /// Should always be set by load/load_merged, but falls back to "labship" if not
    pub fn project_name(&self) -> String {
        self.project
            .clone()
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string())
    }

    /// Merge another GlobalConfig into this one
    /// Other's values override self's where specified
    fn merge(self, other: GlobalConfig) -> GlobalConfig {
        GlobalConfig {
            project: other.project.or(self.project),
            description: other.description.or(self.description),
            workers: if other.workers != default_workers() { other.workers } else { self.workers },
            runtime: if other.runtime != RuntimeKind::default() { other.runtime } else { self.runtime },
            docker_binary: if other.docker_binary != default_docker_binary() { other.docker_binary } else { self.docker_binary },
            sudo: other.sudo.or(self.sudo),
            retry: other.retry.or(self.retry),
        }
    }

    /// Whether runtime commands go through sudo
    pub fn sudo(&self) -> bool {
        self.sudo.unwrap_or(false)
    }

    /// Effective retry configuration
    pub fn retry(&self) -> RetryConfig {
        self.retry.clone().unwrap_or_default()
    }
}

fn default_workers() -> usize {
    4
}

fn default_docker_binary() -> String {
    "docker".into()
}

// Retry configuration defaults
fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u8 {
    5
}

fn default_jitter_factor() -> f64 {
    0.25
}

/// Retry/backoff configuration for runtime operations
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Base delay in milliseconds before first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds between retries
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum number of retry attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Jitter factor (0.0-1.0) to randomize delays
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Network definition
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkDef {
    /// Network name
    pub name: String,

    /// Subnet in CIDR notation (e.g., "10.11.0.0/24")
    pub subnet: String,

    /// Driver (bridge or default)
    #[serde(default)]
    pub driver: Driver,

    /// Reserved gateway address
    pub gateway: Option<IpAddr>,
}

impl NetworkDef {
    fn to_spec(&self) -> NetworkSpec {
        NetworkSpec {
            name: self.name.clone(),
            subnet: self.subnet.clone(),
            driver: self.driver,
            gateway: self.gateway,
        }
    }
}

/// A host's network attachment
///
/// Either a bare network name (address assigned automatically) or a table
/// with an explicit `ip`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Attachment {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        ip: Option<IpAddr>,
    },
}

impl Attachment {
    fn to_request(&self) -> NetworkRequest {
        match self {
            Attachment::Name(name) => NetworkRequest {
                network: name.clone(),
                address: None,
            },
            Attachment::Detailed { name, ip } => NetworkRequest {
                network: name.clone(),
                address: *ip,
            },
        }
    }
}

/// Host definition
#[derive(Debug, Clone, Deserialize)]
pub struct HostDef {
    /// Unique host name
    pub name: String,

    /// Container image reference
    pub image: Option<String>,

    /// Hostname inside the container
    pub hostname: Option<String>,

    /// Networks to join, in order
    #[serde(default)]
    pub networks: Vec<Attachment>,
}

impl HostDef {
    /// Merge another HostDef into this one
    ///
    /// Other's values override self's where specified (Option::Some or non-empty Vec)
    pub fn merge(self, other: HostDef) -> HostDef {
        HostDef {
            name: other.name,
            image: other.image.or(self.image),
            hostname: other.hostname.or(self.hostname),
            networks: if other.networks.is_empty() { self.networks } else { other.networks },
        }
    }

    fn to_spec(&self) -> HostSpec {
        HostSpec {
            name: self.name.clone(),
            image: self.image.clone().unwrap_or_default(),
            hostname: self.hostname.clone(),
            networks: self.networks.iter().map(Attachment::to_request).collect(),
        }
    }
}
