//! Container runtime collaborators
//!
//! The materializer never creates namespaces or bridges itself. It sequences
//! calls into a [`Runtime`], which hands back opaque handles:
//! - `memory`: in-process bookkeeping for dry runs and tests
//! - `docker`: drives the Docker CLI

pub mod docker;
pub mod memory;

pub use docker::DockerRuntime;
pub use memory::MemoryRuntime;

use crate::error::Result;
use crate::manifest::GlobalConfig;
use crate::topology::{HostSpec, NetworkSpec};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// Opaque reference to a created network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NetworkHandle {
    /// Runtime identifier
    id: String,
    /// Declared network name
    name: String,
}

impl NetworkHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Opaque reference to a created host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HostHandle {
    /// Runtime identifier
    id: String,
    /// Declared host name
    name: String,
}

impl HostHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A network a host joins, with its confirmed address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAttachment {
    pub network: NetworkHandle,
    pub address: IpAddr,
}

/// A host found in the runtime, with the runtime's view of its state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub handle: HostHandle,
    /// e.g. "running", "exited"
    pub state: String,
}

/// Resources labelled with a project, as reported by the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Discovered {
    pub hosts: Vec<HostStatus>,
    pub networks: Vec<NetworkHandle>,
}

impl Discovered {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.networks.is_empty()
    }
}

/// Backend that performs the actual resource creation
///
/// `resource` is the project-qualified name the runtime should use for the
/// created object. Implementations must be safe to call from several worker
/// threads at once.
///
/// Created resources carry the runtime's project label, which `discover` and
/// `projects` read back so labs can be inspected or removed from another
/// process.
pub trait Runtime: Send + Sync {
    fn create_network(&self, resource: &str, spec: &NetworkSpec) -> Result<NetworkHandle>;

    fn destroy_network(&self, handle: &NetworkHandle) -> Result<()>;

    fn create_host(
        &self,
        resource: &str,
        spec: &HostSpec,
        attachments: &[HostAttachment],
    ) -> Result<HostHandle>;

    fn destroy_host(&self, handle: &HostHandle) -> Result<()>;

    fn restart_host(&self, handle: &HostHandle) -> Result<()>;

    /// Hosts and networks labelled with `project`
    fn discover(&self, project: &str) -> Result<Discovered>;

    /// Projects that currently have running hosts, sorted
    fn projects(&self) -> Result<Vec<String>>;
}

/// Declared name of a project-qualified resource
pub fn declared_name<'a>(project: &str, resource: &'a str) -> &'a str {
    resource
        .strip_prefix(project)
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|name| !name.is_empty())
        .unwrap_or(resource)
}

/// Available runtime backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Memory,
}

/// Build the runtime selected by configuration
pub fn from_config(
    kind: RuntimeKind,
    config: &GlobalConfig,
    project: &str,
) -> Result<Arc<dyn Runtime>> {
    match kind {
        RuntimeKind::Memory => Ok(Arc::new(MemoryRuntime::new().project(project))),
        RuntimeKind::Docker => {
            let docker = DockerRuntime::from_config(config, project);
            docker.detect()?;
            Ok(Arc::new(docker))
        }
    }
}
