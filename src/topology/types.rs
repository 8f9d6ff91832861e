//! Declared topology: networks, hosts and their address requests

use crate::error::{Error, Result};
use crate::network::ip::parse_subnet;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Network driver requested for a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// Isolated bridge segment
    #[default]
    Bridge,
    /// Whatever the runtime picks by default
    Default,
}

impl Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::Bridge => "bridge",
            Driver::Default => "default",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared network segment
///
/// The subnet is kept as declared so malformed values can be reported by the
/// validator instead of failing at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    /// Subnet in CIDR notation (e.g., "10.11.0.0/24")
    pub subnet: String,
    pub driver: Driver,
    /// Reserved gateway address, never handed to a host
    pub gateway: Option<IpAddr>,
}

impl NetworkSpec {
    pub fn new(name: impl Into<String>, subnet: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subnet: subnet.into(),
            driver: Driver::default(),
            gateway: None,
        }
    }

    pub fn driver(mut self, driver: Driver) -> Self {
        self.driver = driver;
        self
    }

    pub fn gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Parsed subnet
    pub fn cidr(&self) -> Result<IpNet> {
        parse_subnet(&self.subnet).map_err(|reason| {
            Error::ConfigValidation(format!(
                "Invalid subnet '{}' for network '{}': {}",
                self.subnet, self.name, reason
            ))
        })
    }
}

/// A host's request to join a network, optionally at a fixed address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub network: String,
    pub address: Option<IpAddr>,
}

/// A declared host (container)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub name: String,
    /// Image reference, passed through to the runtime untouched
    pub image: String,
    pub hostname: Option<String>,
    /// Network requests in declaration order
    pub networks: Vec<NetworkRequest>,
}

impl HostSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            hostname: None,
            networks: Vec::new(),
        }
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Join a network with an automatically assigned address
    pub fn attach(mut self, network: impl Into<String>) -> Self {
        self.networks.push(NetworkRequest {
            network: network.into(),
            address: None,
        });
        self
    }

    /// Join a network at a fixed address
    pub fn attach_ip(mut self, network: impl Into<String>, address: IpAddr) -> Self {
        self.networks.push(NetworkRequest {
            network: network.into(),
            address: Some(address),
        });
        self
    }
}

/// A confirmed (host, network, address) assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressBinding {
    pub host: String,
    pub network: String,
    pub address: IpAddr,
}

/// Full declared topology
///
/// Networks and hosts keep their declaration order, which drives the order of
/// realization and teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Project name, used as prefix for runtime resource names
    pub project: String,
    pub networks: Vec<NetworkSpec>,
    pub hosts: Vec<HostSpec>,
}

impl Topology {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            networks: Vec::new(),
            hosts: Vec::new(),
        }
    }

    pub fn network(mut self, spec: NetworkSpec) -> Self {
        self.networks.push(spec);
        self
    }

    pub fn host(mut self, spec: HostSpec) -> Self {
        self.hosts.push(spec);
        self
    }

    /// Look up a network by name
    pub fn get_network(&self, name: &str) -> Option<&NetworkSpec> {
        self.networks.iter().find(|n| n.name == name)
    }

    /// Requests targeting a network, as (host, optional address) in host
    /// declaration order
    pub fn requests_for(&self, network: &str) -> Vec<(&str, Option<IpAddr>)> {
        self.hosts
            .iter()
            .flat_map(|host| {
                host.networks
                    .iter()
                    .filter(move |req| req.network == network)
                    .map(move |req| (host.name.as_str(), req.address))
            })
            .collect()
    }

    /// Runtime resource name with project prefix
    pub fn resource_name(&self, name: &str) -> String {
        resource_name(&self.project, name)
    }
}

/// Get the runtime resource name with project prefix
/// Format: {project}-{name}
pub fn resource_name(project: &str, name: &str) -> String {
    let prefix = format!("{}-", project);
    if name.starts_with(&prefix) {
        name.to_string()
    } else {
        format!("{}{}", prefix, name)
    }
}
