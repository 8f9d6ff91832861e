//! Topology validation
//!
//! Cross-checks the whole declared graph before anything is created. Every
//! stage runs even when an earlier one failed, so callers get the complete
//! list of problems in a stable order:
//!
//! 1. subnet well-formedness
//! 2. subnet overlap between networks
//! 3. host network references
//! 4. explicit addresses inside their subnet
//! 5. duplicate explicit addresses per network
//! 6. duplicate host names and attachments

use crate::network::ip::{is_assignable, parse_subnet};
use crate::topology::Topology;
use ipnet::IpNet;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Validation stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Subnet,
    Overlap,
    Reference,
    Range,
    Duplicate,
    Host,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Subnet => "subnet",
            Stage::Overlap => "overlap",
            Stage::Reference => "reference",
            Stage::Range => "range",
            Stage::Duplicate => "duplicate",
            Stage::Host => "host",
        };
        f.write_str(name)
    }
}

/// A single problem found in a declared topology
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("subnet '{subnet}' is malformed: {reason}")]
    MalformedSubnet {
        network: String,
        subnet: String,
        reason: String,
    },

    #[error("subnet {first_subnet} of '{first}' overlaps {second_subnet} of '{second}'")]
    OverlappingSubnet {
        first: String,
        first_subnet: IpNet,
        second: String,
        second_subnet: IpNet,
    },

    #[error("host '{host}' references undeclared network '{network}'")]
    UnknownNetworkReference { host: String, network: String },

    #[error("address {address} of host '{host}' is not assignable in {subnet} ('{network}')")]
    AddressOutOfRange {
        host: String,
        network: String,
        address: IpAddr,
        subnet: IpNet,
    },

    #[error("address {address} on '{network}' requested by '{host}' is already held by '{holder}'")]
    DuplicateAddress {
        network: String,
        address: IpAddr,
        holder: String,
        host: String,
    },

    #[error("host name '{0}' is declared more than once")]
    DuplicateHost(String),

    #[error("host '{host}' joins network '{network}' more than once")]
    DuplicateAttachment { host: String, network: String },
}

impl ValidationError {
    pub fn stage(&self) -> Stage {
        match self {
            ValidationError::MalformedSubnet { .. } => Stage::Subnet,
            ValidationError::OverlappingSubnet { .. } => Stage::Overlap,
            ValidationError::UnknownNetworkReference { .. } => Stage::Reference,
            ValidationError::AddressOutOfRange { .. } => Stage::Range,
            ValidationError::DuplicateAddress { .. } => Stage::Duplicate,
            ValidationError::DuplicateHost(_) | ValidationError::DuplicateAttachment { .. } => {
                Stage::Host
            }
        }
    }

    /// The network or host the problem is about
    pub fn subject(&self) -> &str {
        match self {
            ValidationError::MalformedSubnet { network, .. } => network,
            ValidationError::OverlappingSubnet { second, .. } => second,
            ValidationError::UnknownNetworkReference { host, .. } => host,
            ValidationError::AddressOutOfRange { host, .. } => host,
            ValidationError::DuplicateAddress { network, .. } => network,
            ValidationError::DuplicateHost(host) => host,
            ValidationError::DuplicateAttachment { host, .. } => host,
        }
    }

    pub fn diagnostic(&self) -> Diagnostic {
        Diagnostic {
            stage: self.stage(),
            subject: self.subject().to_string(),
            message: self.to_string(),
        }
    }
}

/// Diagnostic record emitted for each validation error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub stage: Stage,
    pub subject: String,
    pub message: String,
}

/// Holder name used for a network's reserved gateway
const GATEWAY_HOLDER: &str = "<gateway>";

/// Validate a topology, returning every error found
pub fn validate(topology: &Topology) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // 1. Subnet well-formedness
    let mut subnets: HashMap<&str, IpNet> = HashMap::new();
    let mut parsed: Vec<(&str, IpNet)> = Vec::new();
    for network in &topology.networks {
        match parse_subnet(&network.subnet) {
            Ok(cidr) => {
                if let Some(gateway) = network.gateway
                    && !is_assignable(&cidr, gateway)
                {
                    errors.push(ValidationError::MalformedSubnet {
                        network: network.name.clone(),
                        subnet: network.subnet.clone(),
                        reason: format!("gateway {} is not an assignable address", gateway),
                    });
                }
                subnets.entry(network.name.as_str()).or_insert(cidr);
                parsed.push((network.name.as_str(), cidr));
            }
            Err(reason) => errors.push(ValidationError::MalformedSubnet {
                network: network.name.clone(),
                subnet: network.subnet.clone(),
                reason,
            }),
        }
    }

    // 2. Pairwise overlap, in declaration order
    for (i, (first, a)) in parsed.iter().enumerate() {
        for (second, b) in &parsed[i + 1..] {
            if a.contains(&b.network()) || b.contains(&a.network()) {
                errors.push(ValidationError::OverlappingSubnet {
                    first: first.to_string(),
                    first_subnet: *a,
                    second: second.to_string(),
                    second_subnet: *b,
                });
            }
        }
    }

    // 3. Network references
    for host in &topology.hosts {
        for req in &host.networks {
            if topology.get_network(&req.network).is_none() {
                errors.push(ValidationError::UnknownNetworkReference {
                    host: host.name.clone(),
                    network: req.network.clone(),
                });
            }
        }
    }

    // 4. Explicit addresses inside their subnet
    for host in &topology.hosts {
        for req in &host.networks {
            let (Some(address), Some(subnet)) = (req.address, subnets.get(req.network.as_str()))
            else {
                continue;
            };
            if !is_assignable(subnet, address) {
                errors.push(ValidationError::AddressOutOfRange {
                    host: host.name.clone(),
                    network: req.network.clone(),
                    address,
                    subnet: *subnet,
                });
            }
        }
    }

    // 5. Duplicate explicit addresses, per network
    for network in &topology.networks {
        let Some(subnet) = subnets.get(network.name.as_str()) else {
            continue;
        };
        let mut held: HashMap<IpAddr, &str> = HashMap::new();
        if let Some(gateway) = network.gateway {
            held.insert(gateway, GATEWAY_HOLDER);
        }
        for (host, address) in topology.requests_for(&network.name) {
            let Some(address) = address.filter(|a| is_assignable(subnet, *a)) else {
                continue;
            };
            if let Some(holder) = held.get(&address) {
                errors.push(ValidationError::DuplicateAddress {
                    network: network.name.clone(),
                    address,
                    holder: holder.to_string(),
                    host: host.to_string(),
                });
            } else {
                held.insert(address, host);
            }
        }
    }

    // 6. Host names and attachments
    let mut names = HashSet::new();
    for host in &topology.hosts {
        if !names.insert(host.name.as_str()) {
            errors.push(ValidationError::DuplicateHost(host.name.clone()));
        }
        let mut joined = HashSet::new();
        for req in &host.networks {
            if !joined.insert(req.network.as_str()) {
                errors.push(ValidationError::DuplicateAttachment {
                    host: host.name.clone(),
                    network: req.network.clone(),
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
