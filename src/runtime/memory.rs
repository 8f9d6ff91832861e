//! In-memory runtime
//!
//! Keeps networks and hosts in process memory with deterministic ids. Used
//! for dry runs and as the collaborator in tests; it enforces the same basic
//! rules a real runtime would (unique names, no removal of networks with
//! endpoints attached).

use super::{declared_name, Discovered, HostAttachment, HostHandle, HostStatus, NetworkHandle, Runtime};
use crate::error::{Error, Result};
use crate::topology::{HostSpec, NetworkSpec};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    /// Network id -> resource name
    networks: BTreeMap<String, String>,
    /// Host id -> (resource name, attachments as (network id, address))
    hosts: BTreeMap<String, (String, Vec<(String, IpAddr)>)>,
    /// Ordered record of successful operations
    events: Vec<String>,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04}", prefix, self.next_id)
    }
}

/// Runtime that only records what it was asked to do
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
    /// Declared names whose creation fails
    failures: HashSet<String>,
    /// Label applied to every resource this runtime creates
    project: Option<String>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label created resources with a project
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Make creation of the named network or host fail
    #[allow(dead_code)]
    pub fn fail_on(mut self, name: impl Into<String>) -> Self {
        self.failures.insert(name.into());
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live networks
    #[allow(dead_code)]
    pub fn network_count(&self) -> usize {
        self.state().networks.len()
    }

    /// Number of live hosts
    #[allow(dead_code)]
    pub fn host_count(&self) -> usize {
        self.state().hosts.len()
    }

    /// Addresses of a live host, by resource name
    #[allow(dead_code)]
    pub fn host_addresses(&self, resource: &str) -> Option<Vec<IpAddr>> {
        self.state()
            .hosts
            .values()
            .find(|(name, _)| name == resource)
            .map(|(_, attachments)| attachments.iter().map(|(_, ip)| *ip).collect())
    }

    /// Operations performed so far, e.g. "create-network lab-network"
    #[allow(dead_code)]
    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }
}

impl Runtime for MemoryRuntime {
    fn create_network(&self, resource: &str, spec: &NetworkSpec) -> Result<NetworkHandle> {
        if self.failures.contains(&spec.name) {
            return Err(Error::Runtime(format!(
                "injected failure creating network '{}'",
                spec.name
            )));
        }

        let mut state = self.state();
        if state.networks.values().any(|name| name == resource) {
            return Err(Error::Runtime(format!(
                "network '{}' already exists",
                resource
            )));
        }

        let id = state.next_id("net");
        state.networks.insert(id.clone(), resource.to_string());
        state.events.push(format!("create-network {}", spec.name));
        Ok(NetworkHandle::new(id, &spec.name))
    }

    fn destroy_network(&self, handle: &NetworkHandle) -> Result<()> {
        let mut state = self.state();
        if !state.networks.contains_key(handle.id()) {
            return Err(Error::Runtime(format!("no such network: {}", handle.id())));
        }

        let in_use = state
            .hosts
            .values()
            .any(|(_, attachments)| attachments.iter().any(|(net, _)| net == handle.id()));
        if in_use {
            return Err(Error::Runtime(format!(
                "network '{}' has active endpoints",
                handle.name()
            )));
        }

        state.networks.remove(handle.id());
        state.events.push(format!("destroy-network {}", handle.name()));
        Ok(())
    }

    fn create_host(
        &self,
        resource: &str,
        spec: &HostSpec,
        attachments: &[HostAttachment],
    ) -> Result<HostHandle> {
        if self.failures.contains(&spec.name) {
            return Err(Error::Runtime(format!(
                "injected failure creating host '{}'",
                spec.name
            )));
        }

        let mut state = self.state();
        if state.hosts.values().any(|(name, _)| name == resource) {
            return Err(Error::Runtime(format!(
                "container name '{}' is already in use",
                resource
            )));
        }
        if let Some(missing) = attachments
            .iter()
            .find(|a| !state.networks.contains_key(a.network.id()))
        {
            return Err(Error::Runtime(format!(
                "network {} not found",
                missing.network.id()
            )));
        }

        let id = state.next_id("host");
        let joined = attachments
            .iter()
            .map(|a| (a.network.id().to_string(), a.address))
            .collect();
        state.hosts.insert(id.clone(), (resource.to_string(), joined));
        state.events.push(format!("create-host {}", spec.name));
        Ok(HostHandle::new(id, &spec.name))
    }

    fn destroy_host(&self, handle: &HostHandle) -> Result<()> {
        let mut state = self.state();
        if state.hosts.remove(handle.id()).is_none() {
            return Err(Error::Runtime(format!("no such container: {}", handle.id())));
        }
        state.events.push(format!("destroy-host {}", handle.name()));
        Ok(())
    }

    fn restart_host(&self, handle: &HostHandle) -> Result<()> {
        let mut state = self.state();
        if !state.hosts.contains_key(handle.id()) {
            return Err(Error::Runtime(format!("no such container: {}", handle.id())));
        }
        state.events.push(format!("restart-host {}", handle.name()));
        Ok(())
    }

    fn discover(&self, project: &str) -> Result<Discovered> {
        if self.project.as_deref() != Some(project) {
            return Ok(Discovered::default());
        }

        let state = self.state();
        Ok(Discovered {
            hosts: state
                .hosts
                .iter()
                .map(|(id, (resource, _))| HostStatus {
                    handle: HostHandle::new(id.as_str(), declared_name(project, resource)),
                    state: "running".to_string(),
                })
                .collect(),
            networks: state
                .networks
                .iter()
                .map(|(id, resource)| NetworkHandle::new(id.as_str(), declared_name(project, resource)))
                .collect(),
        })
    }

    fn projects(&self) -> Result<Vec<String>> {
        match &self.project {
            Some(project) if !self.state().hosts.is_empty() => Ok(vec![project.clone()]),
            _ => Ok(Vec::new()),
        }
    }
}
