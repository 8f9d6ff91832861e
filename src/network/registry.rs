//! Network registry
//!
//! Tracks the networks created for one materializer and which hosts are
//! attached to each. Locks are only held for bookkeeping, never across a
//! runtime call, so concurrent workers can create networks in parallel.
//! A name is reserved before its runtime call; other workers asking for the
//! same name wait for that call to finish.

use crate::error::{RegistryError, Result};
use crate::runtime::{NetworkHandle, Runtime};
use crate::topology::{resource_name, NetworkSpec};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct Entry {
    spec: NetworkSpec,
    handle: NetworkHandle,
    /// Hosts referencing this network
    members: BTreeSet<String>,
}

/// Registration state of a network name
#[derive(Debug)]
enum Slot {
    /// Runtime call in flight
    Pending(NetworkSpec),
    Ready(Entry),
}

impl Slot {
    fn ready(&self) -> Option<&Entry> {
        match self {
            Slot::Ready(entry) => Some(entry),
            Slot::Pending(_) => None,
        }
    }

    fn ready_mut(&mut self) -> Option<&mut Entry> {
        match self {
            Slot::Ready(entry) => Some(entry),
            Slot::Pending(_) => None,
        }
    }
}

/// Same name registered again: identical specs share the handle
fn reuse(entry: &Entry, spec: &NetworkSpec) -> Result<NetworkHandle> {
    if entry.spec == *spec {
        Ok(entry.handle.clone())
    } else {
        Err(RegistryError::DuplicateNetwork(spec.name.clone()).into())
    }
}

/// Registry of live networks, keyed by declared name
pub struct NetworkRegistry {
    runtime: Arc<dyn Runtime>,
    /// Project name for runtime resource names
    project: String,
    slots: Mutex<HashMap<String, Slot>>,
    /// Signalled whenever a pending slot resolves
    settled: Condvar,
}

impl NetworkRegistry {
    pub fn new(runtime: Arc<dyn Runtime>, project: impl Into<String>) -> Self {
        Self {
            runtime,
            project: project.into(),
            slots: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a network, or return the existing handle for an identical spec
    pub fn create(&self, spec: &NetworkSpec) -> Result<NetworkHandle> {
        let mut slots = self.slots();
        loop {
            match slots.get(&spec.name) {
                Some(Slot::Ready(entry)) => return reuse(entry, spec),
                Some(Slot::Pending(pending)) if pending != spec => {
                    return Err(RegistryError::DuplicateNetwork(spec.name.clone()).into());
                }
                Some(Slot::Pending(_)) => {
                    slots = self
                        .settled
                        .wait(slots)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None => break,
            }
        }
        slots.insert(spec.name.clone(), Slot::Pending(spec.clone()));
        drop(slots);

        let resource = resource_name(&self.project, &spec.name);
        let created = self.runtime.create_network(&resource, spec);

        let mut slots = self.slots();
        match &created {
            Ok(handle) => {
                log::debug!("Registered network '{}' ({})", spec.name, handle.id());
                slots.insert(
                    spec.name.clone(),
                    Slot::Ready(Entry {
                        spec: spec.clone(),
                        handle: handle.clone(),
                        members: BTreeSet::new(),
                    }),
                );
            }
            Err(_) => {
                slots.remove(&spec.name);
            }
        }
        drop(slots);
        self.settled.notify_all();
        created
    }

    /// Destroy a network that no host references anymore
    pub fn destroy(&self, handle: &NetworkHandle) -> Result<()> {
        {
            let slots = self.slots();
            let entry = slots
                .get(handle.name())
                .and_then(Slot::ready)
                .filter(|e| e.handle == *handle)
                .ok_or_else(|| RegistryError::UnknownNetwork(handle.name().to_string()))?;

            if !entry.members.is_empty() {
                return Err(RegistryError::NetworkInUse {
                    network: handle.name().to_string(),
                    hosts: entry.members.iter().cloned().collect(),
                }
                .into());
            }
        }

        self.runtime.destroy_network(handle)?;
        self.slots().remove(handle.name());
        log::debug!("Unregistered network '{}'", handle.name());
        Ok(())
    }

    /// Record that a host references a network
    pub fn attach(&self, handle: &NetworkHandle, host: &str) -> Result<()> {
        let mut slots = self.slots();
        let entry = slots
            .get_mut(handle.name())
            .and_then(Slot::ready_mut)
            .filter(|e| e.handle == *handle)
            .ok_or_else(|| RegistryError::UnknownNetwork(handle.name().to_string()))?;
        entry.members.insert(host.to_string());
        Ok(())
    }

    /// Drop a host reference; returns whether it was present
    pub fn detach(&self, handle: &NetworkHandle, host: &str) -> bool {
        self.slots()
            .get_mut(handle.name())
            .and_then(Slot::ready_mut)
            .is_some_and(|e| e.members.remove(host))
    }

    /// Hosts attached to a network, sorted
    #[allow(dead_code)]
    pub fn members(&self, name: &str) -> Vec<String> {
        self.slots()
            .get(name)
            .and_then(Slot::ready)
            .map(|e| e.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Handles of every registered network, sorted by name
    #[allow(dead_code)]
    pub fn handles(&self) -> Vec<NetworkHandle> {
        let mut handles: Vec<_> = self
            .slots()
            .values()
            .filter_map(Slot::ready)
            .map(|e| e.handle.clone())
            .collect();
        handles.sort_by(|a, b| a.name().cmp(b.name()));
        handles
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.slots().values().filter_map(Slot::ready).count()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
