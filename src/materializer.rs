//! Topology materializer
//!
//! Drives a declared topology through its lifecycle:
//! - validate: run every validator stage, Declared -> Validated
//! - realize: networks, then addresses, then hosts, Validated -> Active
//! - teardown: hosts, then networks in reverse order, Active -> Destroyed
//!
//! A failed or cancelled realize removes everything it created and leaves the
//! topology Rejected.

pub mod pool;
pub mod state;

pub use pool::CancelToken;
pub use state::Lifecycle;

use crate::error::{Error, Result};
use crate::manifest::LabManifest;
use crate::network::ip;
use crate::network::NetworkRegistry;
use crate::runtime::{HostAttachment, HostHandle, NetworkHandle, Runtime};
use crate::topology::{self, AddressBinding, HostSpec, Topology};
use pool::fan_out;
use serde::Serialize;
use state::{DynamicTopologyMachine, TopologyMachineEvent};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Default number of workers per stage
const DEFAULT_WORKERS: usize = 4;

/// Result of tearing down a topology
#[derive(Debug, Default, Clone, Serialize)]
pub struct TeardownReport {
    pub hosts_removed: usize,
    pub networks_removed: usize,
    /// One message per resource that could not be removed
    pub failures: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A created host and the networks it joined
#[derive(Debug, Clone)]
struct DeployedHost {
    handle: HostHandle,
    networks: Vec<NetworkHandle>,
}

/// Resources owned by an active topology
#[derive(Debug, Default)]
struct Deployment {
    /// Networks in declaration order, without duplicates
    networks: Vec<NetworkHandle>,
    /// Hosts in declaration order
    hosts: Vec<DeployedHost>,
    bindings: Vec<AddressBinding>,
}

/// Materializes one topology against a runtime
pub struct Materializer {
    machine: DynamicTopologyMachine<()>,
    topology: Topology,
    runtime: Arc<dyn Runtime>,
    registry: NetworkRegistry,
    workers: usize,
    cancel: CancelToken,
    deployment: Option<Deployment>,
}

impl Materializer {
    /// Declare a topology; nothing is checked or created yet
    pub fn declare(topology: Topology, runtime: Arc<dyn Runtime>) -> Self {
        let registry = NetworkRegistry::new(Arc::clone(&runtime), topology.project.clone());
        Self {
            machine: state::new_machine(),
            topology,
            runtime,
            registry,
            workers: DEFAULT_WORKERS,
            cancel: CancelToken::new(),
            deployment: None,
        }
    }

    /// Declare the topology described by a manifest
    pub fn from_manifest(manifest: &LabManifest, runtime: Arc<dyn Runtime>) -> Self {
        Self::declare(manifest.topology(), runtime).workers(manifest.config.workers)
    }

    /// Number of worker threads per stage
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> Lifecycle {
        Lifecycle::from_state(self.machine.current_state())
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    #[allow(dead_code)]
    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }

    /// Address bindings of the active topology
    #[allow(dead_code)]
    pub fn bindings(&self) -> &[AddressBinding] {
        self.deployment
            .as_ref()
            .map(|d| d.bindings.as_slice())
            .unwrap_or_default()
    }

    fn require(&self, expected: Lifecycle, operation: &'static str) -> Result<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: state.to_string(),
            })
        }
    }

    fn transition(&mut self, event: TopologyMachineEvent, operation: &'static str) -> Result<()> {
        let state = self.state();
        self.machine
            .handle(event)
            .map_err(|_| Error::InvalidState {
                operation,
                state: state.to_string(),
            })
    }

    /// Check the declared topology, surfacing every validation error
    pub fn validate(&mut self) -> Result<()> {
        self.require(Lifecycle::Declared, "validate")?;

        match topology::validate(&self.topology) {
            Ok(()) => {
                self.transition(TopologyMachineEvent::Validate, "validate")?;
                log::info!("Topology '{}' validated", self.topology.project);
                Ok(())
            }
            Err(errors) => {
                self.transition(TopologyMachineEvent::Reject, "validate")?;
                log::info!(
                    "Topology '{}' rejected with {} error(s)",
                    self.topology.project,
                    errors.len()
                );
                Err(Error::InvalidTopology(errors))
            }
        }
    }

    /// Compute every address binding without touching the runtime
    ///
    /// Bindings are grouped by network in declaration order.
    pub fn plan(&self) -> Result<Vec<AddressBinding>> {
        match self.state() {
            Lifecycle::Validated | Lifecycle::Active => self.allocate(),
            state => Err(Error::InvalidState {
                operation: "plan",
                state: state.to_string(),
            }),
        }
    }

    fn allocate(&self) -> Result<Vec<AddressBinding>> {
        let mut bindings = Vec::new();
        for network in &self.topology.networks {
            let requests = self.topology.requests_for(&network.name);
            bindings.extend(ip::assign(network, &requests)?);
        }
        Ok(bindings)
    }

    /// Create every network and host of the validated topology
    pub fn realize(&mut self) -> Result<&[AddressBinding]> {
        self.require(Lifecycle::Validated, "realize")?;
        log::info!(
            "Realizing topology '{}' ({} networks, {} hosts)",
            self.topology.project,
            self.topology.networks.len(),
            self.topology.hosts.len()
        );

        let mut deployment = Deployment::default();
        match self.build(&mut deployment) {
            Ok(()) => {
                self.transition(TopologyMachineEvent::Activate, "realize")?;
                log::info!("Topology '{}' is active", self.topology.project);
                let deployment = self.deployment.insert(deployment);
                Ok(deployment.bindings.as_slice())
            }
            Err(e) => {
                log::warn!("Realization failed, rolling back: {}", e);
                let report = dismantle(&self.runtime, &self.registry, self.workers, &deployment);
                for failure in &report.failures {
                    log::warn!("Rollback: {}", failure);
                }
                self.transition(TopologyMachineEvent::Reject, "realize")?;
                Err(e)
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run the three realization stages, recording created resources
    fn build(&self, deployment: &mut Deployment) -> Result<()> {
        // Stage 1: networks
        let registry = &self.registry;
        let mut batch = fan_out(&self.topology.networks, self.workers, &self.cancel, |spec| {
            registry.create(spec)
        });
        let (panicked, complete) = (batch.panicked, batch.is_complete());
        let first_error = batch.first_error();
        let mut by_name: HashMap<String, NetworkHandle> = HashMap::new();
        for (_, handle) in batch.succeeded() {
            by_name.insert(handle.name().to_string(), handle.clone());
            if !deployment.networks.contains(&handle) {
                deployment.networks.push(handle);
            }
        }
        stage_outcome("networks", first_error, panicked, complete)?;
        self.check_cancelled()?;
        log::info!("Created {} network(s)", deployment.networks.len());

        // Stage 2: addresses
        deployment.bindings = self.allocate()?;
        let addresses: HashMap<(&str, &str), IpAddr> = deployment
            .bindings
            .iter()
            .map(|b| ((b.host.as_str(), b.network.as_str()), b.address))
            .collect();

        // Stage 3: hosts
        self.check_cancelled()?;
        let plans: Vec<(&HostSpec, Vec<HostAttachment>)> = self
            .topology
            .hosts
            .iter()
            .map(|host| {
                let attachments = host
                    .networks
                    .iter()
                    .filter_map(|req| {
                        let network = by_name.get(&req.network)?.clone();
                        let address = *addresses.get(&(host.name.as_str(), req.network.as_str()))?;
                        Some(HostAttachment { network, address })
                    })
                    .collect();
                (host, attachments)
            })
            .collect();

        let runtime = &self.runtime;
        let project = self.topology.project.as_str();
        let mut batch = fan_out(&plans, self.workers, &self.cancel, |(host, attachments)| {
            create_host(runtime.as_ref(), registry, project, host, attachments)
        });
        let (panicked, complete) = (batch.panicked, batch.is_complete());
        let first_error = batch.first_error();
        deployment.hosts = batch.succeeded().map(|(_, host)| host).collect();
        stage_outcome("hosts", first_error, panicked, complete)?;
        // A cancel raised while the last items were in flight still wins
        self.check_cancelled()?;
        log::info!("Created {} host(s)", deployment.hosts.len());

        Ok(())
    }

    /// Remove every host, then every network in reverse declaration order
    ///
    /// Best effort: failures are logged and reported, never returned.
    pub fn teardown(&mut self) -> Result<TeardownReport> {
        self.require(Lifecycle::Active, "teardown")?;
        log::info!("Tearing down topology '{}'", self.topology.project);

        let deployment = self.deployment.take().unwrap_or_default();
        let report = dismantle(&self.runtime, &self.registry, self.workers, &deployment);
        for failure in &report.failures {
            log::warn!("Teardown: {}", failure);
        }

        self.transition(TopologyMachineEvent::Destroy, "teardown")?;
        log::info!(
            "Removed {} host(s) and {} network(s)",
            report.hosts_removed,
            report.networks_removed
        );
        Ok(report)
    }
}

/// Remove every resource labelled with `project`
///
/// Works from what the runtime reports, so it also cleans up labs started by
/// another process. Best effort, like [`Materializer::teardown`].
pub fn remove_project(runtime: &dyn Runtime, project: &str) -> Result<TeardownReport> {
    let discovered = runtime.discover(project)?;
    let mut report = TeardownReport::default();

    for host in &discovered.hosts {
        match runtime.destroy_host(&host.handle) {
            Ok(()) => report.hosts_removed += 1,
            Err(e) => report
                .failures
                .push(format!("host '{}': {}", host.handle.name(), e)),
        }
    }

    for network in &discovered.networks {
        match runtime.destroy_network(network) {
            Ok(()) => report.networks_removed += 1,
            Err(e) => report
                .failures
                .push(format!("network '{}': {}", network.name(), e)),
        }
    }

    for failure in &report.failures {
        log::warn!("Down: {}", failure);
    }
    log::info!(
        "Removed {} host(s) and {} network(s) of project '{}'",
        report.hosts_removed,
        report.networks_removed,
        project
    );
    Ok(report)
}

/// Refuse to start a lab while any other lab is running
pub fn ensure_no_running_lab(runtime: &dyn Runtime) -> Result<()> {
    let running = runtime.projects()?;
    if running.is_empty() {
        Ok(())
    } else {
        Err(Error::LabAlreadyRunning(running))
    }
}

/// Restart every host labelled with `project`, returning how many restarted
pub fn restart_project(runtime: &dyn Runtime, project: &str) -> Result<usize> {
    let discovered = runtime.discover(project)?;
    for host in &discovered.hosts {
        runtime.restart_host(&host.handle)?;
        log::debug!("Restarted host '{}'", host.handle.name());
    }
    Ok(discovered.hosts.len())
}

/// Map the outcome of a fan-out stage to the error it should surface
fn stage_outcome(
    stage: &'static str,
    first_error: Option<Error>,
    panicked: bool,
    complete: bool,
) -> Result<()> {
    if let Some(e) = first_error {
        return Err(e);
    }
    if panicked {
        return Err(Error::WorkerPanicked(stage));
    }
    if !complete {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Create one host and record its network memberships
fn create_host(
    runtime: &dyn Runtime,
    registry: &NetworkRegistry,
    project: &str,
    host: &HostSpec,
    attachments: &[HostAttachment],
) -> Result<DeployedHost> {
    let resource = topology::resource_name(project, &host.name);
    let handle = runtime.create_host(&resource, host, attachments)?;
    log::debug!("Created host '{}' ({})", host.name, handle.id());

    let mut joined = Vec::with_capacity(attachments.len());
    for attachment in attachments {
        if let Err(e) = registry.attach(&attachment.network, &host.name) {
            for network in &joined {
                registry.detach(network, &host.name);
            }
            if let Err(cleanup) = runtime.destroy_host(&handle) {
                log::warn!("Failed to remove host '{}': {}", host.name, cleanup);
            }
            return Err(e);
        }
        joined.push(attachment.network.clone());
    }

    Ok(DeployedHost {
        handle,
        networks: joined,
    })
}

/// Remove hosts (fan-out), then networks in reverse order
fn dismantle(
    runtime: &Arc<dyn Runtime>,
    registry: &NetworkRegistry,
    workers: usize,
    deployment: &Deployment,
) -> TeardownReport {
    let mut report = TeardownReport::default();

    // Teardown is never cancelled
    let batch = fan_out(&deployment.hosts, workers, &CancelToken::new(), |host| {
        let removed = runtime.destroy_host(&host.handle);
        // The runtime refuses to remove networks that still have endpoints,
        // so memberships are dropped even when removal failed
        for network in &host.networks {
            registry.detach(network, host.handle.name());
        }
        if removed.is_ok() {
            log::debug!("Removed host '{}'", host.handle.name());
        }
        Ok(removed)
    });

    for (host, outcome) in deployment.hosts.iter().zip(batch.results) {
        match outcome {
            Some(Ok(Ok(()))) => report.hosts_removed += 1,
            Some(Ok(Err(e))) | Some(Err(e)) => report
                .failures
                .push(format!("host '{}': {}", host.handle.name(), e)),
            None => report
                .failures
                .push(format!("host '{}': worker stopped before removal", host.handle.name())),
        }
    }

    for network in deployment.networks.iter().rev() {
        match registry.destroy(network) {
            Ok(()) => report.networks_removed += 1,
            Err(e) => report
                .failures
                .push(format!("network '{}': {}", network.name(), e)),
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AllocationError;
    use crate::runtime::MemoryRuntime;
    use crate::topology::{NetworkSpec, ValidationError};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn lab() -> Topology {
        Topology::new("privesc")
            .network(NetworkSpec::new("lab-network", "10.11.0.0/24").gateway(ip("10.11.0.1")))
            .network(NetworkSpec::new("privesc-network", "10.12.0.0/24"))
            .host(HostSpec::new("attacker", "kali").attach_ip("lab-network", ip("10.11.0.10")))
            .host(
                HostSpec::new("target", "jedha/privesc-target")
                    .attach("lab-network")
                    .attach("privesc-network"),
            )
    }

    fn materializer(topology: Topology) -> (Arc<MemoryRuntime>, Materializer) {
        let runtime = Arc::new(MemoryRuntime::new());
        let materializer = Materializer::declare(topology, runtime.clone());
        (runtime, materializer)
    }

    /// Runtime that cancels realization while creating the named resource
    struct CancellingRuntime {
        inner: MemoryRuntime,
        cancel: CancelToken,
        trigger: &'static str,
    }

    impl CancellingRuntime {
        fn new(trigger: &'static str, cancel: &CancelToken) -> Self {
            Self {
                inner: MemoryRuntime::new(),
                cancel: cancel.clone(),
                trigger,
            }
        }
    }

    impl Runtime for CancellingRuntime {
        fn create_network(&self, resource: &str, spec: &NetworkSpec) -> Result<NetworkHandle> {
            let handle = self.inner.create_network(resource, spec)?;
            if spec.name == self.trigger {
                self.cancel.cancel();
            }
            Ok(handle)
        }

        fn destroy_network(&self, handle: &NetworkHandle) -> Result<()> {
            self.inner.destroy_network(handle)
        }

        fn create_host(
            &self,
            resource: &str,
            spec: &HostSpec,
            attachments: &[HostAttachment],
        ) -> Result<HostHandle> {
            let handle = self.inner.create_host(resource, spec, attachments)?;
            if spec.name == self.trigger {
                self.cancel.cancel();
            }
            Ok(handle)
        }

        fn destroy_host(&self, handle: &HostHandle) -> Result<()> {
            self.inner.destroy_host(handle)
        }

        fn restart_host(&self, handle: &HostHandle) -> Result<()> {
            self.inner.restart_host(handle)
        }

        fn discover(&self, project: &str) -> Result<crate::runtime::Discovered> {
            self.inner.discover(project)
        }

        fn projects(&self) -> Result<Vec<String>> {
            self.inner.projects()
        }
    }

    #[test]
    fn test_realize_then_teardown_leaves_nothing() {
        let (runtime, mut materializer) = materializer(lab());
        assert_eq!(materializer.state(), Lifecycle::Declared);

        materializer.validate().unwrap();
        assert_eq!(materializer.state(), Lifecycle::Validated);

        let bindings = materializer.realize().unwrap().to_vec();
        assert_eq!(materializer.state(), Lifecycle::Active);
        assert_eq!(bindings.len(), 3);
        assert_eq!(runtime.network_count(), 2);
        assert_eq!(runtime.host_count(), 2);
        assert_eq!(materializer.registry().members("lab-network"), vec!["attacker", "target"]);
        assert_eq!(
            runtime.host_addresses("privesc-target"),
            Some(vec![ip("10.11.0.2"), ip("10.12.0.1")])
        );

        let report = materializer.teardown().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.hosts_removed, 2);
        assert_eq!(report.networks_removed, 2);
        assert_eq!(materializer.state(), Lifecycle::Destroyed);
        assert!(materializer.registry().is_empty());
        assert_eq!(runtime.network_count(), 0);
        assert_eq!(runtime.host_count(), 0);
        assert!(materializer.bindings().is_empty());
    }

    #[test]
    fn test_networks_removed_in_reverse_order() {
        let (runtime, mut materializer) = materializer(lab());
        materializer = materializer.workers(1);
        materializer.validate().unwrap();
        materializer.realize().unwrap();
        materializer.teardown().unwrap();

        let events = runtime.events();
        let removals: Vec<&str> = events
            .iter()
            .filter(|e| e.starts_with("destroy-network"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            removals,
            vec!["destroy-network privesc-network", "destroy-network lab-network"]
        );
        let first_network_removal = events
            .iter()
            .position(|e| e.starts_with("destroy-network"))
            .unwrap();
        assert!(events[..first_network_removal]
            .iter()
            .filter(|e| e.starts_with("destroy-host"))
            .count()
            == 2);
    }

    #[test]
    fn test_overlapping_subnets_never_validated() {
        let topology = Topology::new("lab")
            .network(NetworkSpec::new("a", "10.0.0.0/16"))
            .network(NetworkSpec::new("b", "10.0.1.0/24"))
            .network(NetworkSpec::new("c", "10.0.2.0/24"));
        let (runtime, mut materializer) = materializer(topology);

        let err = materializer.validate().unwrap_err();
        let Error::InvalidTopology(errors) = err else {
            panic!("expected InvalidTopology, got {err:?}");
        };
        let overlaps = errors
            .iter()
            .filter(|e| matches!(e, ValidationError::OverlappingSubnet { .. }))
            .count();
        assert_eq!(overlaps, 2);
        assert_eq!(materializer.state(), Lifecycle::Rejected);

        assert!(matches!(
            materializer.realize(),
            Err(Error::InvalidState { operation: "realize", .. })
        ));
        assert_eq!(runtime.network_count(), 0);
    }

    #[test]
    fn test_auto_assignment_is_deterministic() {
        let run = || {
            let (runtime, mut materializer) = materializer(lab());
            materializer.validate().unwrap();
            let bindings = materializer.realize().unwrap().to_vec();
            (bindings, runtime.host_addresses("privesc-target"))
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_duplicate_explicit_address_is_rejected() {
        let topology = Topology::new("lab")
            .network(NetworkSpec::new("lab-network", "10.11.0.0/24"))
            .host(HostSpec::new("a", "alpine").attach_ip("lab-network", ip("10.11.0.65")))
            .host(HostSpec::new("b", "alpine").attach_ip("lab-network", ip("10.11.0.65")));
        let (runtime, mut materializer) = materializer(topology);

        let err = materializer.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTopology(ref errors) if errors.iter().any(|e| matches!(
                e,
                ValidationError::DuplicateAddress { address, .. } if *address == ip("10.11.0.65")
            ))
        ));
        assert!(runtime.events().is_empty());
    }

    #[test]
    fn test_unknown_network_reference() {
        let topology = Topology::new("lab")
            .network(NetworkSpec::new("lab-network", "10.11.0.0/24"))
            .host(HostSpec::new("target", "alpine").attach("privesc-network"));
        let (_runtime, mut materializer) = materializer(topology);

        let err = materializer.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTopology(ref errors) if errors.iter().any(|e| matches!(
                e,
                ValidationError::UnknownNetworkReference { network, .. } if network == "privesc-network"
            ))
        ));
    }

    #[test]
    fn test_cancel_after_first_network_rolls_back() {
        let cancel = CancelToken::new();
        let runtime = Arc::new(CancellingRuntime::new("lab-network", &cancel));
        let mut materializer = Materializer::declare(lab(), runtime.clone())
            .workers(1)
            .with_cancel(cancel);

        materializer.validate().unwrap();
        assert!(matches!(materializer.realize(), Err(Error::Cancelled)));
        assert_eq!(materializer.state(), Lifecycle::Rejected);
        assert_eq!(runtime.inner.network_count(), 0);
        assert_eq!(runtime.inner.host_count(), 0);
        assert!(materializer.registry().is_empty());
        assert_eq!(
            runtime.inner.events(),
            vec!["create-network lab-network", "destroy-network lab-network"]
        );
    }

    #[test]
    fn test_cancel_during_last_host_rolls_back() {
        let cancel = CancelToken::new();
        let runtime = Arc::new(CancellingRuntime::new("target", &cancel));
        let mut materializer = Materializer::declare(lab(), runtime.clone())
            .workers(1)
            .with_cancel(cancel);

        materializer.validate().unwrap();
        assert!(matches!(materializer.realize(), Err(Error::Cancelled)));
        assert_eq!(materializer.state(), Lifecycle::Rejected);
        assert_eq!(runtime.inner.host_count(), 0);
        assert_eq!(runtime.inner.network_count(), 0);
        assert!(materializer.registry().is_empty());
    }

    #[test]
    fn test_host_failure_rolls_back_everything() {
        let runtime = Arc::new(MemoryRuntime::new().fail_on("target"));
        let mut materializer = Materializer::declare(lab(), runtime.clone()).workers(1);

        materializer.validate().unwrap();
        let err = materializer.realize().unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert_eq!(materializer.state(), Lifecycle::Rejected);
        assert_eq!(runtime.network_count(), 0);
        assert_eq!(runtime.host_count(), 0);
        assert!(materializer.registry().is_empty());
    }

    #[test]
    fn test_network_failure_surfaces_first_in_order() {
        let runtime = Arc::new(
            MemoryRuntime::new()
                .fail_on("lab-network")
                .fail_on("privesc-network"),
        );
        let mut materializer = Materializer::declare(lab(), runtime.clone());

        materializer.validate().unwrap();
        let err = materializer.realize().unwrap_err();
        assert!(err.to_string().contains("lab-network"));
        assert_eq!(runtime.network_count(), 0);
    }

    #[test]
    fn test_subnet_exhaustion_rolls_back() {
        let topology = Topology::new("lab")
            .network(NetworkSpec::new("tiny", "10.9.0.0/30"))
            .host(HostSpec::new("a", "alpine").attach("tiny"))
            .host(HostSpec::new("b", "alpine").attach("tiny"))
            .host(HostSpec::new("c", "alpine").attach("tiny"));
        let (runtime, mut materializer) = materializer(topology);

        materializer.validate().unwrap();
        let err = materializer.realize().unwrap_err();
        assert!(matches!(
            err,
            Error::Allocation(AllocationError::SubnetExhausted { ref host, .. }) if host == "c"
        ));
        assert_eq!(runtime.network_count(), 0);
        assert_eq!(materializer.state(), Lifecycle::Rejected);
    }

    #[test]
    fn test_plan_does_not_touch_runtime() {
        let (runtime, mut materializer) = materializer(lab());
        assert!(matches!(
            materializer.plan(),
            Err(Error::InvalidState { operation: "plan", .. })
        ));

        materializer.validate().unwrap();
        let plan = materializer.plan().unwrap();
        assert_eq!(
            plan,
            vec![
                AddressBinding {
                    host: "attacker".into(),
                    network: "lab-network".into(),
                    address: ip("10.11.0.10"),
                },
                AddressBinding {
                    host: "target".into(),
                    network: "lab-network".into(),
                    address: ip("10.11.0.2"),
                },
                AddressBinding {
                    host: "target".into(),
                    network: "privesc-network".into(),
                    address: ip("10.12.0.1"),
                },
            ]
        );
        assert!(runtime.events().is_empty());
        assert_eq!(materializer.realize().unwrap(), plan.as_slice());
    }

    #[test]
    fn test_invalid_state_errors() {
        let (_runtime, mut materializer) = materializer(lab());
        assert!(matches!(
            materializer.teardown(),
            Err(Error::InvalidState { operation: "teardown", .. })
        ));
        assert!(matches!(
            materializer.realize(),
            Err(Error::InvalidState { operation: "realize", .. })
        ));

        materializer.validate().unwrap();
        assert!(matches!(
            materializer.validate(),
            Err(Error::InvalidState { operation: "validate", .. })
        ));

        materializer.realize().unwrap();
        materializer.teardown().unwrap();
        assert!(materializer.teardown().is_err());
        assert!(materializer.realize().is_err());
    }

    #[test]
    fn test_teardown_reports_failures() {
        let (runtime, mut materializer) = materializer(lab());
        materializer.validate().unwrap();
        materializer.realize().unwrap();

        // Remove a host behind the materializer's back
        let deployment = materializer.deployment.as_ref().unwrap();
        let stray = deployment.hosts[0].handle.clone();
        runtime.destroy_host(&stray).unwrap();

        let report = materializer.teardown().unwrap();
        assert_eq!(report.hosts_removed, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].starts_with("host 'attacker'"));
        assert_eq!(report.networks_removed, 2);
        assert_eq!(runtime.network_count(), 0);
        assert!(materializer.registry().is_empty());
        assert_eq!(materializer.state(), Lifecycle::Destroyed);
    }

    #[test]
    fn test_teardown_keeps_networks_with_live_endpoints() {
        let runtime = Arc::new(FailingRemoval(MemoryRuntime::new()));
        let mut materializer = Materializer::declare(lab(), runtime.clone());
        materializer.validate().unwrap();
        materializer.realize().unwrap();

        let report = materializer.teardown().unwrap();
        assert_eq!(report.hosts_removed, 0);
        assert_eq!(report.networks_removed, 0);
        assert_eq!(report.failures.len(), 4);
        assert_eq!(runtime.0.network_count(), 2);
    }

    /// Runtime whose host removal always fails
    struct FailingRemoval(MemoryRuntime);

    impl Runtime for FailingRemoval {
        fn create_network(&self, resource: &str, spec: &NetworkSpec) -> Result<NetworkHandle> {
            self.0.create_network(resource, spec)
        }

        fn destroy_network(&self, handle: &NetworkHandle) -> Result<()> {
            self.0.destroy_network(handle)
        }

        fn create_host(
            &self,
            resource: &str,
            spec: &HostSpec,
            attachments: &[HostAttachment],
        ) -> Result<HostHandle> {
            self.0.create_host(resource, spec, attachments)
        }

        fn destroy_host(&self, handle: &HostHandle) -> Result<()> {
            Err(Error::Runtime(format!("cannot remove {}", handle.name())))
        }

        fn restart_host(&self, handle: &HostHandle) -> Result<()> {
            self.0.restart_host(handle)
        }

        fn discover(&self, project: &str) -> Result<crate::runtime::Discovered> {
            self.0.discover(project)
        }

        fn projects(&self) -> Result<Vec<String>> {
            self.0.projects()
        }
    }

    #[test]
    fn test_remove_project_from_discovery() {
        let runtime = Arc::new(MemoryRuntime::new().project("privesc"));
        let mut materializer = Materializer::declare(lab(), runtime.clone());
        materializer.validate().unwrap();
        materializer.realize().unwrap();
        assert_eq!(runtime.projects().unwrap(), vec!["privesc"]);

        assert_eq!(restart_project(runtime.as_ref(), "privesc").unwrap(), 2);

        // A separate process only knows the project name
        let report = remove_project(runtime.as_ref(), "privesc").unwrap();
        assert!(report.is_clean());
        assert_eq!(report.hosts_removed, 2);
        assert_eq!(report.networks_removed, 2);
        assert_eq!(runtime.network_count(), 0);
        assert!(runtime.projects().unwrap().is_empty());

        let report = remove_project(runtime.as_ref(), "privesc").unwrap();
        assert_eq!(report.hosts_removed + report.networks_removed, 0);
    }

    #[test]
    fn test_running_lab_blocks_another_up() {
        let runtime = Arc::new(MemoryRuntime::new().project("privesc"));
        ensure_no_running_lab(runtime.as_ref()).unwrap();

        let mut materializer = Materializer::declare(lab(), runtime.clone());
        materializer.validate().unwrap();
        materializer.realize().unwrap();

        let err = ensure_no_running_lab(runtime.as_ref()).unwrap_err();
        assert!(matches!(err, Error::LabAlreadyRunning(ref labs) if labs == &["privesc"]));

        materializer.teardown().unwrap();
        ensure_no_running_lab(runtime.as_ref()).unwrap();
    }
}
