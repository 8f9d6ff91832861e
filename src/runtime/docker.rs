//! Docker CLI runtime
//!
//! Drives `docker` (or a compatible binary) through `std::process::Command`.
//! Networks are created with an explicit subnet so the addresses assigned by
//! the allocator can be passed straight through with `--ip`.

use super::{declared_name, Discovered, HostAttachment, HostHandle, HostStatus, NetworkHandle, Runtime};
use crate::error::{Error, Result};
use crate::manifest::{GlobalConfig, RetryConfig};
use crate::topology::{Driver, HostSpec, NetworkSpec};
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use ipnet::IpNet;
use rand::rng;
use std::net::IpAddr;
use std::process::Command;
use std::thread;
use std::time::Duration;

/// Label key carrying the project name on created resources
const PROJECT_LABEL: &str = "labship.project";

/// Create backoff strategy from RetryConfig
fn backoff_from_config(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoff::new()
        .base_delay_ms(config.base_delay_ms)
        .max_delay_ms(config.max_delay_ms)
        .multiplier(config.multiplier)
        .max_attempts(config.max_attempts)
        .jitter_factor(config.jitter_factor)
}

/// Error text docker prints when a container is already gone
const NO_SUCH_CONTAINER: &str = "No such container";

/// Split tab-separated `--format` output into rows of `width` fields
fn parse_rows(output: &str, width: usize) -> Vec<Vec<&str>> {
    output
        .lines()
        .map(|line| line.split('\t').map(str::trim).collect::<Vec<_>>())
        .filter(|fields| fields.len() == width && !fields[0].is_empty())
        .collect()
}

/// `--ip` or `--ip6` depending on the address family
fn ip_flag(address: &IpAddr) -> &'static str {
    match address {
        IpAddr::V4(_) => "--ip",
        IpAddr::V6(_) => "--ip6",
    }
}

/// Runtime backed by the Docker CLI
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    /// Binary to invoke (docker, podman, ...)
    binary: String,
    /// Prefix every command with sudo
    sudo: bool,
    /// Project name, stored as a label on created resources
    project: String,
    /// Backoff for network removal
    retry: RetryConfig,
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            sudo: false,
            project: project.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn from_config(config: &GlobalConfig, project: &str) -> Self {
        Self::new(config.docker_binary.clone(), project)
            .sudo(config.sudo())
            .retry(config.retry())
    }

    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Check that the runtime binary is installed and answers
    pub fn detect(&self) -> Result<()> {
        self.run(&["--version".to_string()]).map(|_| ()).map_err(|e| {
            Error::Runtime(format!(
                "'{}' is not usable ({}). Please install it or pick another runtime.",
                self.binary, e
            ))
        })
    }

    /// Arguments for `network create`
    pub fn network_create_args(&self, resource: &str, spec: &NetworkSpec) -> Result<Vec<String>> {
        let subnet = spec.cidr()?;
        let mut args = vec!["network".to_string(), "create".to_string()];

        if spec.driver == Driver::Bridge {
            args.push("--driver".into());
            args.push(spec.driver.as_str().into());
        }
        if matches!(subnet, IpNet::V6(_)) {
            args.push("--ipv6".into());
        }
        args.push("--subnet".into());
        args.push(subnet.to_string());
        if let Some(gateway) = spec.gateway {
            args.push("--gateway".into());
            args.push(gateway.to_string());
        }
        args.push("--label".into());
        args.push(format!("{}={}", PROJECT_LABEL, self.project));
        args.push(resource.to_string());

        Ok(args)
    }

    /// Arguments for `create`, joining the first network (if any)
    pub fn host_create_args(
        &self,
        resource: &str,
        spec: &HostSpec,
        first: Option<&HostAttachment>,
    ) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            resource.to_string(),
            "--label".to_string(),
            format!("{}={}", PROJECT_LABEL, self.project),
        ];

        if let Some(hostname) = &spec.hostname {
            args.push("--hostname".into());
            args.push(hostname.clone());
        }

        match first {
            Some(attachment) => {
                args.push("--network".into());
                args.push(attachment.network.id().to_string());
                args.push(ip_flag(&attachment.address).into());
                args.push(attachment.address.to_string());
            }
            None => {
                args.push("--network".into());
                args.push("none".into());
            }
        }

        args.push(spec.image.clone());
        args
    }

    fn command(&self) -> Command {
        if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(&self.binary);
            cmd
        } else {
            Command::new(&self.binary)
        }
    }

    /// Run a command and return its trimmed stdout
    fn run(&self, args: &[String]) -> Result<String> {
        let command = format!("{} {}", self.binary, args.join(" "));
        log::debug!("Running: {}", command);

        let output = self
            .command()
            .args(args)
            .output()
            .map_err(|e| Error::CommandFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CommandFailed {
                command,
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn label_filter(project: &str) -> String {
        format!("label={}={}", PROJECT_LABEL, project)
    }

    /// Arguments listing every container of a project, running or not
    pub fn ps_args(project: &str) -> Vec<String> {
        vec![
            "ps".to_string(),
            "--all".to_string(),
            "--filter".to_string(),
            Self::label_filter(project),
            "--format".to_string(),
            "{{.ID}}\t{{.Names}}\t{{.State}}".to_string(),
        ]
    }

    /// Arguments listing every network of a project
    pub fn network_ls_args(project: &str) -> Vec<String> {
        vec![
            "network".to_string(),
            "ls".to_string(),
            "--filter".to_string(),
            Self::label_filter(project),
            "--format".to_string(),
            "{{.ID}}\t{{.Name}}".to_string(),
        ]
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        self.run(&["rm".to_string(), "-f".to_string(), id.to_string()])
            .map(|_| ())
    }

    /// Join the remaining networks and start the container
    fn connect_and_start(&self, id: &str, rest: &[HostAttachment]) -> Result<()> {
        for attachment in rest {
            self.run(&[
                "network".to_string(),
                "connect".to_string(),
                ip_flag(&attachment.address).to_string(),
                attachment.address.to_string(),
                attachment.network.id().to_string(),
                id.to_string(),
            ])?;
        }
        self.run(&["start".to_string(), id.to_string()]).map(|_| ())
    }
}

/// `rm` failed because the container is already gone
fn is_missing_container(err: &Error) -> bool {
    matches!(err, Error::CommandFailed { message, .. } if message.contains(NO_SUCH_CONTAINER))
}

impl Runtime for DockerRuntime {
    fn create_network(&self, resource: &str, spec: &NetworkSpec) -> Result<NetworkHandle> {
        let id = self.run(&self.network_create_args(resource, spec)?)?;
        log::debug!("Created network '{}' ({})", resource, id);
        Ok(NetworkHandle::new(id, &spec.name))
    }

    fn destroy_network(&self, handle: &NetworkHandle) -> Result<()> {
        let args = [
            "network".to_string(),
            "rm".to_string(),
            handle.id().to_string(),
        ];

        // Endpoints can linger briefly after their container is removed
        let backoff = backoff_from_config(&self.retry);
        let mut rng = rng();
        let mut attempt: u8 = 0;

        loop {
            attempt += 1;
            match self.run(&args) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if let Some(delay_ms) = backoff.delay(attempt, &mut rng) {
                        log::warn!(
                            "Removing network '{}' failed (attempt {}), retrying in {}ms: {}",
                            handle.name(),
                            attempt,
                            delay_ms,
                            e
                        );
                        thread::sleep(Duration::from_millis(delay_ms));
                    } else {
                        return Err(e);
                    }
                }
            }
        }
    }

    fn create_host(
        &self,
        resource: &str,
        spec: &HostSpec,
        attachments: &[HostAttachment],
    ) -> Result<HostHandle> {
        let (first, rest) = match attachments.split_first() {
            Some((first, rest)) => (Some(first), rest),
            None => (None, &[][..]),
        };

        let id = self.run(&self.host_create_args(resource, spec, first))?;

        if let Err(e) = self.connect_and_start(&id, rest) {
            // Cleanup the half-configured container
            if let Err(cleanup) = self.remove_container(&id) {
                log::warn!("Failed to remove container '{}': {}", resource, cleanup);
            }
            return Err(e);
        }

        log::debug!("Started container '{}' ({})", resource, id);
        Ok(HostHandle::new(id, &spec.name))
    }

    fn destroy_host(&self, handle: &HostHandle) -> Result<()> {
        match self.remove_container(handle.id()) {
            Err(e) if is_missing_container(&e) => {
                log::debug!("Container '{}' was already removed", handle.name());
                Ok(())
            }
            other => other,
        }
    }

    fn restart_host(&self, handle: &HostHandle) -> Result<()> {
        self.run(&["restart".to_string(), handle.id().to_string()])
            .map(|_| ())
    }

    fn discover(&self, project: &str) -> Result<Discovered> {
        let containers = self.run(&Self::ps_args(project))?;
        let networks = self.run(&Self::network_ls_args(project))?;

        Ok(Discovered {
            hosts: parse_rows(&containers, 3)
                .into_iter()
                .map(|row| HostStatus {
                    handle: HostHandle::new(row[0], declared_name(project, row[1])),
                    state: row[2].to_string(),
                })
                .collect(),
            networks: parse_rows(&networks, 2)
                .into_iter()
                .map(|row| NetworkHandle::new(row[0], declared_name(project, row[1])))
                .collect(),
        })
    }

    fn projects(&self) -> Result<Vec<String>> {
        let output = self.run(&[
            "ps".to_string(),
            "--filter".to_string(),
            format!("label={}", PROJECT_LABEL),
            "--format".to_string(),
            format!("{{{{.Label \"{}\"}}}}", PROJECT_LABEL),
        ])?;

        let mut projects: Vec<String> = output
            .lines()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        projects.sort();
        projects.dedup();
        Ok(projects)
    }
}
