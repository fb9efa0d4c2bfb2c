//! C3: container runtime client, a thin `bollard` wrapper.
//!
//! Grounded in `original_source/services/docker_service.py` for the
//! operations and resource limits (512MiB memory, memory+swap capped at the
//! same 512MiB, half a CPU), and in
//! `crates/deployer-server/src/deploy.rs` for the `bollard` call shapes
//! (`query_parameters` option builders, `HostConfig`, `PortBinding`).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::secret::{ContainerCreateBody, ContainerSummary, HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::Docker;
use log::debug;
use tokio::time::sleep;

use crate::error::{Error, Result};

const MEMORY_LIMIT_BYTES: i64 = 512 * 1024 * 1024;
/// Half a cpu, expressed the way `bollard`'s `HostConfig::nano_cpus` wants it
/// (10^-9 cpus), equivalent to the original's `cpu_quota=50000` at the
/// default 100ms `cpu_period`.
const NANO_CPUS: i64 = 500_000_000;

pub struct ContainerSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub env: Vec<String>,
    /// Container-side TCP ports to publish; the runtime auto-assigns the
    /// host side of each (§6: "host-port auto-assignment (request-port =
    /// null)"), recovered afterwards via `inspect_host_ports`.
    pub publish_ports: Vec<u16>,
    /// host path -> container path, for the sandbox's loopback volume.
    pub bind_mount: Option<(String, String)>,
}

/// C3's capability surface, the slice [`crate::engine::SandboxEngine`] needs.
/// Split out as a trait so tests can swap in [`FakeRuntime`] instead of
/// talking to a real Docker daemon.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn create_and_start(&self, spec: &ContainerSpec<'_>) -> Result<String>;
    async fn inspect_host_ports(&self, name: &str) -> Result<HashMap<u16, u16>>;
    async fn wait_for_healthy(&self, name: &str, timeout: Duration) -> Result<()>;
    async fn stop_and_remove(&self, name: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct ContainerRuntime {
    docker: Docker,
}

impl ContainerRuntime {
    pub fn connect_local() -> Result<Self> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
        })
    }

    async fn create_and_start_impl(&self, spec: &ContainerSpec<'_>) -> Result<String> {
        self.docker
            .remove_container(
                spec.name,
                Some(RemoveContainerOptionsBuilder::new().v(true).force(true).build()),
            )
            .await
            .ok();

        let port_bindings = spec
            .publish_ports
            .iter()
            .map(|container_port| {
                (
                    format!("{container_port}/tcp"),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_owned()),
                        host_port: None,
                    }]),
                )
            })
            .collect::<HashMap<_, _>>();

        let exposed_ports = spec
            .publish_ports
            .iter()
            .map(|p| (format!("{p}/tcp"), Default::default()))
            .collect::<HashMap<_, _>>();

        let mounts = spec.bind_mount.as_ref().map(|(host, container)| {
            vec![Mount {
                source: Some(host.clone()),
                target: Some(container.clone()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            }]
        });

        self.docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(spec.name).build()),
                ContainerCreateBody {
                    image: Some(spec.image.to_string()),
                    env: Some(spec.env.clone()),
                    exposed_ports: Some(exposed_ports),
                    host_config: Some(HostConfig {
                        nano_cpus: Some(NANO_CPUS),
                        memory: Some(MEMORY_LIMIT_BYTES),
                        memory_swap: Some(MEMORY_LIMIT_BYTES),
                        port_bindings: Some(port_bindings),
                        mounts,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await?;

        debug!("starting container {}", spec.name);
        self.docker
            .start_container(spec.name, None::<StartContainerOptions>)
            .await?;

        Ok(spec.name.to_string())
    }

    async fn inspect_host_ports_impl(&self, name: &str) -> Result<HashMap<u16, u16>> {
        let inspected = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;
        let bindings = inspected
            .network_settings
            .and_then(|n| n.ports)
            .ok_or_else(|| Error::ContainerRuntimeError("container has no published ports".into()))?;

        let mut out = HashMap::new();
        for (container_port_proto, host) in bindings {
            let Some(container_port) = container_port_proto
                .split('/')
                .next()
                .and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            if let Some(host_port) = host
                .and_then(|v| v.into_iter().next())
                .and_then(|b| b.host_port)
                .and_then(|p| p.parse::<u16>().ok())
            {
                out.insert(container_port, host_port);
            }
        }
        Ok(out)
    }

    /// Reads Docker's own healthcheck status. The spec flags this as
    /// fragile: a container with no `HEALTHCHECK` reports no status at all,
    /// which this maps to `"none"` so the caller can tell "never reported"
    /// apart from an explicit `"healthy"`.
    pub async fn health_status(&self, name: &str) -> Result<String> {
        let inspected = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;
        Ok(inspected
            .state
            .and_then(|s| s.health)
            .and_then(|h| h.status)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".to_string()))
    }

    /// Only an explicit `"healthy"` status passes. Images with no declared
    /// `HEALTHCHECK` report `"none"` forever and must time out, per spec.
    async fn wait_for_healthy_impl(&self, name: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.health_status(name).await?;
            if status == "healthy" {
                return Ok(());
            }
            if status == "unhealthy" || tokio::time::Instant::now() >= deadline {
                return Err(Error::SandboxCreateTimeout);
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    async fn stop_and_remove_impl(&self, name: &str) -> Result<()> {
        self.docker
            .stop_container(name, Some(StopContainerOptionsBuilder::new().t(5).build()))
            .await
            .ok();
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().v(true).force(true).build()),
            )
            .await
            .ok();
        Ok(())
    }

    pub async fn list_running(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .docker
            .list_containers(Some(ListContainersOptionsBuilder::new().all(false).build()))
            .await?)
    }
}

#[async_trait]
impl Runtime for ContainerRuntime {
    async fn create_and_start(&self, spec: &ContainerSpec<'_>) -> Result<String> {
        self.create_and_start_impl(spec).await
    }

    async fn inspect_host_ports(&self, name: &str) -> Result<HashMap<u16, u16>> {
        self.inspect_host_ports_impl(name).await
    }

    async fn wait_for_healthy(&self, name: &str, timeout: Duration) -> Result<()> {
        self.wait_for_healthy_impl(name, timeout).await
    }

    async fn stop_and_remove(&self, name: &str) -> Result<()> {
        self.stop_and_remove_impl(name).await
    }
}

/// In-memory [`Runtime`] for tests: no Docker daemon involved. Tracks
/// created/removed container names and lets a test force health/port
/// outcomes, the way `FakeRuntime` stands in for `ContainerRuntime` per
/// the ambient test-tooling section of the expanded spec. Shipped
/// unconditionally (not `#[cfg(test)]`) so integration tests in `tests/`
/// can use it too.
pub mod fake {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    pub struct FakeRuntime {
        pub created: StdMutex<HashSet<String>>,
        pub host_ports: HashMap<u16, u16>,
        pub healthy: bool,
        pub create_fails: bool,
    }

    impl FakeRuntime {
        pub fn new(host_ports: HashMap<u16, u16>) -> Self {
            Self {
                created: StdMutex::new(HashSet::new()),
                host_ports,
                healthy: true,
                create_fails: false,
            }
        }

        pub fn unhealthy(mut self) -> Self {
            self.healthy = false;
            self
        }

        pub fn failing(mut self) -> Self {
            self.create_fails = true;
            self
        }

        pub fn created_names(&self) -> Vec<String> {
            self.created.lock().unwrap().iter().cloned().collect()
        }
    }

    #[async_trait]
    impl Runtime for FakeRuntime {
        async fn create_and_start(&self, spec: &ContainerSpec<'_>) -> Result<String> {
            if self.create_fails {
                return Err(Error::ContainerRuntimeError("fake creation failure".into()));
            }
            self.created.lock().unwrap().insert(spec.name.to_string());
            Ok(spec.name.to_string())
        }

        async fn inspect_host_ports(&self, name: &str) -> Result<HashMap<u16, u16>> {
            if !self.created.lock().unwrap().contains(name) {
                return Err(Error::ContainerRuntimeError(format!("{name} not created")));
            }
            Ok(self.host_ports.clone())
        }

        async fn wait_for_healthy(&self, _name: &str, _timeout: Duration) -> Result<()> {
            if self.healthy {
                Ok(())
            } else {
                Err(Error::SandboxCreateTimeout)
            }
        }

        async fn stop_and_remove(&self, name: &str) -> Result<()> {
            self.created.lock().unwrap().remove(name);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nano_cpus_matches_half_a_core() {
        assert_eq!(NANO_CPUS, 500_000_000);
    }

    #[test]
    fn memory_limit_is_512mib() {
        assert_eq!(MEMORY_LIMIT_BYTES, 536_870_912);
    }
}
