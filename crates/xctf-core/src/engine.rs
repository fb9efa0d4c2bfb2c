//! C6: the sandbox lifecycle engine. Ties C1-C5 together: acquires the
//! distributed lock, provisions a volume and a container, waits for health,
//! writes the handshake file, persists the `Sandbox` row, and opens the
//! firewall for it, or unwinds everything it already did if a later step
//! fails, the way `_create_sandbox` in
//! `original_source/services/challenge_service.py` unwinds in its
//! `except` blocks.

use std::collections::HashMap;
use std::time::Duration;

use log::{error, info, warn};

use crate::error::{Error, Result};
use crate::firewall::{Firewall, FirewallController};
use crate::lock::DistributedMutex;
use crate::model::{Challenge, PortMappings, Sandbox};
use crate::runtime::{ContainerRuntime, ContainerSpec, Runtime};
use crate::store::Store;
use crate::volume::{handshake_path, Volume, VolumeManager, Volumes};

const PRIMARY_PORT: u16 = 8000;

/// C6: ties C1-C5 together. Generic over the three capability traits so
/// tests can swap in the `fake` adapters from `runtime`/`volume`/`firewall`;
/// production code gets the real adapters via the default type parameters.
#[derive(Clone)]
pub struct SandboxEngine<
    V: Volumes = VolumeManager,
    R: Runtime = ContainerRuntime,
    F: Firewall = FirewallController,
> {
    store: Store,
    mutex: DistributedMutex,
    volumes: V,
    runtime: R,
    firewall: F,
    lock_ttl: Duration,
    lock_wait: Duration,
    health_timeout: Duration,
}

impl<V: Volumes, R: Runtime, F: Firewall> SandboxEngine<V, R, F> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        mutex: DistributedMutex,
        volumes: V,
        runtime: R,
        firewall: F,
        lock_ttl: Duration,
        health_timeout: Duration,
    ) -> Self {
        Self {
            store,
            mutex,
            volumes,
            runtime,
            firewall,
            lock_ttl,
            lock_wait: lock_ttl,
            health_timeout,
        }
    }

    /// Double-checked locking around sandbox creation (SB-1/SB-4): check
    /// without the lock, and if absent, take the lock and check again in
    /// case a concurrent request beat us to it.
    pub async fn get_or_create_sandbox(
        &self,
        challenge: &Challenge,
        user_id: Option<i64>,
        client_ip: Option<&str>,
    ) -> Result<Sandbox> {
        if !challenge.static_challenge && user_id.is_none() {
            return Err(Error::ValidationError(
                "user_id required for non-static challenge".into(),
            ));
        }

        let sandbox_user_id = if challenge.static_challenge { None } else { user_id };

        if let Some(sandbox) = self.store.find_active_sandbox(challenge.id, sandbox_user_id).await? {
            return Ok(sandbox);
        }

        let lock_name = match sandbox_user_id {
            Some(uid) => format!("sandbox_lock_{}_{}", challenge.id, uid),
            None => format!("sandbox_lock_{}", challenge.id),
        };

        let guard = self.mutex.acquire(&lock_name, self.lock_ttl, self.lock_wait).await?;

        if let Some(sandbox) = self.store.find_active_sandbox(challenge.id, sandbox_user_id).await? {
            guard.release().await.ok();
            info!("sandbox for challenge {} created by a concurrent request", challenge.id);
            return Ok(sandbox);
        }

        let result = self.create_sandbox(challenge, sandbox_user_id, client_ip).await;
        guard.release().await.ok();
        result
    }

    async fn create_sandbox(
        &self,
        challenge: &Challenge,
        user_id: Option<i64>,
        client_ip: Option<&str>,
    ) -> Result<Sandbox> {
        let sandbox_name = match user_id {
            Some(uid) => format!("xctf-{}-{}", challenge.id, uid),
            None => format!("xctf-{}", challenge.id),
        };

        let volume = self
            .volumes
            .provision(&sandbox_name)
            .await
            .inspect_err(|e| error!("volume provisioning failed for {sandbox_name}: {e}"))?;

        let container_ports: Vec<u16> = challenge
            .tcp_ports
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| vec![PRIMARY_PORT]);

        let mut publish_ports = container_ports.clone();
        if !publish_ports.contains(&PRIMARY_PORT) {
            publish_ports.push(PRIMARY_PORT);
        }

        let spec = ContainerSpec {
            name: &sandbox_name,
            image: challenge.image_tag.as_deref().unwrap_or(""),
            env: vec![
                format!("CHALLENGE_ID={}", challenge.id),
                format!("USER_ID={}", user_id.map(|u| u.to_string()).unwrap_or_default()),
            ],
            publish_ports,
            bind_mount: Some((volume.mount_path.display().to_string(), "/data".to_string())),
        };

        let publish_ports = spec.publish_ports.clone();
        let container_result = self.runtime.create_and_start(&spec).await;
        let container_id = match container_result {
            Ok(id) => id,
            Err(e) => {
                self.volumes.unmount_and_remove(&volume).await.ok();
                return Err(e);
            }
        };

        if let Err(e) = self.finish_provisioning(challenge, user_id, &sandbox_name, &container_id, &volume, publish_ports, client_ip).await {
            self.runtime.stop_and_remove(&container_id).await.ok();
            self.volumes.unmount_and_remove(&volume).await.ok();
            return Err(e);
        }

        self.find_or_fail(challenge.id, user_id).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_provisioning(
        &self,
        challenge: &Challenge,
        user_id: Option<i64>,
        sandbox_name: &str,
        container_id: &str,
        volume: &Volume,
        publish_ports: Vec<u16>,
        client_ip: Option<&str>,
    ) -> Result<()> {
        self.runtime.wait_for_healthy(container_id, self.health_timeout).await?;

        let host_ports = self.runtime.inspect_host_ports(container_id).await?;
        let primary_port = *host_ports
            .get(&PRIMARY_PORT)
            .ok_or_else(|| Error::ContainerRuntimeError(format!("{PRIMARY_PORT}/tcp not published")))?;

        // Handshake file mirrors every tcp publish, including the primary
        // port, the way `challenge_service.py` builds its mapping dict.
        let mut mapping = HashMap::new();
        for port in &publish_ports {
            if let Some(host_port) = host_ports.get(port) {
                mapping.insert(port.to_string(), *host_port as i32);
            }
        }
        let port_mappings = PortMappings(mapping);

        if let Err(e) = write_handshake_file(volume, &port_mappings).await {
            warn!("failed to write port mappings handshake file for {sandbox_name}: {e}");
        }

        let mut tx = self.store.begin().await?;
        let sandbox = self
            .store
            .insert_sandbox(
                &mut tx,
                container_id,
                primary_port as i32,
                challenge.id,
                user_id,
                &port_mappings,
            )
            .await?;
        tx.commit().await?;

        if let Err(e) = self.add_firewall_rules(challenge, &sandbox, client_ip).await {
            warn!("failed to add firewall rules for sandbox {}: {e}", sandbox.id);
        }

        Ok(())
    }

    async fn add_firewall_rules(&self, challenge: &Challenge, sandbox: &Sandbox, client_ip: Option<&str>) -> Result<()> {
        self.firewall.ensure_initialized().await?;

        if challenge.static_challenge {
            for port in sandbox.all_ports() {
                self.firewall.add_static_port(port as u16).await?;
            }
            return Ok(());
        }

        let Some(ip) = client_ip else {
            warn!("cannot add firewall rules for sandbox {}: no client ip supplied", sandbox.id);
            return Ok(());
        };
        for port in sandbox.all_ports() {
            self.firewall.add_port_ip_mapping(port as u16, ip).await?;
        }
        Ok(())
    }

    async fn find_or_fail(&self, challenge_id: i64, user_id: Option<i64>) -> Result<Sandbox> {
        self.store
            .find_active_sandbox(challenge_id, user_id)
            .await?
            .ok_or(Error::NotFound("sandbox"))
    }

    /// Tears a sandbox down completely: firewall, container, DB flag, then
    /// volume, in that order (§4.6 `cleanup`/§5) so an external observer
    /// never sees a reachable-but-unrecorded sandbox. Used by both the
    /// reaper (§4.7) and event hooks (§4.8).
    pub async fn destroy_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        let ports: Vec<u16> = sandbox.all_ports().into_iter().map(|p| p as u16).collect();
        if let Err(e) = self.firewall.remove_all_mappings_for_sandbox(&ports).await {
            warn!("failed to remove firewall mappings for sandbox {}: {e}", sandbox.id);
        }

        self.runtime.stop_and_remove(&sandbox.container_id).await.ok();

        self.store.mark_sandbox_inactive(sandbox.id).await?;

        let sandbox_name = match sandbox.user_id {
            Some(uid) => format!("xctf-{}-{}", sandbox.challenge_id, uid),
            None => format!("xctf-{}", sandbox.challenge_id),
        };
        let volume = Volume {
            image_path: self.volumes.mount_path_for(&sandbox_name).with_extension("img"),
            mount_path: self.volumes.mount_path_for(&sandbox_name),
        };
        self.volumes.unmount_and_remove(&volume).await.ok();

        Ok(())
    }

    /// §7's `submit_flag`: already-solved and not-found are reported the
    /// same way as a wrong flag, never as a different status so the grader
    /// can't be used to enumerate state.
    pub async fn submit_flag(&self, user_id: i64, challenge_id: i64, flag: &str) -> Result<bool> {
        let challenge = self.store.get_challenge(challenge_id).await?;

        if self.store.has_correct_submission(user_id, challenge_id).await? {
            return Ok(false);
        }

        let is_correct = flag.trim() == challenge.flag.trim();
        self.store.insert_submission(user_id, challenge_id, is_correct).await?;
        Ok(is_correct)
    }

    pub async fn check_user_solved_challenge(&self, user_id: i64, challenge_id: i64) -> Result<bool> {
        self.store.has_correct_submission(user_id, challenge_id).await
    }
}

async fn write_handshake_file(volume: &Volume, mappings: &PortMappings) -> Result<()> {
    let path = handshake_path(&volume.mount_path);
    let body = serde_json::to_vec(&mappings.0)
        .map_err(|e| Error::VolumeProvisioningError(e.to_string()))?;
    tokio::fs::write(&path, body)
        .await
        .map_err(|e| Error::VolumeProvisioningError(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o644);
        tokio::fs::set_permissions(&path, perms)
            .await
            .map_err(|e| Error::VolumeProvisioningError(e.to_string()))?;
    }
    Ok(())
}
