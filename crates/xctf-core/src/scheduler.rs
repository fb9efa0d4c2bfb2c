//! C7: reconciliation scheduler. Grounded in `original_source/tasks/tasks.py`
//! (the four periodic Celery tasks) and `original_source/xctf/apps.py`
//! (the boot-time firewall rebuild). Each job is spawned on the
//! [`crate::queue::TaskQueue`] on a fixed `tokio::time::interval`, the way
//! `crates/deployer-server/src/main.rs` spawns its own inherited-container
//! cleanup task rather than depending on an external scheduler process.

use std::collections::HashSet;
use std::time::Duration;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::engine::SandboxEngine;
use crate::error::Result;
use crate::firewall::{Firewall, FirewallController};
use crate::notify::Notifier;
use crate::queue::TaskQueue;
use crate::runtime::{ContainerRuntime, Runtime};
use crate::session::SessionRegistry;
use crate::store::Store;
use crate::volume::{VolumeManager, Volumes};

#[derive(Clone)]
pub struct Scheduler<
    V: Volumes = VolumeManager,
    R: Runtime = ContainerRuntime,
    F: Firewall = FirewallController,
> {
    store: Store,
    engine: SandboxEngine<V, R, F>,
    firewall: F,
    sessions: SessionRegistry<F>,
    notifier: Notifier,
    sandbox_max_lifetime_secs: i64,
}

impl<V: Volumes, R: Runtime, F: Firewall> Scheduler<V, R, F> {
    pub fn new(
        store: Store,
        engine: SandboxEngine<V, R, F>,
        firewall: F,
        sessions: SessionRegistry<F>,
        notifier: Notifier,
        sandbox_max_lifetime_secs: i64,
    ) -> Self {
        Self {
            store,
            engine,
            firewall,
            sessions,
            notifier,
            sandbox_max_lifetime_secs,
        }
    }

    /// Runs once at boot, before any periodic job: reopens firewall
    /// mappings for everything the database says is still active, then
    /// sweeps whatever the firewall has that the database doesn't agree
    /// with. Mirrors `XctfConfig.ready`'s startup thread.
    pub async fn rebuild_firewall_from_state(&self) -> Result<()> {
        self.firewall.ensure_initialized().await?;
        info!("rebuilding firewall rules from persisted state");

        let mut active_ports = HashSet::new();
        let sessions = self.store.all_active_sessions().await?;
        for session in &sessions {
            let sandboxes = self.store.active_sandboxes_for_user(session.user_id).await?;
            for sandbox in &sandboxes {
                let challenge = self.store.get_challenge(sandbox.challenge_id).await?;
                if challenge.static_challenge {
                    continue;
                }
                for port in sandbox.all_ports() {
                    self.firewall.add_port_ip_mapping(port as u16, &session.ip_address).await?;
                    active_ports.insert(port as u16);
                }
            }
        }

        for sandbox in self.store.all_active_sandboxes().await? {
            let challenge = self.store.get_challenge(sandbox.challenge_id).await?;
            if !challenge.static_challenge {
                continue;
            }
            for port in sandbox.all_ports() {
                self.firewall.add_static_port(port as u16).await?;
                active_ports.insert(port as u16);
            }
        }

        let cleaned = self.firewall.clean_orphan_ports(&active_ports).await?;
        info!("firewall rebuild complete, cleaned {cleaned} orphan ports");
        Ok(())
    }

    /// §4.7 `destroy_non_static_sandboxes`: reaps active, non-static
    /// sandboxes that are either already solved or past their max lifetime.
    pub async fn reap_non_static_sandboxes(&self) -> Result<usize> {
        let candidates = self.store.reapable_non_static_sandboxes(self.sandbox_max_lifetime_secs).await?;
        for sandbox in &candidates {
            info!("reaping non-static sandbox {}", sandbox.id);
            if let Err(e) = self.engine.destroy_sandbox(sandbox).await {
                warn!("failed to reap sandbox {}: {e}", sandbox.id);
            }
        }
        Ok(candidates.len())
    }

    /// §4.7 `refresh_sandboxes`: tears down and recreates every active
    /// sandbox for an (still active) challenge, notifying affected users.
    pub async fn refresh_sandboxes(&self, challenge_name: &str) -> Result<usize> {
        let challenge = self.store.get_challenge_by_name(challenge_name).await?;
        if !challenge.active {
            info!("challenge {challenge_name} is not active, skipping refresh");
            return Ok(0);
        }

        let sandboxes = self.store.active_sandboxes_for_challenge(challenge.id).await?;
        let mut refreshed = 0;
        for sandbox in &sandboxes {
            let user_id = sandbox.user_id;
            if let Err(e) = self.engine.destroy_sandbox(sandbox).await {
                warn!("failed to destroy sandbox {} during refresh: {e}", sandbox.id);
                continue;
            }
            let ip = match user_id {
                Some(uid) => self
                    .store
                    .find_active_session_for_user(uid)
                    .await?
                    .map(|s| s.ip_address),
                None => None,
            };
            match self.engine.get_or_create_sandbox(&challenge, user_id, ip.as_deref()).await {
                Ok(_) => {
                    refreshed += 1;
                    let message = format!("Your sandbox has been updated for challenge named {challenge_name}.");
                    if let Some(uid) = user_id {
                        self.notifier.notify(uid, &message).await.ok();
                    } else {
                        for uid in self.store.all_user_ids().await? {
                            self.notifier.notify(uid, &message).await.ok();
                        }
                    }
                }
                Err(e) => warn!("failed to recreate sandbox for challenge {}: {e}", challenge.id),
            }
        }
        info!("refreshed {refreshed} sandboxes for challenge {challenge_name}");
        Ok(refreshed)
    }

    /// §4.7 `clean_orphan_firewall_ports`.
    pub async fn clean_orphan_firewall_ports(&self) -> Result<usize> {
        let mut active_ports = HashSet::new();
        for sandbox in self.store.all_active_sandboxes().await? {
            for port in sandbox.all_ports() {
                active_ports.insert(port as u16);
            }
        }
        self.firewall.clean_orphan_ports(&active_ports).await
    }

    /// §4.7 `cleanup_expired_sessions`: deactivates sessions past
    /// `expires_at` and drops their non-static sandboxes' firewall mappings.
    pub async fn cleanup_expired_sessions(&self) -> Result<usize> {
        self.sessions.reap_expired().await
    }

}

impl<V, R, F> Scheduler<V, R, F>
where
    V: Volumes + Clone + 'static,
    R: Runtime + Clone + 'static,
    F: Firewall + Clone + 'static,
{
    /// Spawns all four periodic jobs plus the boot-time rebuild on
    /// `queue`, cancelled together via `queue`'s token.
    pub fn spawn_periodic(&self, queue: &TaskQueue, refresh_challenge_names: Vec<String>) {
        let token = queue.cancellation_token();

        let this = self.clone();
        queue.spawn_named("reap-non-static-sandboxes", run_every(token.clone(), Duration::from_secs(60), move || {
            let this = this.clone();
            async move {
                if let Err(e) = this.reap_non_static_sandboxes().await {
                    warn!("reap_non_static_sandboxes failed: {e}");
                }
            }
        }));

        let this = self.clone();
        queue.spawn_named("clean-orphan-firewall-ports", run_every(token.clone(), Duration::from_secs(600), move || {
            let this = this.clone();
            async move {
                if let Err(e) = this.clean_orphan_firewall_ports().await {
                    warn!("clean_orphan_firewall_ports failed: {e}");
                }
            }
        }));

        let this = self.clone();
        queue.spawn_named("cleanup-expired-sessions", run_every(token.clone(), Duration::from_secs(300), move || {
            let this = this.clone();
            async move {
                if let Err(e) = this.cleanup_expired_sessions().await {
                    warn!("cleanup_expired_sessions failed: {e}");
                }
            }
        }));

        for name in refresh_challenge_names {
            let this = self.clone();
            queue.spawn_named("refresh-sandboxes", run_every(token.clone(), Duration::from_secs(3600), move || {
                let this = this.clone();
                let name = name.clone();
                async move {
                    if let Err(e) = this.refresh_sandboxes(&name).await {
                        warn!("refresh_sandboxes({name}) failed: {e}");
                    }
                }
            }));
        }
    }
}

fn run_every<F, Fut>(token: CancellationToken, period: Duration, mut job: F) -> impl std::future::Future<Output = ()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => job().await,
            }
        }
    }
}
