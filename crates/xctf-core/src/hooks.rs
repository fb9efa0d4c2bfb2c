//! C8: event hooks. The original fires these from Django `pre_save`
//! signals comparing old vs new model state
//! (`original_source/events/signals.py`); without an ORM in the loop here,
//! the transition is detected by `store::set_challenge_active` /
//! `store::set_user_banned` returning the value the row held before the
//! update, and the admin route that calls them drives these hooks directly.

use log::info;

use crate::engine::SandboxEngine;
use crate::error::Result;
use crate::firewall::{Firewall, FirewallController};
use crate::model::Challenge;
use crate::notify::Notifier;
use crate::runtime::{ContainerRuntime, Runtime};
use crate::session::SessionRegistry;
use crate::store::Store;
use crate::volume::{VolumeManager, Volumes};

#[derive(Clone)]
pub struct EventHooks<
    V: Volumes = VolumeManager,
    R: Runtime = ContainerRuntime,
    F: Firewall = FirewallController,
> {
    store: Store,
    engine: SandboxEngine<V, R, F>,
    sessions: SessionRegistry<F>,
    notifier: Notifier,
}

impl<V: Volumes, R: Runtime, F: Firewall> EventHooks<V, R, F> {
    pub fn new(store: Store, engine: SandboxEngine<V, R, F>, sessions: SessionRegistry<F>, notifier: Notifier) -> Self {
        Self {
            store,
            engine,
            sessions,
            notifier,
        }
    }

    /// Call after flipping a challenge's `active` flag. Only fires cleanup
    /// on the active -> inactive edge, same as the original's signal guard.
    pub async fn on_challenge_active_changed(&self, was_active: bool, challenge: &Challenge) -> Result<()> {
        if !(was_active && !challenge.active) {
            return Ok(());
        }

        info!("challenge {} deactivated, cleaning up its sandboxes", challenge.name);
        let sandboxes = self.store.active_sandboxes_for_challenge(challenge.id).await?;
        for sandbox in &sandboxes {
            self.engine.destroy_sandbox(sandbox).await.ok();
        }

        let message = format!("Challenge {} has been deactivated.", challenge.name);
        for user_id in self.store.all_user_ids().await? {
            self.notifier.notify(user_id, &message).await.ok();
        }

        info!("cleaned up {} sandboxes for challenge {}", sandboxes.len(), challenge.name);
        Ok(())
    }

    /// Call after flipping a user's `banned` flag. Only fires on the
    /// not-banned -> banned edge.
    pub async fn on_user_banned_changed(&self, was_banned: bool, user_id: i64, now_banned: bool) -> Result<()> {
        if was_banned || !now_banned {
            return Ok(());
        }

        info!("user {user_id} banned, cleaning up sandboxes and forcing logout");
        let sandboxes = self.store.active_sandboxes_for_user(user_id).await?;
        for sandbox in &sandboxes {
            self.engine.destroy_sandbox(sandbox).await.ok();
        }
        self.sessions.force_logout_banned(user_id).await.ok();

        info!("cleaned up {} sandboxes for banned user {user_id}", sandboxes.len());
        Ok(())
    }
}
