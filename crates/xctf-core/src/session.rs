//! C5: session registry and IP-scoped access handoff.
//!
//! Grounded in `original_source/user_auth/views.py`'s login view and
//! `original_source/user_auth/middleware_security.py`'s
//! `UserStatusMiddleware`: one active session per user, a new login from a
//! different IP deactivates the old session and moves every active
//! non-static sandbox's firewall mapping to the new IP, and a banned user is
//! force-logged-out with their mappings torn down on their next request.

use log::info;

use crate::error::Result;
use crate::firewall::{Firewall, FirewallController};
use crate::model::{Sandbox, Session};
use crate::store::Store;

#[derive(Clone)]
pub struct SessionRegistry<F: Firewall = FirewallController> {
    store: Store,
    firewall: F,
    session_ttl_secs: i64,
}

/// Outcome of a login: the new session plus whatever IP-handoff firewall
/// work was needed, so the caller can log/report it without the registry
/// reaching into an HTTP layer.
pub struct LoginOutcome {
    pub session: Session,
    pub migrated_sandboxes: usize,
}

impl<F: Firewall> SessionRegistry<F> {
    pub fn new(store: Store, firewall: F, session_ttl_secs: i64) -> Self {
        Self {
            store,
            firewall,
            session_ttl_secs,
        }
    }

    /// Deactivates any existing session for this user, opens a new one at
    /// `client_ip`, and if the IP changed, re-points every active non-static
    /// sandbox's firewall rule from the old IP to the new one.
    pub async fn login(&self, user_id: i64, client_ip: &str) -> Result<LoginOutcome> {
        let existing = self.store.find_active_session_for_user(user_id).await?;
        let old_ip = existing.as_ref().map(|s| s.ip_address.clone());

        let mut tx = self.store.begin().await?;
        self.store
            .deactivate_active_sessions_for_user(&mut tx, user_id)
            .await?;
        let session = self
            .store
            .insert_session(&mut tx, user_id, client_ip, self.session_ttl_secs)
            .await?;
        tx.commit().await?;

        let mut migrated = 0;
        if old_ip.as_deref() != Some(client_ip) {
            let sandboxes = self.store.active_sandboxes_for_user(user_id).await?;
            for sandbox in &sandboxes {
                if let Some(old_ip) = &old_ip {
                    self.remap_sandbox_ip(sandbox, old_ip, client_ip).await?;
                    migrated += 1;
                } else {
                    self.add_sandbox_ip(sandbox, client_ip).await?;
                }
            }
        }

        Ok(LoginOutcome {
            session,
            migrated_sandboxes: migrated,
        })
    }

    async fn add_sandbox_ip(&self, sandbox: &Sandbox, ip: &str) -> Result<()> {
        for port in sandbox.all_ports() {
            self.firewall.add_port_ip_mapping(port as u16, ip).await?;
        }
        Ok(())
    }

    async fn remap_sandbox_ip(&self, sandbox: &Sandbox, old_ip: &str, new_ip: &str) -> Result<()> {
        for port in sandbox.all_ports() {
            self.firewall.remove_port_ip_mapping(port as u16, old_ip).await?;
            self.firewall.add_port_ip_mapping(port as u16, new_ip).await?;
        }
        Ok(())
    }

    /// `UserStatusMiddleware`'s ban path: drop the session and strip every
    /// firewall mapping the user's sandboxes were using.
    pub async fn force_logout_banned(&self, user_id: i64) -> Result<()> {
        let Some(session) = self.store.find_active_session_for_user(user_id).await? else {
            return Ok(());
        };
        let sandboxes = self.store.active_sandboxes_for_user(user_id).await?;
        for sandbox in &sandboxes {
            for port in sandbox.all_ports() {
                self.firewall
                    .remove_port_ip_mapping(port as u16, &session.ip_address)
                    .await?;
            }
        }
        self.store.deactivate_session(session.id).await?;
        info!("force-logged-out banned user {user_id}");
        Ok(())
    }

    /// Sweeps sessions past `expires_at` (§4.7 `cleanup_expired_sessions`):
    /// for each, drop the firewall mappings for every non-static sandbox the
    /// session's user owns, then flip the session inactive.
    pub async fn reap_expired(&self) -> Result<usize> {
        let expired = self.store.expired_active_sessions().await?;
        for session in &expired {
            let sandboxes = self.store.active_sandboxes_for_user(session.user_id).await?;
            for sandbox in &sandboxes {
                for port in sandbox.all_ports() {
                    self.firewall
                        .remove_port_ip_mapping(port as u16, &session.ip_address)
                        .await?;
                }
            }
            self.store.deactivate_session(session.id).await?;
        }
        Ok(expired.len())
    }

    /// `UserStatusMiddleware`'s per-request check: a request from a user with
    /// an active session at a *different* IP than the one it's arriving from
    /// is an IP mismatch, not a handoff (unlike [`Self::login`]); nothing
    /// here installs new firewall rules for the new IP, since no fresh login
    /// has happened. The old session is torn down and the caller is expected
    /// to force a re-login.
    pub async fn check_request(&self, user_id: i64, current_ip: &str) -> Result<RequestOutcome> {
        if self.store.find_active_session(user_id, current_ip).await?.is_some() {
            return Ok(RequestOutcome::Ok);
        }

        let Some(other) = self.store.find_active_session_for_user(user_id).await? else {
            return Ok(RequestOutcome::NoSession);
        };

        let sandboxes = self.store.active_sandboxes_for_user(user_id).await?;
        for sandbox in &sandboxes {
            for port in sandbox.all_ports() {
                self.firewall
                    .remove_port_ip_mapping(port as u16, &other.ip_address)
                    .await?;
            }
        }
        self.store.deactivate_session(other.id).await?;
        info!("user {user_id} IP mismatch (session at {}, request from {current_ip}), logging out", other.ip_address);
        Ok(RequestOutcome::IpMismatch)
    }
}

/// Outcome of [`SessionRegistry::check_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Request IP matches an active session for this user.
    Ok,
    /// User has no active session at all.
    NoSession,
    /// User has an active session, but at a different IP; it has just been
    /// torn down.
    IpMismatch,
}
