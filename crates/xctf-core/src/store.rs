//! Persistent storage (§6): Postgres via `sqlx`, queried with the
//! runtime-checked `query_as`/`query` builders rather than the `query!`
//! macro, the same style `crates/api/src/admin/challenges.rs` falls back to
//! whenever a query's shape doesn't fit the macro's single-struct model.

use chrono::{NaiveDateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{Error, Result};
use crate::model::{Challenge, Notification, PortMappings, Sandbox, Session, Submission, User};

pub type Tx<'a> = Transaction<'a, Postgres>;

#[derive(Clone)]
pub struct Store {
    pub pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin(&self) -> Result<Tx<'static>> {
        Ok(self.pool.begin().await?)
    }

    // ---- challenges ----

    pub async fn get_challenge(&self, id: i64) -> Result<Challenge> {
        sqlx::query_as::<_, Challenge>("SELECT * FROM challenges WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("challenge"))
    }

    pub async fn get_challenge_by_name(&self, name: &str) -> Result<Challenge> {
        sqlx::query_as::<_, Challenge>("SELECT * FROM challenges WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("challenge"))
    }

    /// Flip `active` for a challenge, returning the value it held before the
    /// update so the caller (C8) can detect an active->inactive transition
    /// the way a Django `pre_save` signal would.
    pub async fn set_challenge_active(&self, id: i64, active: bool) -> Result<bool> {
        let mut tx = self.begin().await?;
        let old_active: bool = sqlx::query_scalar("SELECT active FROM challenges WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(Error::NotFound("challenge"))?;
        sqlx::query("UPDATE challenges SET active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(old_active)
    }

    // ---- users ----

    pub async fn get_user(&self, id: i64) -> Result<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("user"))
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("user"))
    }

    /// Flip `banned` for a user, returning the prior value (see
    /// `set_challenge_active`).
    pub async fn set_user_banned(&self, id: i64, banned: bool) -> Result<bool> {
        let mut tx = self.begin().await?;
        let old_banned: bool = sqlx::query_scalar("SELECT banned FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(Error::NotFound("user"))?;
        sqlx::query("UPDATE users SET banned = $2 WHERE id = $1")
            .bind(id)
            .bind(banned)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(old_banned)
    }

    // ---- sandboxes ----

    pub async fn get_sandbox(&self, id: i64) -> Result<Sandbox> {
        sqlx::query_as::<_, Sandbox>("SELECT * FROM sandboxes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("sandbox"))
    }

    /// Find-or-none for the (challenge, user-or-null) key of SB-1/SB-2.
    /// `user_id = NULL` is matched with `IS NOT DISTINCT FROM`, matching the
    /// teacher's `team_id IS NOT DISTINCT FROM $1` idiom for optional keys.
    pub async fn find_active_sandbox(
        &self,
        challenge_id: i64,
        user_id: Option<i64>,
    ) -> Result<Option<Sandbox>> {
        Ok(sqlx::query_as::<_, Sandbox>(
            "SELECT * FROM sandboxes
             WHERE challenge_id = $1 AND user_id IS NOT DISTINCT FROM $2 AND active = true",
        )
        .bind(challenge_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_sandbox(
        &self,
        tx: &mut Tx<'_>,
        container_id: &str,
        container_port: i32,
        challenge_id: i64,
        user_id: Option<i64>,
        port_mappings: &PortMappings,
    ) -> Result<Sandbox> {
        Ok(sqlx::query_as::<_, Sandbox>(
            "INSERT INTO sandboxes
                (container_id, container_port, challenge_id, user_id, active, port_mappings)
             VALUES ($1, $2, $3, $4, true, $5)
             RETURNING *",
        )
        .bind(container_id)
        .bind(container_port)
        .bind(challenge_id)
        .bind(user_id)
        .bind(sqlx::types::Json(port_mappings.0.clone()))
        .fetch_one(&mut **tx)
        .await?)
    }

    pub async fn mark_sandbox_inactive(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET active = false, destroyed_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now().naive_utc())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn active_sandboxes_for_challenge(&self, challenge_id: i64) -> Result<Vec<Sandbox>> {
        Ok(sqlx::query_as::<_, Sandbox>(
            "SELECT * FROM sandboxes WHERE challenge_id = $1 AND active = true",
        )
        .bind(challenge_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn active_sandboxes_for_user(&self, user_id: i64) -> Result<Vec<Sandbox>> {
        Ok(sqlx::query_as::<_, Sandbox>(
            "SELECT * FROM sandboxes WHERE user_id = $1 AND active = true",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn all_active_sandboxes(&self) -> Result<Vec<Sandbox>> {
        Ok(
            sqlx::query_as::<_, Sandbox>("SELECT * FROM sandboxes WHERE active = true")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// §4.7 `destroy_non_static_sandboxes`: active, non-static, and either
    /// already solved or older than `max_age`.
    pub async fn reapable_non_static_sandboxes(&self, max_age_secs: i64) -> Result<Vec<Sandbox>> {
        let cutoff: NaiveDateTime = Utc::now().naive_utc() - chrono::Duration::seconds(max_age_secs);
        Ok(sqlx::query_as::<_, Sandbox>(
            "SELECT s.* FROM sandboxes s
             JOIN challenges c ON c.id = s.challenge_id
             WHERE s.active = true AND c.static_challenge = false
               AND (
                    s.created_at <= $1
                    OR EXISTS (
                        SELECT 1 FROM submissions sub
                        WHERE sub.user_id = s.user_id
                          AND sub.challenge_id = s.challenge_id
                          AND sub.correct = true
                    )
               )",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?)
    }

    // ---- sessions ----

    pub async fn find_active_session_for_user(&self, user_id: i64) -> Result<Option<Session>> {
        Ok(
            sqlx::query_as::<_, Session>(
                "SELECT * FROM sessions WHERE user_id = $1 AND active = true",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?,
        )
    }

    pub async fn find_active_session(&self, user_id: i64, ip: &str) -> Result<Option<Session>> {
        Ok(sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE user_id = $1 AND ip_address = $2 AND active = true",
        )
        .bind(user_id)
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn deactivate_active_sessions_for_user(&self, tx: &mut Tx<'_>, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE sessions SET active = false WHERE user_id = $1 AND active = true")
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn insert_session(
        &self,
        tx: &mut Tx<'_>,
        user_id: i64,
        ip: &str,
        ttl_secs: i64,
    ) -> Result<Session> {
        let expires_at = Utc::now().naive_utc() + chrono::Duration::seconds(ttl_secs);
        Ok(sqlx::query_as::<_, Session>(
            "INSERT INTO sessions (user_id, ip_address, expires_at, active)
             VALUES ($1, $2, $3, true) RETURNING *",
        )
        .bind(user_id)
        .bind(ip)
        .bind(expires_at)
        .fetch_one(&mut **tx)
        .await?)
    }

    pub async fn deactivate_session(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE sessions SET active = false WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn all_active_sessions(&self) -> Result<Vec<Session>> {
        Ok(
            sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE active = true")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn expired_active_sessions(&self) -> Result<Vec<Session>> {
        Ok(sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE active = true AND expires_at <= $1",
        )
        .bind(Utc::now().naive_utc())
        .fetch_all(&self.pool)
        .await?)
    }

    // ---- submissions ----

    pub async fn has_correct_submission(&self, user_id: i64, challenge_id: i64) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM submissions WHERE user_id = $1 AND challenge_id = $2 AND correct = true)",
        )
        .bind(user_id)
        .bind(challenge_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn insert_submission(
        &self,
        user_id: i64,
        challenge_id: i64,
        correct: bool,
    ) -> Result<Submission> {
        Ok(sqlx::query_as::<_, Submission>(
            "INSERT INTO submissions (user_id, challenge_id, correct) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(user_id)
        .bind(challenge_id)
        .bind(correct)
        .fetch_one(&self.pool)
        .await?)
    }

    // ---- notifications ----

    pub async fn insert_notification(&self, user_id: i64, message: &str) -> Result<Notification> {
        Ok(sqlx::query_as::<_, Notification>(
            "INSERT INTO notifications (user_id, message, is_read) VALUES ($1, $2, false) RETURNING *",
        )
        .bind(user_id)
        .bind(message)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn all_user_ids(&self) -> Result<Vec<i64>> {
        Ok(sqlx::query_scalar("SELECT id FROM users")
            .fetch_all(&self.pool)
            .await?)
    }
}
