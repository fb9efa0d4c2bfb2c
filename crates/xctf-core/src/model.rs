//! Persistent entities (§3 of the spec).
//!
//! These mirror `original_source/challenge/models.py` and
//! `original_source/user_auth/models.py` field-for-field, normalised to Rust
//! types. `sqlx::FromRow` lets the store module map rows directly.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Challenge {
    pub id: i64,
    pub name: String,
    pub points: i32,
    pub flag: String,
    pub active: bool,
    pub category: String,
    /// Shared-sandbox challenge: at most one Sandbox exists, user is null (SB-2).
    pub static_challenge: bool,
    pub image_tag: Option<String>,
    /// TCP ports the container listens on beyond the mandatory 8000/tcp.
    #[sqlx(json)]
    pub tcp_ports: Option<Vec<u16>>,
    pub metadata_filepath: Option<String>,
}

/// Host-side port published for one container-side TCP port. Keyed by the
/// decimal string of the container port, matching the handshake file format
/// in §6.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortMappings(pub HashMap<String, i32>);

/// Normalises the original's duck-typed mapping values (int or numeric
/// string) to `i32` at the ingress, per spec.md §9.
impl<'de> Deserialize<'de> for PortMappings {
    fn deserialize<D>(deserializer: D) -> core::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: HashMap<String, serde_json::Value> = HashMap::deserialize(deserializer)?;
        let mut out = HashMap::with_capacity(raw.len());
        for (k, v) in raw {
            let port = coerce_port(&v).map_err(serde::de::Error::custom)?;
            out.insert(k, port);
        }
        Ok(PortMappings(out))
    }
}

fn coerce_port(v: &serde_json::Value) -> Result<i32> {
    match v {
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| Error::ValidationError(format!("port value out of range: {n}"))),
        serde_json::Value::String(s) => s
            .parse::<i32>()
            .map_err(|_| Error::ValidationError(format!("non-integral port value: {s}"))),
        other => Err(Error::ValidationError(format!(
            "port value must be int or string, got {other}"
        ))),
    }
}

impl PortMappings {
    pub fn values_as_ints(&self) -> impl Iterator<Item = i32> + '_ {
        self.0.values().copied()
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Sandbox {
    pub id: i64,
    /// Opaque container identifier from C3.
    pub container_id: String,
    /// Primary exposed host port (users are redirected here).
    pub container_port: i32,
    pub created_at: NaiveDateTime,
    pub destroyed_at: Option<NaiveDateTime>,
    pub challenge_id: i64,
    /// Null iff the owning challenge is static (SB-2).
    pub user_id: Option<i64>,
    pub active: bool,
    #[sqlx(json)]
    pub port_mappings: Option<PortMappings>,
}

impl Sandbox {
    /// Every host port this sandbox occupies: primary plus mapped extras.
    pub fn all_ports(&self) -> Vec<i32> {
        let mut ports = vec![self.container_port];
        if let Some(pm) = &self.port_mappings {
            ports.extend(pm.values_as_ints());
        }
        ports
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub verified: bool,
    pub is_admin: bool,
    pub banned: bool,
    #[serde(skip_serializing)]
    pub password_hash: String,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    pub ip_address: String,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub active: bool,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Submission {
    pub id: i64,
    pub user_id: i64,
    pub challenge_id: i64,
    pub correct: bool,
    pub submitted_at: NaiveDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub message: String,
    pub is_read: bool,
    pub created_at: NaiveDateTime,
}
