use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A time-boxed, credentialed unit of isolation for one researcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_hours: i64,
    /// Logical logout flag. Logout marks a session inactive but never
    /// deletes its data; only TTL expiry does.
    pub active: bool,
    #[serde(default)]
    pub documents: Vec<String>,
    #[serde(default)]
    pub conversations: Vec<String>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Remaining lifetime, floored at zero. Zero means logically expired
    /// even before the reconciler physically deletes the session.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        let remaining = self.expires_at - now;
        if remaining > Duration::zero() {
            remaining
        } else {
            Duration::zero()
        }
    }
}

/// Network resources and container naming allocated to one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub backend_port: u16,
    pub frontend_port: u16,
    pub subnet: String,
    /// Base name; the runtime pair is `<name>_backend` / `<name>_frontend`.
    pub container_name: String,
}

impl ContainerConfig {
    pub fn backend_container(&self) -> String {
        format!("{}_backend", self.container_name)
    }

    pub fn frontend_container(&self) -> String {
        format!("{}_frontend", self.container_name)
    }

    /// Compose project name: lowercase alphanumeric/-/_ only, so session ids
    /// with base64 characters stay valid.
    pub fn compose_project(&self) -> String {
        self.container_name
            .chars()
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

/// The durable, file-backed record of a session: one `session.json` per
/// session directory, created at provisioning, mutated by extend, removed
/// by cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(flatten)]
    pub session: Session,
    pub container_config: ContainerConfig,
}

impl SessionDescriptor {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.session.is_expired(now)
    }
}

/// Plaintext credentials returned exactly once at provisioning time for
/// out-of-band delivery. Never persisted.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub username: String,
    pub password: String,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}
