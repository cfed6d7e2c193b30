use chrono::Duration;
use serde::{Deserialize, Serialize};

/// State of one runtime process as reported by the container manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Exited,
    NotFound,
    Error,
}

impl ProcessStatus {
    /// Map a `docker inspect --format {{.State.Status}}` value.
    pub fn from_state(state: &str) -> Self {
        match state.trim() {
            "running" => ProcessStatus::Running,
            "exited" | "dead" => ProcessStatus::Exited,
            "" => ProcessStatus::NotFound,
            _ => ProcessStatus::Error,
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Exited => write!(f, "exited"),
            ProcessStatus::NotFound => write!(f, "not_found"),
            ProcessStatus::Error => write!(f, "error"),
        }
    }
}

/// TTL verdict derived from the descriptor, independent of process status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtlStatus {
    Expired,
    Remaining(Duration),
}

impl std::fmt::Display for TtlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TtlStatus::Expired => write!(f, "EXPIRED"),
            TtlStatus::Remaining(d) => {
                let total = d.num_seconds().max(0);
                write!(f, "{}h {}m remaining", total / 3600, (total % 3600) / 60)
            }
        }
    }
}

/// Per-session health report: one status per runtime process, backend
/// reachability when it runs, and the TTL verdict.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub session_id: String,
    pub backend: ProcessStatus,
    pub frontend: ProcessStatus,
    /// None when the backend is not running (no probe attempted).
    pub backend_reachable: Option<bool>,
    pub ttl: TtlStatus,
    pub backend_port: u16,
    pub frontend_port: u16,
}

/// Listing status for a session, ranked RUNNING > EXPIRED > ACTIVE > STOPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Running,
    Expired,
    Active,
    Stopped,
}

impl SessionState {
    /// Derive the listing state. A running container wins over expiry so an
    /// expired-but-still-up session is visible as needing cleanup by its
    /// TTL column, not hidden behind a STOPPED row.
    pub fn classify(any_running: bool, expired: bool, active: bool) -> Self {
        if any_running {
            SessionState::Running
        } else if expired {
            SessionState::Expired
        } else if active {
            SessionState::Active
        } else {
            SessionState::Stopped
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Running => write!(f, "RUNNING"),
            SessionState::Expired => write!(f, "EXPIRED"),
            SessionState::Active => write!(f, "ACTIVE"),
            SessionState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// One row from the container manager's process listing.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeContainer {
    pub name: String,
    pub id: String,
    pub status: String,
    pub ports: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_status_maps_docker_states() {
        assert_eq!(ProcessStatus::from_state("running"), ProcessStatus::Running);
        assert_eq!(ProcessStatus::from_state("exited"), ProcessStatus::Exited);
        assert_eq!(ProcessStatus::from_state(""), ProcessStatus::NotFound);
        assert_eq!(ProcessStatus::from_state("restarting"), ProcessStatus::Error);
    }

    #[test]
    fn ttl_status_formats_hours_and_minutes() {
        let status = TtlStatus::Remaining(Duration::minutes(359));
        assert_eq!(status.to_string(), "5h 59m remaining");
        assert_eq!(TtlStatus::Expired.to_string(), "EXPIRED");
    }
}
