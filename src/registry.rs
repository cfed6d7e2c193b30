use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::auth;
use crate::shared::error::{Result, SandboxError};
use crate::shared::models::{Session, SessionDescriptor};

/// Live, process-local session registry. Source of truth while the serving
/// process runs; optionally bootstrapped from descriptors at startup.
///
/// One mutex guards all mutation; request handlers and the reconciler go
/// through the same lock. Nothing here is held across an await point or a
/// subprocess wait.
pub struct SessionRegistry {
    ttl_hours: i64,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new(ttl_hours: i64) -> Self {
        Self {
            ttl_hours,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new session bound to a credential record. Returns the
    /// generated unguessable session identifier.
    pub fn create(&self, username: &str, password_hash: &str) -> String {
        let session_id = auth::generate_session_id();
        let created_at = Utc::now();
        let session = Session {
            session_id: session_id.clone(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at,
            expires_at: created_at + Duration::hours(self.ttl_hours),
            ttl_hours: self.ttl_hours,
            active: true,
            documents: Vec::new(),
            conversations: Vec::new(),
        };

        let mut sessions = self.sessions.lock().expect("registry lock");
        sessions.insert(session_id.clone(), session);
        info!("Registered session {} for {}", session_id, username);
        session_id
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        let sessions = self.sessions.lock().expect("registry lock");
        sessions.get(session_id).cloned()
    }

    /// Login path: resolve a session by its bound username.
    pub fn find_by_username(&self, username: &str) -> Option<Session> {
        let sessions = self.sessions.lock().expect("registry lock");
        sessions.values().find(|s| s.username == username).cloned()
    }

    /// Resolve a session for authorized access. Absent sessions are
    /// NotFound; sessions with zero remaining time are Expired even before
    /// the reconciler removes them. Callers must present both identically.
    pub fn authorize(&self, session_id: &str) -> Result<Session> {
        let sessions = self.sessions.lock().expect("registry lock");
        let session = sessions
            .get(session_id)
            .ok_or_else(|| SandboxError::NotFound(format!("session {session_id}")))?;
        if session.time_remaining(Utc::now()) <= Duration::zero() {
            return Err(SandboxError::Expired(session_id.to_string()));
        }
        Ok(session.clone())
    }

    /// Logout: mark the session inactive. Idempotent; conversations and
    /// documents survive until TTL deletion.
    pub fn mark_inactive(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().expect("registry lock");
        if let Some(session) = sessions.get_mut(session_id) {
            session.active = false;
        }
    }

    /// Remaining lifetime floored at zero, or None for unknown sessions.
    pub fn time_remaining(&self, session_id: &str) -> Option<Duration> {
        let sessions = self.sessions.lock().expect("registry lock");
        sessions
            .get(session_id)
            .map(|s| s.time_remaining(Utc::now()))
    }

    pub fn delete(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("registry lock");
        sessions.remove(session_id).is_some()
    }

    pub fn record_conversation(&self, session_id: &str, conversation_id: &str) {
        let mut sessions = self.sessions.lock().expect("registry lock");
        if let Some(session) = sessions.get_mut(session_id) {
            if !session.conversations.iter().any(|c| c == conversation_id) {
                session.conversations.push(conversation_id.to_string());
            }
        }
    }

    pub fn record_document(&self, session_id: &str, document_id: &str) {
        let mut sessions = self.sessions.lock().expect("registry lock");
        if let Some(session) = sessions.get_mut(session_id) {
            if !session.documents.iter().any(|d| d == document_id) {
                session.documents.push(document_id.to_string());
            }
        }
    }

    /// One-time boot import from the descriptor store. Only identity,
    /// credentials and timing come across; message history is never
    /// rehydrated into the (empty by design) ephemeral store.
    pub fn import_descriptor(&self, descriptor: &SessionDescriptor) {
        let mut session = descriptor.session.clone();
        session.documents.clear();
        session.conversations.clear();

        let mut sessions = self.sessions.lock().expect("registry lock");
        if sessions.contains_key(&session.session_id) {
            warn!(
                "Descriptor import skipped, session {} already registered",
                session.session_id
            );
            return;
        }
        info!(
            "Imported session {} ({}) from descriptor",
            session.session_id, session.username
        );
        sessions.insert(session.session_id.clone(), session);
    }

    /// Remove every session past its TTL and return the removed ids so the
    /// caller can cascade-clear ephemeral data.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().expect("registry lock");
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.session_id.clone())
            .collect();
        for session_id in &expired {
            sessions.remove(session_id);
        }
        expired
    }

    /// Drain every session (emergency cleanup).
    pub fn clear(&self) -> Vec<String> {
        let mut sessions = self.sessions.lock().expect("registry lock");
        sessions.drain().map(|(id, _)| id).collect()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let sessions = self.sessions.lock().expect("registry lock");
        sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
