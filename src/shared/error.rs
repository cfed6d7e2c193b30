use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    /// Session, conversation, document or descriptor is absent, or not owned
    /// by the caller. Ownership mismatches report as NotFound so that
    /// existence is never leaked across sessions.
    #[error("not found: {0}")]
    NotFound(String),

    /// Session TTL has passed. Callers presenting this to users must render
    /// it identically to an invalid session.
    #[error("session expired: {0}")]
    Expired(String),

    /// Port or subnet collision at bind time. Retryable with a fresh
    /// allocation.
    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    /// External orchestration command exited nonzero. Carries the captured
    /// stderr text.
    #[error("orchestration failed: {0}")]
    Orchestration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("hash error: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
