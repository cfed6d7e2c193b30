use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::shared::error::Result;

const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";
const PASSWORD_LENGTH: usize = 16;

/// Generate a researcher username with a random hex suffix.
pub fn generate_username() -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("researcher_{suffix}")
}

pub fn generate_password() -> String {
    (0..PASSWORD_LENGTH)
        .map(|_| {
            let idx = OsRng.gen_range(0..PASSWORD_ALPHABET.len());
            PASSWORD_ALPHABET[idx] as char
        })
        .collect()
}

/// Session identifiers double as bearer-token claims, so they come from the
/// OS random source: 32 bytes, URL-safe base64.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Per-session secret key material for the runtime environment file.
pub fn generate_secret_key() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn hash_password(password: &str) -> Result<String> {
    Ok(bcrypt::hash(password, bcrypt::DEFAULT_COST)?)
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    bcrypt::verify(password, password_hash).unwrap_or(false)
}

/// Bearer-token claims: the authenticated username plus the session the
/// token is bound to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub session_id: String,
    pub exp: usize,
    pub iat: usize,
    pub iss: String,
}

/// Tokens expire together with the session they are bound to, so a token
/// never outlives its session's TTL.
pub fn issue_session_token(
    username: &str,
    session_id: &str,
    secret: &str,
    expires_at: DateTime<Utc>,
) -> Result<String> {
    let claims = SessionClaims {
        sub: username.to_string(),
        session_id: session_id.to_string(),
        exp: expires_at.timestamp() as usize,
        iat: Utc::now().timestamp() as usize,
        iss: "resbx".to_string(),
    };

    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )?)
}

pub fn verify_session_token(token: &str, secret: &str) -> Result<SessionClaims> {
    let data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}
