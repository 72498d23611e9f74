//! Credentials and sessions.
//!
//! Passwords are stored as argon2 PHC strings with a random salt per password. Sessions are
//! opaque bearer tokens held in memory; they carry the account id, email and role.
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::store::{Account, AccountId, Role};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Password must be at least 8 characters")]
    WeakPassword,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Password hashing failed: {0}")]
    Hash(String),
}

impl From<argon2::password_hash::Error> for AuthError {
    fn from(e: argon2::password_hash::Error) -> Self {
        Self::Hash(e.to_string())
    }
}

/// Hashes a password with argon2id and a fresh random salt.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword);
    }
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())?;
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Checks a password against a stored PHC string. A malformed stored hash never verifies.
pub fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Lowercased, trimmed email used as the lookup key.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// What the rest of the service knows about a signed-in user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub account_id: AccountId,
    pub email: String,
    pub role: Role,
    expires_at: Instant,
}

impl Session {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory session table keyed by bearer token.
pub struct SessionStore {
    ttl: Duration,
    sessions: RwLock<HashMap<String, Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Starts a session for the account and returns its token.
    pub async fn issue(&self, account: &Account) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let session = Session {
            account_id: account.id.clone(),
            email: account.email.clone(),
            role: account.role,
            expires_at: Instant::now() + self.ttl,
        };

        let mut sessions = self.sessions.write().await;
        let now = Instant::now();
        sessions.retain(|_, s| !s.is_expired(now));
        sessions.insert(token.clone(), session);
        token
    }

    /// Looks up a live session. Expired sessions are dropped on sight.
    pub async fn resolve(&self, token: &str) -> Option<Session> {
        let now = Instant::now();
        {
            let sessions = self.sessions.read().await;
            match sessions.get(token) {
                Some(s) if !s.is_expired(now) => return Some(s.clone()),
                None => return None,
                Some(_) => {}
            }
        }
        self.sessions.write().await.remove(token);
        None
    }

    pub async fn revoke(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }

    /// Ends every session of an account, e.g. after a password change.
    pub async fn revoke_account(&self, id: &AccountId) {
        self.sessions
            .write()
            .await
            .retain(|_, s| &s.account_id != id);
    }
}
