use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::Result;
use crate::error::GatewayError;
use crate::governance::Clock;
use crate::governance::persistence::{AdminSession, ConfigStore};

const SESSION_TTL_SECONDS: u64 = 24 * 3600;

/// Credential for the admin surface: a username plus the sha256 hex digest
/// of the password. Only the digest is ever held in memory.
#[derive(Clone)]
pub struct AdminCredential {
    pub username: String,
    pub password_sha256: String,
}

impl std::fmt::Debug for AdminCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredential")
            .field("username", &self.username)
            .field("password_sha256", &"<redacted>")
            .finish()
    }
}

impl AdminCredential {
    pub fn new(username: impl Into<String>, password: &str) -> Self {
        Self {
            username: username.into(),
            password_sha256: sha256_hex(password),
        }
    }
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Issues and validates opaque dashboard session tokens, persisted through
/// the config store so a restart does not log every operator out.
pub struct SessionManager {
    config_store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    credential: Option<AdminCredential>,
}

impl SessionManager {
    pub fn new(
        config_store: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
        credential: Option<AdminCredential>,
    ) -> Self {
        Self {
            config_store,
            clock,
            credential,
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<AdminSession> {
        let Some(credential) = &self.credential else {
            return Err(GatewayError::Unauthorized);
        };
        // Digest comparison; the plaintext password is never stored.
        if credential.username != username || credential.password_sha256 != sha256_hex(password) {
            return Err(GatewayError::Unauthorized);
        }

        let session = AdminSession {
            token: uuid::Uuid::new_v4().to_string(),
            subject: username.to_string(),
            expires_at: self.clock.now_epoch_seconds() + SESSION_TTL_SECONDS,
        };
        self.config_store.put_session(&session).await?;
        Ok(session)
    }

    pub async fn validate(&self, token: &str) -> Result<AdminSession> {
        let session = self
            .config_store
            .get_session(token)
            .await?
            .ok_or(GatewayError::Unauthorized)?;
        if session.expires_at <= self.clock.now_epoch_seconds() {
            return Err(GatewayError::SessionExpired);
        }
        Ok(session)
    }
}
