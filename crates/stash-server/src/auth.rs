//! Authenticator: registration, login, and bearer-token resolution
//!
//! Passwords are hashed with Argon2id; session tokens are opaque random
//! strings resolved to an owner id before any call reaches the core. A
//! wrong login and a wrong password are indistinguishable to the caller.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use stash_core::{VaultError, VaultResult};

struct UserRow {
    id: u64,
    password_hash: String,
}

#[derive(Default)]
struct AuthTables {
    next_id: u64,
    users: HashMap<String, UserRow>,
    sessions: HashMap<String, u64>,
}

/// In-process authenticator backing the gRPC surface.
#[derive(Default)]
pub struct Authenticator {
    inner: RwLock<AuthTables>,
}

impl Authenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a user and start a session. Duplicate logins are rejected.
    pub async fn register(&self, login: &str, password: &str) -> VaultResult<String> {
        if login.is_empty() || password.is_empty() {
            return Err(VaultError::InvalidArgument(
                "login and password are required".into(),
            ));
        }

        let password_hash = hash_password(password)?;

        let mut tables = self.inner.write().await;
        if tables.users.contains_key(login) {
            return Err(VaultError::LoginTaken);
        }

        tables.next_id += 1;
        let id = tables.next_id;
        tables.users.insert(
            login.to_string(),
            UserRow { id, password_hash },
        );

        let token = issue_token();
        tables.sessions.insert(token.clone(), id);
        info!(owner = id, "user registered");
        Ok(token)
    }

    /// Verify credentials and start a session.
    pub async fn login(&self, login: &str, password: &str) -> VaultResult<String> {
        let mut tables = self.inner.write().await;

        let user = tables.users.get(login).ok_or(VaultError::NotFound)?;
        if !verify_password(password, &user.password_hash)? {
            return Err(VaultError::NotFound);
        }
        let id = user.id;

        let token = issue_token();
        tables.sessions.insert(token.clone(), id);
        debug!(owner = id, "session started");
        Ok(token)
    }

    /// Resolve the bearer token from call metadata to an owner id.
    pub async fn resolve(&self, metadata: &tonic::metadata::MetadataMap) -> VaultResult<u64> {
        let raw = metadata
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or(VaultError::Unauthenticated)?;
        let token = raw.strip_prefix("Bearer ").unwrap_or(raw);

        self.inner
            .read()
            .await
            .sessions
            .get(token)
            .copied()
            .ok_or(VaultError::Unauthenticated)
    }
}

fn issue_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn hash_password(password: &str) -> VaultResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| VaultError::Crypto(format!("password hashing failed: {e}")))?
        .to_string())
}

fn verify_password(password: &str, hash: &str) -> VaultResult<bool> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| VaultError::Crypto(format!("bad password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
