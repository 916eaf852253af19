//! Credential store for advertising-platform access tokens.
//!
//! Secrets are AES-256-GCM encrypted at rest in SQLite, one nonce per secret.
//! The store tracks an `active` flag per credential: `rotate` atomically
//! deactivates every prior credential of the same kind while activating the
//! new one, so at most one credential per kind is ever selectable. An expired
//! or deactivated credential is never returned to a caller.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use crate::cursor::parse_ts;
use crate::error::{Result, SyncError};

mod encryption;

pub use encryption::{decrypt, encrypt, validate_key};

/// Closed set of credential kinds the platform accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialKind {
    AccessToken,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::AccessToken => "access-token",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "access-token" => Ok(CredentialKind::AccessToken),
            other => Err(SyncError::Invariant(format!(
                "unknown credential kind '{other}' in store"
            ))),
        }
    }
}

/// A decrypted credential handed to the remote client.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: Uuid,
    pub kind: CredentialKind,
    pub secret: String,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Encrypted credential storage backed by SQLite.
///
/// The connection is wrapped in a Mutex; `rotate` runs in a transaction so
/// deactivation of prior credentials and activation of the new one are a
/// single atomic step.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    encryption_key: Vec<u8>,
}

impl CredentialStore {
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let key_bytes = validate_key(encryption_key)
            .map_err(|e| SyncError::Invariant(format!("invalid encryption key: {e}")))?;

        let conn = Connection::open(db_path)?;
        Self::init(conn, key_bytes)
    }

    pub fn in_memory(encryption_key: &str) -> Result<Self> {
        let key_bytes = validate_key(encryption_key)
            .map_err(|e| SyncError::Invariant(format!("invalid encryption key: {e}")))?;
        Self::init(Connection::open_in_memory()?, key_bytes)
    }

    fn init(conn: Connection, encryption_key: Vec<u8>) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                secret TEXT NOT NULL,
                secret_nonce TEXT NOT NULL,
                active INTEGER NOT NULL,
                expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_credentials_kind_active ON credentials(kind, active)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            encryption_key,
        })
    }

    /// Atomically replace the active credential of `kind`.
    ///
    /// Prior credentials of the same kind are deactivated in the same
    /// transaction that inserts the new active one.
    pub fn rotate(
        &self,
        kind: CredentialKind,
        secret: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Credential> {
        let (ciphertext, nonce) = encrypt(secret, &self.encryption_key)
            .map_err(|e| SyncError::Invariant(format!("credential encryption failed: {e}")))?;

        let id = Uuid::new_v4();
        let now = Utc::now();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE credentials SET active = 0, updated_at = ?2 WHERE kind = ?1",
            params![kind.as_str(), now.to_rfc3339()],
        )?;
        tx.execute(
            r#"
            INSERT INTO credentials (id, kind, secret, secret_nonce, active, expires_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6)
            "#,
            params![
                id.to_string(),
                kind.as_str(),
                ciphertext,
                nonce,
                expires_at.map(|t| t.to_rfc3339()),
                now.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        Ok(Credential {
            id,
            kind,
            secret: secret.to_string(),
            active: true,
            expires_at,
            created_at: now,
        })
    }

    /// Return the currently usable credential of `kind`.
    ///
    /// Fails with `NotFound` when no active, unexpired credential exists,
    /// which is fatal for any job requiring that credential.
    pub fn get_active(&self, kind: CredentialKind) -> Result<Credential> {
        let row = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                r#"
                SELECT id, kind, secret, secret_nonce, expires_at, created_at
                FROM credentials
                WHERE kind = ?1 AND active = 1
                ORDER BY created_at DESC
                LIMIT 1
                "#,
                params![kind.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?
        };

        let (id, kind_str, ciphertext, nonce, expires_at, created_at) = row.ok_or_else(|| {
            SyncError::NotFound(format!("no active credential of kind {}", kind.as_str()))
        })?;

        let expires_at = expires_at.as_deref().map(parse_ts).transpose()?;
        if let Some(expiry) = expires_at {
            if expiry <= Utc::now() {
                return Err(SyncError::NotFound(format!(
                    "active credential of kind {} is expired",
                    kind.as_str()
                )));
            }
        }

        let secret = decrypt(&ciphertext, &nonce, &self.encryption_key)
            .map_err(|e| SyncError::Invariant(format!("credential decryption failed: {e}")))?;

        Ok(Credential {
            id: Uuid::parse_str(&id)
                .map_err(|e| SyncError::Invariant(format!("bad credential id in store: {e}")))?,
            kind: CredentialKind::parse(&kind_str)?,
            secret,
            active: true,
            expires_at,
            created_at: parse_ts(&created_at)?,
        })
    }

    /// Mark a credential inactive. Idempotent: invalidating an already
    /// inactive or unknown credential is a no-op.
    pub fn invalidate(&self, id: Uuid) -> Result<bool> {
        let affected = self.conn.lock().unwrap().execute(
            "UPDATE credentials SET active = 0, updated_at = ?2 WHERE id = ?1 AND active = 1",
            params![id.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;

    fn test_store() -> CredentialStore {
        CredentialStore::in_memory(&BASE64.encode([0u8; 32])).unwrap()
    }

    #[test]
    fn rotate_then_get_active() {
        let store = test_store();
        let rotated = store
            .rotate(CredentialKind::AccessToken, "tok-1", None)
            .unwrap();

        let active = store.get_active(CredentialKind::AccessToken).unwrap();
        assert_eq!(active.id, rotated.id);
        assert_eq!(active.secret, "tok-1");
        assert!(active.active);
    }

    #[test]
    fn get_active_with_no_credential_is_not_found() {
        let store = test_store();
        let err = store.get_active(CredentialKind::AccessToken).unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn rotate_deactivates_prior_credential() {
        let store = test_store();
        let first = store
            .rotate(CredentialKind::AccessToken, "tok-1", None)
            .unwrap();
        let second = store
            .rotate(CredentialKind::AccessToken, "tok-2", None)
            .unwrap();

        let active = store.get_active(CredentialKind::AccessToken).unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(active.secret, "tok-2");
        assert_ne!(active.id, first.id);
    }

    #[test]
    fn expired_credential_is_never_returned() {
        let store = test_store();
        store
            .rotate(
                CredentialKind::AccessToken,
                "tok-1",
                Some(Utc::now() - Duration::minutes(1)),
            )
            .unwrap();

        let err = store.get_active(CredentialKind::AccessToken).unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn invalidate_is_immediately_visible() {
        let store = test_store();
        let cred = store
            .rotate(CredentialKind::AccessToken, "tok-1", None)
            .unwrap();

        assert!(store.invalidate(cred.id).unwrap());
        let err = store.get_active(CredentialKind::AccessToken).unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn invalidate_is_idempotent() {
        let store = test_store();
        let cred = store
            .rotate(CredentialKind::AccessToken, "tok-1", None)
            .unwrap();

        assert!(store.invalidate(cred.id).unwrap());
        // Second call is a no-op, not an error
        assert!(!store.invalidate(cred.id).unwrap());
        // Unknown id is a no-op as well
        assert!(!store.invalidate(Uuid::new_v4()).unwrap());
    }

    #[test]
    fn secrets_are_encrypted_at_rest() {
        let store = test_store();
        store
            .rotate(CredentialKind::AccessToken, "plaintext-secret", None)
            .unwrap();

        let stored: String = store
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT secret FROM credentials", [], |row| row.get(0))
            .unwrap();
        assert_ne!(stored, "plaintext-secret");
    }
}
