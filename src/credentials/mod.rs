//! Account session store
//!
//! Holds every bookable identity (session cookie, optional bearer token,
//! expiry) in one JSON file, optionally encrypted at rest with a
//! passphrase-derived key. The store exclusively owns the sessions; every
//! other component works on read-only snapshots and funnels mutations back
//! through here.
//!
//! Writes are atomic (temp file + rename) so a job process reading the file
//! concurrently never observes a torn document.

pub mod keepalive;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::utils::error::BookingError;

/// One bookable identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSession {
    pub nickname: String,
    pub username: String,

    /// Opaque cookie line (`JSESSIONID=...; ...`); expires server-side
    pub session_cookie: Option<String>,

    /// Optional bearer token
    pub token: Option<String>,

    /// Stored password for re-authentication (optional, discouraged)
    pub password: Option<String>,

    pub expires_at: Option<DateTime<Utc>>,

    /// False once the platform has rejected this session; retained so the
    /// operator can see which accounts need a fresh login
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

impl AccountSession {
    pub fn new(nickname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            username: username.into(),
            session_cookie: None,
            token: None,
            password: None,
            expires_at: None,
            valid: true,
        }
    }

    /// Whether the session has credentials at all
    pub fn has_credentials(&self) -> bool {
        self.session_cookie.is_some() || self.token.is_some()
    }

    /// An expired session must not be offered for submission; only the
    /// keep-alive refresher revalidates it.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }

    /// Usable for an outbound request right now
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.valid && self.has_credentials() && !self.is_expired(now)
    }
}

/// At-rest cipher for the credential file.
///
/// AES-256-GCM with a SHA-256 passphrase-derived key; the serialized form
/// is base64(nonce || ciphertext).
struct StoreCipher {
    cipher: Aes256Gcm,
}

impl StoreCipher {
    fn new(passphrase: &str) -> Self {
        let key = Sha256::digest(passphrase.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key).expect("SHA-256 digest is a valid AES-256 key");
        Self { cipher }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<String, BookingError> {
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| BookingError::Store(format!("encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, BookingError> {
        let combined = BASE64
            .decode(encoded.trim())
            .map_err(|e| BookingError::Store(format!("base64 decode failed: {e}")))?;
        if combined.len() < 13 {
            return Err(BookingError::Store("encrypted file too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| BookingError::Store(format!("decryption failed (wrong passphrase?): {e}")))
    }
}

/// File-backed store of account sessions, keyed by username
pub struct CredentialStore {
    path: PathBuf,
    cipher: Option<StoreCipher>,
    accounts: BTreeMap<String, AccountSession>,
}

impl CredentialStore {
    /// Open (or initialize) the store at `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - credential file location
    /// * `passphrase` - at-rest encryption passphrase; `None` stores plaintext
    pub fn open(path: impl Into<PathBuf>, passphrase: Option<&str>) -> Result<Self, BookingError> {
        let mut store = Self {
            path: path.into(),
            cipher: passphrase.map(StoreCipher::new),
            accounts: BTreeMap::new(),
        };
        store.reload()?;
        Ok(store)
    }

    /// Re-read the file, discarding in-memory state
    pub fn reload(&mut self) -> Result<(), BookingError> {
        if !self.path.exists() {
            self.accounts.clear();
            return Ok(());
        }

        let raw = std::fs::read(&self.path)
            .map_err(|e| BookingError::Store(format!("read {}: {e}", self.path.display())))?;
        let bytes = match &self.cipher {
            Some(cipher) => cipher.decrypt(&String::from_utf8_lossy(&raw))?,
            None => raw,
        };

        self.accounts = serde_json::from_slice(&bytes)
            .map_err(|e| BookingError::Store(format!("credential file is corrupt: {e}")))?;
        Ok(())
    }

    /// Persist atomically: write a temp file next to the target, then rename
    fn persist(&self) -> Result<(), BookingError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BookingError::Store(format!("create {}: {e}", parent.display())))?;
        }

        let json = serde_json::to_vec_pretty(&self.accounts)
            .map_err(|e| BookingError::Store(format!("serialize credentials: {e}")))?;
        let bytes = match &self.cipher {
            Some(cipher) => cipher.encrypt(&json)?.into_bytes(),
            None => json,
        };

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)
            .map_err(|e| BookingError::Store(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| BookingError::Store(format!("rename {}: {e}", self.path.display())))?;
        Ok(())
    }

    /// Insert or replace a session, persisting immediately
    pub fn upsert(&mut self, session: AccountSession) -> Result<(), BookingError> {
        self.accounts.insert(session.username.clone(), session);
        self.persist()
    }

    /// Remove a session by username or nickname
    pub fn remove(&mut self, identifier: &str) -> Result<bool, BookingError> {
        let key = self
            .accounts
            .values()
            .find(|a| a.username == identifier || a.nickname == identifier)
            .map(|a| a.username.clone());
        match key {
            Some(key) => {
                self.accounts.remove(&key);
                self.persist()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Refresh a session's cookie and push its expiry forward
    pub fn refresh_cookie(
        &mut self,
        username: &str,
        cookie: String,
        lifetime: Duration,
    ) -> Result<(), BookingError> {
        let session = self
            .accounts
            .get_mut(username)
            .ok_or_else(|| BookingError::Store(format!("unknown account {username}")))?;
        session.session_cookie = Some(cookie);
        session.expires_at = Some(Utc::now() + lifetime);
        session.valid = true;
        self.persist()
    }

    /// Flag a session as rejected by the platform; the record is retained
    pub fn invalidate(&mut self, username: &str) -> Result<(), BookingError> {
        if let Some(session) = self.accounts.get_mut(username) {
            session.valid = false;
            self.persist()?;
        }
        Ok(())
    }

    /// Read-only snapshot of every stored session
    pub fn snapshots(&self) -> Vec<AccountSession> {
        self.accounts.values().cloned().collect()
    }

    /// Sessions usable for submission right now
    pub fn usable(&self) -> Vec<AccountSession> {
        let now = Utc::now();
        self.accounts
            .values()
            .filter(|a| a.is_usable(now))
            .cloned()
            .collect()
    }

    /// Resolve a target-account list: nicknames select specific sessions,
    /// an empty list means every usable session.
    pub fn select(&self, nicknames: &[String]) -> Vec<AccountSession> {
        let usable = self.usable();
        if nicknames.is_empty() {
            return usable;
        }
        usable
            .into_iter()
            .filter(|a| nicknames.iter().any(|n| *n == a.nickname || *n == a.username))
            .collect()
    }

    pub fn get(&self, identifier: &str) -> Option<&AccountSession> {
        self.accounts
            .values()
            .find(|a| a.username == identifier || a.nickname == identifier)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session(nickname: &str) -> AccountSession {
        let mut s = AccountSession::new(nickname, format!("{nickname}@example.com"));
        s.session_cookie = Some(format!("JSESSIONID={nickname}"));
        s.expires_at = Some(Utc::now() + Duration::hours(4));
        s
    }

    #[test]
    fn test_round_trip_plaintext() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");

        let mut store = CredentialStore::open(&path, None).unwrap();
        store.upsert(session("alice")).unwrap();
        store.upsert(session("bob")).unwrap();

        let reopened = CredentialStore::open(&path, None).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("alice").unwrap().nickname, "alice");
    }

    #[test]
    fn test_round_trip_encrypted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");

        let mut store = CredentialStore::open(&path, Some("hunter2")).unwrap();
        store.upsert(session("alice")).unwrap();

        // File on disk is not plaintext JSON
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("alice"));

        let reopened = CredentialStore::open(&path, Some("hunter2")).unwrap();
        assert_eq!(reopened.get("alice").unwrap().nickname, "alice");

        // Wrong passphrase fails closed
        assert!(CredentialStore::open(&path, Some("wrong")).is_err());
    }

    #[test]
    fn test_expired_session_not_usable() {
        let mut s = session("alice");
        s.expires_at = Some(Utc::now() - Duration::minutes(1));
        assert!(s.is_expired(Utc::now()));
        assert!(!s.is_usable(Utc::now()));

        let dir = TempDir::new().unwrap();
        let mut store = CredentialStore::open(dir.path().join("c.json"), None).unwrap();
        store.upsert(s).unwrap();
        store.upsert(session("bob")).unwrap();
        let usable = store.usable();
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].nickname, "bob");
    }

    #[test]
    fn test_invalidate_retains_record() {
        let dir = TempDir::new().unwrap();
        let mut store = CredentialStore::open(dir.path().join("c.json"), None).unwrap();
        store.upsert(session("alice")).unwrap();

        store.invalidate("alice@example.com").unwrap();
        assert_eq!(store.len(), 1);
        assert!(!store.get("alice").unwrap().valid);
        assert!(store.usable().is_empty());
    }

    #[test]
    fn test_refresh_cookie_revalidates() {
        let dir = TempDir::new().unwrap();
        let mut store = CredentialStore::open(dir.path().join("c.json"), None).unwrap();
        store.upsert(session("alice")).unwrap();
        store.invalidate("alice@example.com").unwrap();

        store
            .refresh_cookie(
                "alice@example.com",
                "JSESSIONID=fresh".into(),
                Duration::hours(1),
            )
            .unwrap();
        let alice = store.get("alice").unwrap();
        assert!(alice.valid);
        assert_eq!(alice.session_cookie.as_deref(), Some("JSESSIONID=fresh"));
    }

    #[test]
    fn test_select_by_nickname() {
        let dir = TempDir::new().unwrap();
        let mut store = CredentialStore::open(dir.path().join("c.json"), None).unwrap();
        store.upsert(session("alice")).unwrap();
        store.upsert(session("bob")).unwrap();

        let picked = store.select(&["bob".to_string()]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].nickname, "bob");

        // Empty selection means all usable accounts
        assert_eq!(store.select(&[]).len(), 2);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        let mut store = CredentialStore::open(&path, None).unwrap();
        store.upsert(session("alice")).unwrap();
        assert!(!path.with_extension("tmp").exists());
    }
}
