//! Credential lookup contract and an in-memory implementation.

use crate::types::Credential;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("credential {id} has a malformed reference encoding ({bytes} bytes)")]
    MalformedEncoding { id: i64, bytes: usize },
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    #[error("stored timestamp {0} is out of range")]
    InvalidTimestamp(i64),
    #[error("credential {0} not found")]
    NotFound(i64),
}

/// Resolves a presented QR token to its credential.
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` means the token is unknown.
    fn lookup(&self, qr_token: &str) -> Result<Option<Credential>, StoreError>;
}

/// Credential store held in memory, keyed by token.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    credentials: RwLock<HashMap<String, Credential>>,
    lookups: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the credential for its token.
    pub fn insert(&self, credential: Credential) {
        if let Ok(mut map) = self.credentials.write() {
            map.insert(credential.qr_token.clone(), credential);
        }
    }

    pub fn remove(&self, qr_token: &str) -> Option<Credential> {
        self.credentials.write().ok()?.remove(qr_token)
    }

    /// Number of lookups served so far.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Simulate an outage: every lookup fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn lookup(&self, qr_token: &str) -> Result<Option<Credential>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".into()));
        }
        let map = self
            .credentials
            .read()
            .map_err(|_| StoreError::Unavailable("credential map lock poisoned".into()))?;
        Ok(map.get(qr_token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn credential(token: &str) -> Credential {
        Credential {
            id: 7,
            full_name: "Anna Nowak".into(),
            qr_token: token.into(),
            qr_valid_until: Utc::now(),
            reference_encoding: None,
        }
    }

    #[test]
    fn test_lookup_found_and_missing() {
        let store = InMemoryCredentialStore::new();
        store.insert(credential("abc"));
        assert_eq!(store.lookup("abc").unwrap().unwrap().id, 7);
        assert!(store.lookup("nope").unwrap().is_none());
        assert_eq!(store.lookup_count(), 2);
    }

    #[test]
    fn test_replace_is_visible_immediately() {
        let store = InMemoryCredentialStore::new();
        store.insert(credential("abc"));
        let mut updated = credential("abc");
        updated.full_name = "Anna Kowalska".into();
        store.insert(updated);
        assert_eq!(store.lookup("abc").unwrap().unwrap().full_name, "Anna Kowalska");
    }

    #[test]
    fn test_unavailable() {
        let store = InMemoryCredentialStore::new();
        store.insert(credential("abc"));
        store.set_unavailable(true);
        assert!(matches!(store.lookup("abc"), Err(StoreError::Unavailable(_))));
        store.set_unavailable(false);
        assert!(store.lookup("abc").unwrap().is_some());
    }

    #[test]
    fn test_remove() {
        let store = InMemoryCredentialStore::new();
        store.insert(credential("abc"));
        assert!(store.remove("abc").is_some());
        assert!(store.lookup("abc").unwrap().is_none());
    }
}
