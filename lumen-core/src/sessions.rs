//! Completed generation results awaiting one-shot retrieval.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{LumenError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedImage {
    /// `data:image/png;base64,...`
    pub image: String,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSession {
    pub images: Vec<GeneratedImage>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    entries: Mutex<HashMap<Uuid, StoredSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: Uuid, session: StoredSession) {
        self.lock().insert(id, session);
    }

    /// Removes and returns the session; a second call for the same id fails.
    pub fn take(&self, id: &str) -> Result<StoredSession> {
        let not_found = || LumenError::SessionNotFound { id: id.to_string() };
        let key = Uuid::parse_str(id).map_err(|_| not_found())?;
        self.lock().remove(&key).ok_or_else(not_found)
    }

    /// Drops sessions created more than `ttl` ago, returning how many went.
    pub fn purge_older_than(&self, ttl: Duration) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let cutoff = Utc::now() - ttl;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, session| session.created_at >= cutoff);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, StoredSession>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(age: chrono::Duration) -> StoredSession {
        StoredSession {
            images: vec![GeneratedImage {
                image: "data:image/png;base64,AAAA".to_string(),
                seed: 42,
            }],
            created_at: Utc::now() - age,
        }
    }

    #[test]
    fn retrieval_is_one_shot() {
        let store = SessionStore::new();
        let id = Uuid::new_v4();
        store.put(id, session(chrono::Duration::zero()));

        let first = store.take(&id.to_string()).unwrap();
        assert_eq!(first.images[0].seed, 42);
        assert!(matches!(
            store.take(&id.to_string()),
            Err(LumenError::SessionNotFound { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn unknown_and_malformed_ids_are_not_found() {
        let store = SessionStore::new();
        assert!(store.take(&Uuid::new_v4().to_string()).is_err());
        assert!(matches!(
            store.take("../../etc/passwd"),
            Err(LumenError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn purge_drops_only_expired_sessions() {
        let store = SessionStore::new();
        let fresh = Uuid::new_v4();
        store.put(fresh, session(chrono::Duration::seconds(5)));
        store.put(Uuid::new_v4(), session(chrono::Duration::hours(2)));

        assert_eq!(store.purge_older_than(Duration::from_secs(3600)), 1);
        assert_eq!(store.len(), 1);
        assert!(store.take(&fresh.to_string()).is_ok());
    }
}
