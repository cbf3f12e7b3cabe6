use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// A time-bounded, opaque-token, read-only public alias for a session.
/// Invariant: at most one share per session.
#[derive(Debug, Clone, Serialize)]
pub struct Share {
    pub token: String,
    pub session_id: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Share {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Generate a share token: `shr_` + 32 random bytes as hex.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::fill(&mut bytes);
    format!("shr_{}", hex::encode(bytes))
}

#[async_trait]
pub trait ShareStore: Send + Sync {
    async fn insert(&self, share: Share);
    async fn get_by_token(&self, token: &str) -> Option<Share>;
    async fn get_by_session(&self, session_id: &str) -> Option<Share>;
    /// Returns true if a share existed.
    async fn delete_by_session(&self, session_id: &str) -> bool;
}

#[derive(Default)]
pub struct MemoryShareStore {
    by_token: RwLock<HashMap<String, Share>>,
}

impl MemoryShareStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShareStore for MemoryShareStore {
    async fn insert(&self, share: Share) {
        self.by_token.write().insert(share.token.clone(), share);
    }

    async fn get_by_token(&self, token: &str) -> Option<Share> {
        self.by_token.read().get(token).cloned()
    }

    async fn get_by_session(&self, session_id: &str) -> Option<Share> {
        self.by_token
            .read()
            .values()
            .find(|s| s.session_id == session_id)
            .cloned()
    }

    async fn delete_by_session(&self, session_id: &str) -> bool {
        let mut map = self.by_token.write();
        let token = map
            .values()
            .find(|s| s.session_id == session_id)
            .map(|s| s.token.clone());
        match token {
            Some(t) => {
                map.remove(&t);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share(token: &str, session: &str, ttl_secs: i64) -> Share {
        Share {
            token: token.into(),
            session_id: session.into(),
            created_by: "u1".into(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
        }
    }

    #[test]
    fn token_format() {
        let t = generate_token();
        assert!(t.starts_with("shr_"));
        assert_eq!(t.len(), 4 + 64);
        assert_ne!(t, generate_token());
    }

    #[test]
    fn expiry() {
        assert!(!share("t", "s", 60).is_expired());
        assert!(share("t", "s", -1).is_expired());
    }

    #[tokio::test]
    async fn store_roundtrip() {
        let store = MemoryShareStore::new();
        store.insert(share("tok1", "s1", 60)).await;

        assert_eq!(store.get_by_token("tok1").await.unwrap().session_id, "s1");
        assert_eq!(store.get_by_session("s1").await.unwrap().token, "tok1");
        assert!(store.get_by_token("nope").await.is_none());

        assert!(store.delete_by_session("s1").await);
        assert!(!store.delete_by_session("s1").await);
        assert!(store.get_by_token("tok1").await.is_none());
    }
}
