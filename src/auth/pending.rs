//! Authorization flows waiting for their callback, keyed by `state`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::sync::RwLock;

use crate::scopes::ScopeSelection;

const STATE_LEN: usize = 32;

/// A started authorization.
#[derive(Debug, Clone)]
pub struct PendingAuth {
    /// User id minted for this flow.
    pub user_id: String,
    pub selection: ScopeSelection,
    created_at: Instant,
}

/// In-memory store of pending authorizations. Each state can be taken once
/// and expires after `ttl`.
pub struct PendingAuthStore {
    ttl: Duration,
    entries: RwLock<HashMap<String, PendingAuth>>,
}

impl PendingAuthStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record a new flow and return its state token.
    pub async fn insert(&self, user_id: impl Into<String>, selection: ScopeSelection) -> String {
        let state = generate_state();
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, p| p.created_at.elapsed() < ttl);
        entries.insert(
            state.clone(),
            PendingAuth {
                user_id: user_id.into(),
                selection,
                created_at: Instant::now(),
            },
        );
        state
    }

    /// Remove and return the flow for `state`, unless it expired.
    pub async fn take(&self, state: &str) -> Option<PendingAuth> {
        let pending = self.entries.write().await.remove(state)?;
        (pending.created_at.elapsed() < self.ttl).then_some(pending)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn generate_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(STATE_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_is_taken_once() {
        let store = PendingAuthStore::new(Duration::from_secs(60));
        let selection = ScopeSelection::parse(["drive"]).unwrap();
        let state = store.insert("u1", selection.clone()).await;
        assert_eq!(state.len(), STATE_LEN);

        let pending = store.take(&state).await.unwrap();
        assert_eq!(pending.user_id, "u1");
        assert_eq!(pending.selection, selection);
        assert!(store.take(&state).await.is_none());
    }

    #[tokio::test]
    async fn expired_state_is_rejected_and_purged() {
        let store = PendingAuthStore::new(Duration::from_millis(20));
        let stale = store.insert("u1", ScopeSelection::default()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.take(&stale).await.is_none());

        store.insert("u2", ScopeSelection::default()).await;
        let _old = store.insert("u3", ScopeSelection::default()).await;
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn unknown_state_is_none() {
        let store = PendingAuthStore::new(Duration::from_secs(60));
        assert!(store.take("nope").await.is_none());
    }
}
