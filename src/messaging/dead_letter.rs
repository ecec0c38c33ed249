//! # Dead Letter Set
//!
//! Messages whose delivery attempts were exhausted. Entries are persisted to the
//! `dead_letters` collection and stay there until an operator requeues or purges
//! them; nothing is dropped automatically.

use super::message::{Message, MessageId};
use crate::constants::collections;
use crate::store::{DocumentFilter, DocumentStore, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    /// Last transient error before giving up
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
    /// How many times an operator has already requeued this message
    pub requeue_count: u32,
}

#[derive(Clone)]
pub struct DeadLetterStore {
    store: Arc<dyn DocumentStore>,
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore").finish_non_exhaustive()
    }
}

impl DeadLetterStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn park(&self, entry: &DeadLetter) -> StoreResult<()> {
        let body = serde_json::to_value(entry)?;
        self.store
            .upsert(collections::DEAD_LETTERS, &entry.message.id.to_string(), body)
            .await?;
        Ok(())
    }

    /// All dead letters, oldest first
    pub async fn list(&self) -> StoreResult<Vec<DeadLetter>> {
        let documents = self
            .store
            .select(collections::DEAD_LETTERS, &DocumentFilter::new())
            .await?;
        let mut entries = documents
            .iter()
            .map(|d| d.decode::<DeadLetter>())
            .collect::<StoreResult<Vec<_>>>()?;
        entries.sort_by_key(|e| e.dead_lettered_at);
        Ok(entries)
    }

    pub async fn get(&self, id: MessageId) -> StoreResult<Option<DeadLetter>> {
        match self
            .store
            .get(collections::DEAD_LETTERS, &id.to_string())
            .await?
        {
            Some(document) => Ok(Some(document.decode()?)),
            None => Ok(None),
        }
    }

    /// Remove an entry, returning whether it existed
    pub async fn remove(&self, id: MessageId) -> StoreResult<bool> {
        let removed = self
            .store
            .delete(collections::DEAD_LETTERS, &id.to_string())
            .await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::{MessageSource, SendOptions};
    use crate::store::InMemoryDocumentStore;
    use serde_json::json;

    fn dead_letter(at: DateTime<Utc>) -> DeadLetter {
        DeadLetter {
            message: Message::new(
                MessageSource::module("Billing"),
                "Permits",
                "fee_assessed",
                json!({"amount": 10}),
                &SendOptions::default(),
                at,
            ),
            reason: "handler unavailable".to_string(),
            dead_lettered_at: at,
            requeue_count: 0,
        }
    }

    #[tokio::test]
    async fn test_park_list_remove() {
        let letters = DeadLetterStore::new(Arc::new(InMemoryDocumentStore::new()));
        let later = dead_letter(Utc::now());
        let earlier = dead_letter(Utc::now() - chrono::Duration::minutes(5));
        letters.park(&later).await.unwrap();
        letters.park(&earlier).await.unwrap();

        let listed = letters.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].message.id, earlier.message.id);

        assert!(letters.get(later.message.id).await.unwrap().is_some());
        assert!(letters.remove(later.message.id).await.unwrap());
        assert!(!letters.remove(later.message.id).await.unwrap());
        assert_eq!(letters.list().await.unwrap().len(), 1);
    }
}
