use crate::error::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Metadata row for one stored artifact. Created exactly once per successful
/// store, never mutated afterward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub user: String,
    /// Unique per user and strictly increasing. Allocation order reflects
    /// completion order of storing, not request arrival.
    pub sequence: u64,
    pub storage_key: String,
    pub prompt_excerpt: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an insert attempt against the (user, sequence) uniqueness
/// constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another request won the race for this sequence number.
    DuplicateSequence,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new record, enforcing uniqueness of (user, sequence).
    async fn insert(&self, record: ImageRecord) -> Result<InsertOutcome, Error>;
    async fn get(&self, user: &str, sequence: u64) -> Result<Option<ImageRecord>, Error>;
    /// All of `user`'s records, ordered by sequence ascending.
    async fn list(&self, user: &str) -> Result<Vec<ImageRecord>, Error>;
    /// Highest sequence ever visible for `user`; 0 if they have none.
    async fn max_sequence(&self, user: &str) -> Result<u64, Error>;
    /// Drop every record. Used by the retention sweep's cascade.
    async fn clear(&self) -> Result<(), Error>;
    async fn count_all(&self) -> Result<u64, Error>;
    async fn count_users(&self) -> Result<u64, Error>;
    async fn count_since(&self, since: DateTime<Utc>) -> Result<u64, Error>;
}

/// Process-local metadata store. The single mutex makes the uniqueness check
/// and insert one atomic step; rows per user live in a BTreeMap so listing is
/// naturally sequence-ordered.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    rows: Mutex<HashMap<String, BTreeMap<u64, ImageRecord>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn insert(&self, record: ImageRecord) -> Result<InsertOutcome, Error> {
        let mut rows = self.rows.lock().await;
        let user_rows = rows.entry(record.user.clone()).or_default();
        if user_rows.contains_key(&record.sequence) {
            return Ok(InsertOutcome::DuplicateSequence);
        }
        user_rows.insert(record.sequence, record);
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, user: &str, sequence: u64) -> Result<Option<ImageRecord>, Error> {
        let rows = self.rows.lock().await;
        Ok(rows.get(user).and_then(|r| r.get(&sequence)).cloned())
    }

    async fn list(&self, user: &str) -> Result<Vec<ImageRecord>, Error> {
        let rows = self.rows.lock().await;
        Ok(rows
            .get(user)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn max_sequence(&self, user: &str) -> Result<u64, Error> {
        let rows = self.rows.lock().await;
        Ok(rows
            .get(user)
            .and_then(|r| r.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn clear(&self) -> Result<(), Error> {
        self.rows.lock().await.clear();
        Ok(())
    }

    async fn count_all(&self) -> Result<u64, Error> {
        let rows = self.rows.lock().await;
        Ok(rows.values().map(|r| r.len() as u64).sum())
    }

    async fn count_users(&self) -> Result<u64, Error> {
        let rows = self.rows.lock().await;
        Ok(rows.values().filter(|r| !r.is_empty()).count() as u64)
    }

    async fn count_since(&self, since: DateTime<Utc>) -> Result<u64, Error> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .flat_map(|r| r.values())
            .filter(|record| record.created_at >= since)
            .count() as u64)
    }
}

/// Hands out per-user sequence numbers by optimistic insert: propose
/// max + 1, let the store's uniqueness constraint arbitrate, and retry with
/// the next value on conflict. The read-max-then-add-one value is only ever a
/// candidate, never trusted on its own.
#[derive(Clone)]
pub struct SequenceAllocator {
    metadata: Arc<dyn MetadataStore>,
}

/// Conflicts only happen when the same user races against themselves. The
/// bound covers any realistic same-user burst before declaring pathological
/// contention.
pub const MAX_SEQUENCE_ATTEMPTS: usize = 16;

impl SequenceAllocator {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    /// Smallest integer greater than every sequence currently visible for
    /// `user`. Must be confirmed by `commit` before it means anything.
    pub async fn next_candidate(&self, user: &str) -> Result<u64, Error> {
        Ok(self.metadata.max_sequence(user).await? + 1)
    }

    /// Attempt to make a candidate real by inserting its record.
    pub async fn commit(&self, record: ImageRecord) -> Result<InsertOutcome, Error> {
        self.metadata.insert(record).await
    }
}

/// Prefix of `prompt` truncated to `max_chars` characters, safe on multibyte
/// boundaries.
pub fn prompt_excerpt(prompt: &str, max_chars: usize) -> String {
    prompt.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    fn record(user: &str, sequence: u64) -> ImageRecord {
        ImageRecord {
            user: user.to_string(),
            sequence,
            storage_key: format!("artifacts/{user}/{sequence}"),
            prompt_excerpt: "a majestic dragon".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_sequence_is_rejected() {
        let store = InMemoryMetadataStore::new();
        assert_eq!(
            store.insert(record("u1", 1)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert(record("u1", 1)).await.unwrap(),
            InsertOutcome::DuplicateSequence
        );
        // A different user is free to use the same number.
        assert_eq!(
            store.insert(record("u2", 1)).await.unwrap(),
            InsertOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn test_list_is_sequence_ordered() {
        let store = InMemoryMetadataStore::new();
        for seq in [3, 1, 2] {
            store.insert(record("u1", seq)).await.unwrap();
        }
        let listed = store.list("u1").await.unwrap();
        let sequences: Vec<u64> = listed.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_max_sequence_tracks_highest() {
        let store = InMemoryMetadataStore::new();
        assert_eq!(store.max_sequence("u1").await.unwrap(), 0);
        store.insert(record("u1", 1)).await.unwrap();
        store.insert(record("u1", 5)).await.unwrap();
        assert_eq!(store.max_sequence("u1").await.unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocation_never_duplicates() {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let allocator = SequenceAllocator::new(Arc::clone(&store));

        let tasks = (0..32).map(|_| {
            let allocator = allocator.clone();
            tokio::spawn(async move {
                loop {
                    let candidate = allocator.next_candidate("u1").await.unwrap();
                    match allocator.commit(record("u1", candidate)).await.unwrap() {
                        InsertOutcome::Inserted => return candidate,
                        InsertOutcome::DuplicateSequence => continue,
                    }
                }
            })
        });

        let mut allocated: Vec<u64> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        allocated.sort_unstable();
        assert_eq!(allocated, (1..=32).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_clear_and_counts() {
        let store = InMemoryMetadataStore::new();
        store.insert(record("u1", 1)).await.unwrap();
        store.insert(record("u1", 2)).await.unwrap();
        store.insert(record("u2", 1)).await.unwrap();

        assert_eq!(store.count_all().await.unwrap(), 3);
        assert_eq!(store.count_users().await.unwrap(), 2);

        store.clear().await.unwrap();
        assert_eq!(store.count_all().await.unwrap(), 0);
        assert_eq!(store.list("u1").await.unwrap(), vec![]);
    }

    #[tokio::test]
    async fn test_count_since_filters_by_timestamp() {
        let store = InMemoryMetadataStore::new();
        let mut old = record("u1", 1);
        old.created_at = Utc::now() - chrono::Duration::days(2);
        store.insert(old).await.unwrap();
        store.insert(record("u1", 2)).await.unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.count_since(since).await.unwrap(), 1);
    }

    #[test]
    fn test_prompt_excerpt_truncates_on_char_boundary() {
        assert_eq!(prompt_excerpt("a majestic dragon", 9), "a majesti");
        assert_eq!(prompt_excerpt("short", 80), "short");
        assert_eq!(prompt_excerpt("héllo wörld", 4), "héll");
    }
}
