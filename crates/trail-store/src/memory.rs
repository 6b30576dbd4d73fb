//! In-memory version store (process lifetime only).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use trail_types::{
    check_new_version, ItemKey, NewVersion, StoreError, TransactionId, Version, VersionId,
    VersionListOptions, VersionStore, VersionTransaction,
};

#[derive(Default)]
struct Tables {
    /// id -> version.
    versions: BTreeMap<VersionId, Version>,
    /// item -> version ids in insertion order.
    by_item: HashMap<ItemKey, Vec<VersionId>>,
    /// transaction -> version ids in insertion order.
    by_transaction: HashMap<TransactionId, Vec<VersionId>>,
}

impl Tables {
    fn insert(&mut self, version: Version) -> Result<(), StoreError> {
        if self.versions.contains_key(&version.id) {
            return Err(StoreError::Constraint(format!(
                "duplicate version id: {}",
                version.id
            )));
        }
        self.by_item
            .entry(version.item_key())
            .or_default()
            .push(version.id);
        self.by_transaction
            .entry(version.transaction_id)
            .or_default()
            .push(version.id);
        self.versions.insert(version.id, version);
        Ok(())
    }

    fn collect(&self, ids: Option<&Vec<VersionId>>) -> Vec<Version> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.versions.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }
}

/// In-memory implementation of VersionStore.
/// Ids come from a shared counter at append time, so rolled-back transactions leave gaps.
pub struct InMemoryVersionStore {
    tables: Arc<RwLock<Tables>>,
    next_id: Arc<AtomicU64>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Number of committed versions.
    pub async fn len(&self) -> usize {
        self.tables.read().await.versions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryVersionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VersionStore for InMemoryVersionStore {
    async fn begin(&self) -> Result<Box<dyn VersionTransaction>, StoreError> {
        Ok(Box::new(InMemoryTransaction {
            id: TransactionId::new(),
            tables: Arc::clone(&self.tables),
            next_id: Arc::clone(&self.next_id),
            staged: Vec::new(),
        }))
    }

    async fn query(&self, key: &ItemKey) -> Result<Vec<Version>, StoreError> {
        let guard = self.tables.read().await;
        let mut out = guard.collect(guard.by_item.get(key));
        out.sort_by_key(Version::order_key);
        Ok(out)
    }

    async fn most_recent_before(
        &self,
        key: &ItemKey,
        at: DateTime<Utc>,
    ) -> Result<Option<Version>, StoreError> {
        let guard = self.tables.read().await;
        Ok(guard
            .collect(guard.by_item.get(key))
            .into_iter()
            .filter(|v| v.created_at <= at)
            .max_by_key(Version::order_key)
            .filter(|v| !v.is_terminal()))
    }

    async fn get(&self, id: VersionId) -> Result<Option<Version>, StoreError> {
        Ok(self.tables.read().await.versions.get(&id).cloned())
    }

    async fn query_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<Version>, StoreError> {
        let guard = self.tables.read().await;
        Ok(guard.collect(guard.by_transaction.get(&transaction_id)))
    }

    async fn list(&self, opts: &VersionListOptions) -> Result<Vec<Version>, StoreError> {
        let guard = self.tables.read().await;
        let mut out: Vec<Version> = guard
            .versions
            .values()
            .filter(|v| opts.matches(v))
            .cloned()
            .collect();
        out.sort_by_key(|v| std::cmp::Reverse(v.order_key()));
        let offset = opts.offset.unwrap_or(0) as usize;
        let limit = opts.limit.unwrap_or(100) as usize;
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }
}

struct InMemoryTransaction {
    id: TransactionId,
    tables: Arc<RwLock<Tables>>,
    next_id: Arc<AtomicU64>,
    staged: Vec<Version>,
}

#[async_trait]
impl VersionTransaction for InMemoryTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    async fn append(&mut self, version: NewVersion) -> Result<Version, StoreError> {
        check_new_version(&version)?;
        let id = VersionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let version = Version::from_new(id, self.id, version);
        self.staged.push(version.clone());
        Ok(version)
    }

    fn staged(&self) -> &[Version] {
        &self.staged
    }

    async fn commit(self: Box<Self>) -> Result<Vec<Version>, StoreError> {
        let this = *self;
        {
            let mut guard = this.tables.write().await;
            // Validate the whole batch first so a failure publishes nothing.
            for v in &this.staged {
                if guard.versions.contains_key(&v.id) {
                    return Err(StoreError::Constraint(format!(
                        "duplicate version id: {}",
                        v.id
                    )));
                }
            }
            for v in &this.staged {
                guard.insert(v.clone())?;
            }
        }
        tracing::debug!(
            transaction_id = %this.id,
            count = this.staged.len(),
            "versions committed"
        );
        Ok(this.staged)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        tracing::debug!(
            transaction_id = %self.id,
            discarded = self.staged.len(),
            "version transaction rolled back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use trail_types::{Change, Changeset, Event};

    fn new_version(item_id: &str, event: Event, at: DateTime<Utc>) -> NewVersion {
        let mut changeset = Changeset::new();
        changeset.insert(
            "name".to_string(),
            Change(None, Some(serde_json::json!(item_id))),
        );
        NewVersion {
            item_type: "Widget".to_string(),
            item_id: item_id.to_string(),
            event,
            changeset,
            object: (event == Event::Destroy).then(Default::default),
            actor: None,
            metadata: None,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn staged_rows_are_invisible_until_commit() {
        let store = InMemoryVersionStore::new();
        let key = ItemKey::new("Widget", "1");
        let mut tx = store.begin().await.unwrap();
        tx.append(new_version("1", Event::Create, Utc::now()))
            .await
            .unwrap();
        assert_eq!(tx.staged().len(), 1);
        assert!(store.query(&key).await.unwrap().is_empty());
        tx.commit().await.unwrap();
        assert_eq!(store.query(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rollback_and_drop_discard_rows() {
        let store = InMemoryVersionStore::new();
        let key = ItemKey::new("Widget", "1");

        let mut tx = store.begin().await.unwrap();
        tx.append(new_version("1", Event::Create, Utc::now()))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.append(new_version("1", Event::Create, Utc::now()))
                .await
                .unwrap();
        }

        assert!(store.query(&key).await.unwrap().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn equal_timestamps_are_ordered_by_insertion() {
        let store = InMemoryVersionStore::new();
        let key = ItemKey::new("Widget", "1");
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let earlier = at - chrono::Duration::seconds(1);

        let mut tx = store.begin().await.unwrap();
        let a = tx.append(new_version("1", Event::Update, at)).await.unwrap();
        let b = tx.append(new_version("1", Event::Update, at)).await.unwrap();
        let c = tx
            .append(new_version("1", Event::Create, earlier))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        for _ in 0..3 {
            let ids: Vec<VersionId> = store
                .query(&key)
                .await
                .unwrap()
                .iter()
                .map(|v| v.id)
                .collect();
            assert_eq!(ids, vec![c.id, a.id, b.id]);
        }
    }

    #[tokio::test]
    async fn most_recent_before_excludes_terminal_destroy() {
        let store = InMemoryVersionStore::new();
        let key = ItemKey::new("Widget", "1");
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::hours(1);

        let mut tx = store.begin().await.unwrap();
        let created = tx.append(new_version("1", Event::Create, t0)).await.unwrap();
        tx.append(new_version("1", Event::Destroy, t1)).await.unwrap();
        tx.commit().await.unwrap();

        let before_create = t0 - chrono::Duration::seconds(1);
        assert!(store
            .most_recent_before(&key, before_create)
            .await
            .unwrap()
            .is_none());
        let mid = t0 + chrono::Duration::minutes(30);
        assert_eq!(
            store.most_recent_before(&key, mid).await.unwrap().map(|v| v.id),
            Some(created.id)
        );
        assert!(store.most_recent_before(&key, t1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_item_id_is_a_constraint_violation() {
        let store = InMemoryVersionStore::new();
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .append(new_version("", Event::Create, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn transaction_rows_are_grouped_and_listed_newest_first() {
        let store = InMemoryVersionStore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let mut tx = store.begin().await.unwrap();
        let tx_id = tx.id();
        tx.append(new_version("1", Event::Create, t0)).await.unwrap();
        tx.append(new_version("2", Event::Create, t0 + chrono::Duration::seconds(5)))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.query_transaction(tx_id).await.unwrap().len(), 2);

        let listed = store
            .list(&VersionListOptions {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].item_id, "2");
    }
}
