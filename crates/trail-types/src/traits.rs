//! Traits for trackable records and version storage backends.

use crate::{
    Attributes, Event, ItemKey, Metadata, NewVersion, TransactionId, Version, VersionId,
    VersionListOptions,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Capability a domain type implements to have its mutations versioned.
///
/// The controller only ever talks to records through this trait: identity,
/// attribute snapshot, and the optional hooks below.
pub trait Trackable: Sized + Send + Sync {
    /// Stored as `item_type` on every version of this type.
    const ITEM_TYPE: &'static str;

    /// `None` until the host assigns an identity; recording needs one.
    fn item_id(&self) -> Option<String>;

    /// Current attribute state, including the identity attribute.
    fn attributes(&self) -> Attributes;

    /// Rebuild an instance from (possibly reified) attributes.
    fn from_attributes(attrs: &Attributes) -> Result<Self, RecordError>;

    /// Declared attribute names, checked against policies at registration.
    /// Empty means undeclared.
    fn attribute_names() -> &'static [&'static str] {
        &[]
    }

    /// The record's own "last modified" timestamp, used as `created_at` for
    /// create and update versions.
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Per-record condition evaluated before every recording.
    fn should_record(&self, _event: Event) -> bool {
        true
    }

    /// Extra metadata merged over the scope metadata.
    fn version_meta(&self, _event: Event) -> Metadata {
        Metadata::new()
    }
}

/// Durable, append-only log of versions.
///
/// Contract: `query` returns versions of one item ordered by `(created_at, id)`;
/// rows appended through a transaction are invisible until `commit`.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Start a unit of work; appended rows are staged until commit.
    async fn begin(&self) -> Result<Box<dyn VersionTransaction>, StoreError>;

    /// All versions of one item, ascending.
    async fn query(&self, key: &ItemKey) -> Result<Vec<Version>, StoreError>;

    /// Latest version with `created_at <= at`. `None` when the item did not exist
    /// yet, or when that latest version is its destroy.
    async fn most_recent_before(
        &self,
        key: &ItemKey,
        at: DateTime<Utc>,
    ) -> Result<Option<Version>, StoreError> {
        let versions = self.query(key).await?;
        Ok(versions
            .into_iter()
            .filter(|v| v.created_at <= at)
            .max_by_key(Version::order_key)
            .filter(|v| !v.is_terminal()))
    }

    /// One version by id.
    async fn get(&self, id: VersionId) -> Result<Option<Version>, StoreError>;

    /// Every version committed by one unit of work, in insertion order.
    async fn query_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<Version>, StoreError>;

    /// Versions across items, newest first, filtered and paginated.
    async fn list(&self, opts: &VersionListOptions) -> Result<Vec<Version>, StoreError>;
}

/// Staged writes of one unit of work. Dropping without `commit` discards them.
#[async_trait]
pub trait VersionTransaction: Send {
    fn id(&self) -> TransactionId;

    /// Stage one row; returns it with its assigned id.
    async fn append(&mut self, version: NewVersion) -> Result<Version, StoreError>;

    /// Rows staged so far, in append order.
    fn staged(&self) -> &[Version];

    /// Publish every staged row atomically.
    async fn commit(self: Box<Self>) -> Result<Vec<Version>, StoreError>;

    /// Discard every staged row.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Reject rows that can never be valid, before they are staged.
pub fn check_new_version(version: &NewVersion) -> Result<(), StoreError> {
    if version.item_type.is_empty() {
        return Err(StoreError::Constraint("item_type must not be empty".to_string()));
    }
    if version.item_id.is_empty() {
        return Err(StoreError::Constraint("item_id must not be empty".to_string()));
    }
    if version.event == Event::Destroy && version.object.is_none() {
        return Err(StoreError::Constraint(
            "destroy version requires an object snapshot".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("version store error: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("missing attribute: {0}")]
    MissingAttribute(String),
    #[error("attribute {name}: expected {expected}")]
    TypeMismatch { name: String, expected: &'static str },
    #[error("record error: {0}")]
    Other(String),
}
