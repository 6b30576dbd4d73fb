//! Version records: one immutable row per recorded event.

use crate::EncodedAttributes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Caller-supplied contextual fields stored alongside a version.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Kind of recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Create,
    Update,
    Destroy,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Event::Create => "create",
            Event::Update => "update",
            Event::Destroy => "destroy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Event::Create),
            "update" => Some(Event::Update),
            "destroy" => Some(Event::Destroy),
            _ => None,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a trackable record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub item_type: String,
    pub item_id: String,
}

impl ItemKey {
    pub fn new(item_type: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            item_type: item_type.into(),
            item_id: item_id.into(),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.item_type, self.item_id)
    }
}

/// Insertion sequence number; breaks ties between equal `created_at` values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VersionId(pub u64);

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared by every version appended within one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One attribute change: `[before, after]`. `None` means absent (create / destroy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change(
    pub Option<serde_json::Value>,
    pub Option<serde_json::Value>,
);

impl Change {
    pub fn before(&self) -> Option<&serde_json::Value> {
        self.0.as_ref()
    }

    pub fn after(&self) -> Option<&serde_json::Value> {
        self.1.as_ref()
    }
}

/// Attribute name -> change, encoded values.
pub type Changeset = BTreeMap<String, Change>;

/// A version row about to be appended; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub item_type: String,
    pub item_id: String,
    pub event: Event,
    pub changeset: Changeset,
    pub object: Option<EncodedAttributes>,
    pub actor: Option<String>,
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
}

/// Immutable, append-only event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub item_type: String,
    pub item_id: String,
    pub event: Event,
    #[serde(default)]
    pub changeset: Changeset,
    /// Full snapshot of the record before the event (destroy only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<EncodedAttributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub transaction_id: TransactionId,
    pub created_at: DateTime<Utc>,
}

impl Version {
    pub fn from_new(id: VersionId, transaction_id: TransactionId, new: NewVersion) -> Self {
        Self {
            id,
            item_type: new.item_type,
            item_id: new.item_id,
            event: new.event,
            changeset: new.changeset,
            object: new.object,
            actor: new.actor,
            metadata: new.metadata,
            transaction_id,
            created_at: new.created_at,
        }
    }

    pub fn item_key(&self) -> ItemKey {
        ItemKey::new(self.item_type.clone(), self.item_id.clone())
    }

    /// Sort key for the per-item ordering invariant.
    pub fn order_key(&self) -> (DateTime<Utc>, VersionId) {
        (self.created_at, self.id)
    }

    pub fn is_terminal(&self) -> bool {
        self.event == Event::Destroy
    }
}

/// Filters for listing versions across items (newest first).
#[derive(Debug, Clone, Default)]
pub struct VersionListOptions {
    pub item_type: Option<String>,
    pub actor: Option<String>,
    pub event: Option<Event>,
    /// Only versions with `created_at >= since`.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl VersionListOptions {
    pub fn matches(&self, v: &Version) -> bool {
        if let Some(ref t) = self.item_type {
            if &v.item_type != t {
                return false;
            }
        }
        if let Some(ref a) = self.actor {
            if v.actor.as_ref() != Some(a) {
                return false;
            }
        }
        if let Some(e) = self.event {
            if v.event != e {
                return false;
            }
        }
        if let Some(since) = self.since {
            if v.created_at < since {
                return false;
            }
        }
        true
    }
}
