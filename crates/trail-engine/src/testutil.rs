use crate::Trail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use trail_store::InMemoryVersionStore;
use trail_types::{
    Attributes, ItemKey, NewVersion, RecordError, StoreError, Trackable, TransactionId, Value,
    Version, VersionId, VersionListOptions, VersionStore, VersionTransaction,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Widget {
    pub id: Option<i64>,
    pub name: String,
    pub color: Option<String>,
    pub ratio: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Widget {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id: Some(id),
            name: name.to_string(),
            color: None,
            ratio: 1.0,
            updated_at: None,
        }
    }
}

impl Trackable for Widget {
    const ITEM_TYPE: &'static str = "Widget";

    fn item_id(&self) -> Option<String> {
        self.id.map(|id| id.to_string())
    }

    fn attributes(&self) -> Attributes {
        let mut a = Attributes::new();
        a.insert("id".to_string(), self.id.into());
        a.insert("name".to_string(), self.name.clone().into());
        a.insert("color".to_string(), self.color.clone().into());
        a.insert("ratio".to_string(), self.ratio.into());
        a
    }

    fn from_attributes(attrs: &Attributes) -> Result<Self, RecordError> {
        let name = attrs
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RecordError::MissingAttribute("name".to_string()))?;
        let ratio = match attrs.get("ratio") {
            Some(Value::Float(f)) => *f,
            _ => 1.0,
        };
        Ok(Self {
            id: attrs.get("id").and_then(Value::as_i64),
            name: name.to_string(),
            color: attrs.get("color").and_then(Value::as_str).map(str::to_string),
            ratio,
            updated_at: None,
        })
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn attribute_names() -> &'static [&'static str] {
        &["id", "name", "color", "ratio"]
    }
}

/// Child of a [`Widget`] through `widget_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub id: i64,
    pub widget_id: Option<i64>,
    pub label: String,
}

impl Trackable for Part {
    const ITEM_TYPE: &'static str = "Part";

    fn item_id(&self) -> Option<String> {
        Some(self.id.to_string())
    }

    fn attributes(&self) -> Attributes {
        let mut a = Attributes::new();
        a.insert("id".to_string(), self.id.into());
        a.insert("widget_id".to_string(), self.widget_id.into());
        a.insert("label".to_string(), self.label.clone().into());
        a
    }

    fn from_attributes(attrs: &Attributes) -> Result<Self, RecordError> {
        Ok(Self {
            id: attrs
                .get("id")
                .and_then(Value::as_i64)
                .ok_or_else(|| RecordError::MissingAttribute("id".to_string()))?,
            widget_id: attrs.get("widget_id").and_then(Value::as_i64),
            label: attrs
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

pub fn trail() -> (Trail, Arc<InMemoryVersionStore>) {
    let store = Arc::new(InMemoryVersionStore::new());
    (Trail::new(store.clone()), store)
}

/// In-memory store whose commits always fail.
pub struct RefusingStore(pub InMemoryVersionStore);

struct RefusingTransaction(Box<dyn VersionTransaction>);

#[async_trait]
impl VersionStore for RefusingStore {
    async fn begin(&self) -> Result<Box<dyn VersionTransaction>, StoreError> {
        Ok(Box::new(RefusingTransaction(self.0.begin().await?)))
    }

    async fn query(&self, key: &ItemKey) -> Result<Vec<Version>, StoreError> {
        self.0.query(key).await
    }

    async fn get(&self, id: VersionId) -> Result<Option<Version>, StoreError> {
        self.0.get(id).await
    }

    async fn query_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<Version>, StoreError> {
        self.0.query_transaction(transaction_id).await
    }

    async fn list(&self, opts: &VersionListOptions) -> Result<Vec<Version>, StoreError> {
        self.0.list(opts).await
    }
}

#[async_trait]
impl VersionTransaction for RefusingTransaction {
    fn id(&self) -> TransactionId {
        self.0.id()
    }

    async fn append(&mut self, version: NewVersion) -> Result<Version, StoreError> {
        self.0.append(version).await
    }

    fn staged(&self) -> &[Version] {
        self.0.staged()
    }

    async fn commit(self: Box<Self>) -> Result<Vec<Version>, StoreError> {
        self.0.rollback().await?;
        Err(StoreError::Other("disk full".to_string()))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.0.rollback().await
    }
}
