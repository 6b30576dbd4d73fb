//! The versioned record served by the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trail_engine::{Attributes, RecordError, Trackable, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Option<i64>,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub status: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Trackable for Document {
    const ITEM_TYPE: &'static str = "Document";

    fn item_id(&self) -> Option<String> {
        self.id.map(|id| id.to_string())
    }

    fn attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("id".to_string(), self.id.into());
        attrs.insert("title".to_string(), self.title.clone().into());
        attrs.insert("body".to_string(), self.body.clone().into());
        attrs.insert("status".to_string(), self.status.clone().into());
        attrs.insert("updated_at".to_string(), self.updated_at.into());
        attrs
    }

    fn from_attributes(attrs: &Attributes) -> Result<Self, RecordError> {
        let text = |name: &str| -> Result<String, RecordError> {
            match attrs.get(name) {
                Some(Value::Text(s)) => Ok(s.clone()),
                Some(_) => Err(RecordError::TypeMismatch {
                    name: name.to_string(),
                    expected: "text",
                }),
                None => Err(RecordError::MissingAttribute(name.to_string())),
            }
        };
        let updated_at = attrs
            .get("updated_at")
            .and_then(Value::as_timestamp)
            .ok_or_else(|| RecordError::MissingAttribute("updated_at".to_string()))?;
        Ok(Self {
            id: attrs.get("id").and_then(Value::as_i64),
            title: text("title")?,
            body: text("body")?,
            status: attrs.get("status").and_then(Value::as_str).map(str::to_string),
            updated_at,
        })
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        Some(self.updated_at)
    }

    fn attribute_names() -> &'static [&'static str] {
        &["id", "title", "body", "status", "updated_at"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_rebuild_the_document() {
        let doc = Document {
            id: Some(4),
            title: "Draft".to_string(),
            body: "hello".to_string(),
            status: None,
            updated_at: Utc::now(),
        };
        assert_eq!(Document::from_attributes(&doc.attributes()).unwrap(), doc);

        let mut attrs = doc.attributes();
        attrs.insert("title".to_string(), Value::Int(1));
        assert!(matches!(
            Document::from_attributes(&attrs),
            Err(RecordError::TypeMismatch { .. })
        ));
    }
}
