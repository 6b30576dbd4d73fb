//! Per-type recording policy: which events, which attributes.

use std::collections::BTreeSet;
use std::sync::Arc;
use trail_types::{Attributes, Event};

type Predicate = Arc<dyn Fn(&Attributes) -> bool + Send + Sync>;

/// Attribute reference in an `ignore` / `only` list.
#[derive(Clone)]
pub enum AttributeFilter {
    Name(String),
    /// Applies only while the predicate holds for the post-mutation attributes.
    When(String, Predicate),
}

impl AttributeFilter {
    pub fn name(&self) -> &str {
        match self {
            AttributeFilter::Name(n) | AttributeFilter::When(n, _) => n,
        }
    }

    pub fn applies_to(&self, attribute: &str, after: &Attributes) -> bool {
        match self {
            AttributeFilter::Name(n) => n == attribute,
            AttributeFilter::When(n, pred) => n == attribute && pred(after),
        }
    }
}

impl std::fmt::Debug for AttributeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributeFilter::Name(n) => f.debug_tuple("Name").field(n).finish(),
            AttributeFilter::When(n, _) => f.debug_tuple("When").field(n).field(&"<predicate>").finish(),
        }
    }
}

/// What gets recorded for one item type.
#[derive(Debug, Clone)]
pub struct VersionPolicy {
    /// Events that produce versions.
    pub on: Vec<Event>,
    /// Changes to these never trigger a version and are left out of changesets.
    pub ignore: Vec<AttributeFilter>,
    /// When non-empty, only changes to these trigger a version.
    pub only: Vec<AttributeFilter>,
    /// Never recorded anywhere, not even in destroy snapshots.
    pub skip: Vec<String>,
}

impl Default for VersionPolicy {
    fn default() -> Self {
        Self {
            on: vec![Event::Create, Event::Update, Event::Destroy],
            ignore: Vec::new(),
            only: Vec::new(),
            skip: Vec::new(),
        }
    }
}

impl VersionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on(mut self, events: &[Event]) -> Self {
        self.on = events.to_vec();
        self
    }

    #[must_use]
    pub fn ignore(mut self, attribute: impl Into<String>) -> Self {
        self.ignore.push(AttributeFilter::Name(attribute.into()));
        self
    }

    #[must_use]
    pub fn ignore_when<F>(mut self, attribute: impl Into<String>, pred: F) -> Self
    where
        F: Fn(&Attributes) -> bool + Send + Sync + 'static,
    {
        self.ignore
            .push(AttributeFilter::When(attribute.into(), Arc::new(pred)));
        self
    }

    #[must_use]
    pub fn only(mut self, attribute: impl Into<String>) -> Self {
        self.only.push(AttributeFilter::Name(attribute.into()));
        self
    }

    #[must_use]
    pub fn only_when<F>(mut self, attribute: impl Into<String>, pred: F) -> Self
    where
        F: Fn(&Attributes) -> bool + Send + Sync + 'static,
    {
        self.only
            .push(AttributeFilter::When(attribute.into(), Arc::new(pred)));
        self
    }

    #[must_use]
    pub fn skip(mut self, attribute: impl Into<String>) -> Self {
        self.skip.push(attribute.into());
        self
    }

    pub fn records(&self, event: Event) -> bool {
        self.on.contains(&event)
    }

    /// Setup-time check. An empty `known` set means the schema is not declared
    /// and only contradictions are reported.
    pub fn validate(&self, known: &BTreeSet<String>) -> Result<(), PolicyConfigurationError> {
        let ignored: BTreeSet<&str> = self.ignore.iter().map(AttributeFilter::name).collect();
        let skipped: BTreeSet<&str> = self.skip.iter().map(String::as_str).collect();
        for name in self.only.iter().map(AttributeFilter::name) {
            if ignored.contains(name) {
                return Err(PolicyConfigurationError::Contradictory {
                    attribute: name.to_string(),
                    reason: "listed in both `only` and `ignore`",
                });
            }
            if skipped.contains(name) {
                return Err(PolicyConfigurationError::Contradictory {
                    attribute: name.to_string(),
                    reason: "listed in both `only` and `skip`",
                });
            }
        }
        if known.is_empty() {
            return Ok(());
        }
        let referenced = ignored
            .iter()
            .copied()
            .chain(skipped.iter().copied())
            .chain(self.only.iter().map(AttributeFilter::name));
        for name in referenced {
            if !known.contains(name) {
                return Err(PolicyConfigurationError::UnknownAttribute(name.to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyConfigurationError {
    #[error("attribute {attribute} is {reason}")]
    Contradictory {
        attribute: String,
        reason: &'static str,
    },
    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn only_and_ignore_on_same_attribute_is_rejected() {
        let policy = VersionPolicy::new().only("name").ignore("name");
        assert!(matches!(
            policy.validate(&known(&[])),
            Err(PolicyConfigurationError::Contradictory { .. })
        ));
        let policy = VersionPolicy::new().only("name").skip("name");
        assert!(policy.validate(&known(&[])).is_err());
    }

    #[test]
    fn unknown_attribute_is_rejected_only_with_declared_schema() {
        let policy = VersionPolicy::new().ignore("colour");
        assert!(policy.validate(&known(&[])).is_ok());
        assert!(matches!(
            policy.validate(&known(&["id", "name"])),
            Err(PolicyConfigurationError::UnknownAttribute(a)) if a == "colour"
        ));
        assert!(VersionPolicy::new()
            .ignore("name")
            .validate(&known(&["id", "name"]))
            .is_ok());
    }

    #[test]
    fn conditional_filter_checks_post_state() {
        let filter = AttributeFilter::When(
            "title".to_string(),
            Arc::new(|attrs: &Attributes| attrs.get("draft").and_then(|v| v.as_bool()) == Some(true)),
        );
        let mut attrs = Attributes::new();
        attrs.insert("draft".to_string(), true.into());
        assert!(filter.applies_to("title", &attrs));
        assert!(!filter.applies_to("body", &attrs));
        attrs.insert("draft".to_string(), false.into());
        assert!(!filter.applies_to("title", &attrs));
    }
}
