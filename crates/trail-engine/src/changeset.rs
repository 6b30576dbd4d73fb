//! Changeset computation for one mutation.

use crate::policy::VersionPolicy;
use std::collections::BTreeSet;
use trail_types::{
    Attributes, Change, Changeset, CodecError, CodecRegistry, EncodedAttributes, Value,
};

/// Applies a [`VersionPolicy`] and the global skip list to attribute states and
/// encodes the surviving values.
pub struct ChangesetBuilder<'a> {
    policy: &'a VersionPolicy,
    codecs: &'a CodecRegistry,
    always_skip: &'a [String],
}

impl<'a> ChangesetBuilder<'a> {
    pub fn new(
        policy: &'a VersionPolicy,
        codecs: &'a CodecRegistry,
        always_skip: &'a [String],
    ) -> Self {
        Self {
            policy,
            codecs,
            always_skip,
        }
    }

    fn is_skipped(&self, attribute: &str) -> bool {
        self.always_skip.iter().any(|s| s == attribute)
            || self.policy.skip.iter().any(|s| s == attribute)
    }

    fn is_notable(&self, attribute: &str, after: &Attributes) -> bool {
        if self
            .policy
            .ignore
            .iter()
            .any(|f| f.applies_to(attribute, after))
        {
            return false;
        }
        self.policy.only.is_empty()
            || self
                .policy
                .only
                .iter()
                .any(|f| f.applies_to(attribute, after))
    }

    /// Names of attributes whose value differs. An attribute present on one side
    /// only is compared against `Null`.
    pub fn changed_attributes(before: &Attributes, after: &Attributes) -> Vec<String> {
        let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        names
            .into_iter()
            .filter(|name| {
                let b = before.get(*name).unwrap_or(&Value::Null);
                let a = after.get(*name).unwrap_or(&Value::Null);
                b != a
            })
            .cloned()
            .collect()
    }

    /// Every notable, populated attribute, with `before` absent.
    pub fn for_create(&self, after: &Attributes) -> Result<Changeset, CodecError> {
        let mut changeset = Changeset::new();
        for (name, value) in after {
            if value.is_null() || self.is_skipped(name) || !self.is_notable(name, after) {
                continue;
            }
            changeset.insert(name.clone(), Change(None, Some(self.codecs.encode(value)?)));
        }
        Ok(changeset)
    }

    /// Notable changed attributes only; empty means nothing worth recording.
    pub fn for_update(
        &self,
        before: &Attributes,
        after: &Attributes,
    ) -> Result<Changeset, CodecError> {
        let mut changeset = Changeset::new();
        for name in Self::changed_attributes(before, after) {
            if self.is_skipped(&name) || !self.is_notable(&name, after) {
                continue;
            }
            let b = before.get(&name).unwrap_or(&Value::Null);
            let a = after.get(&name).unwrap_or(&Value::Null);
            let change = Change(Some(self.codecs.encode(b)?), Some(self.codecs.encode(a)?));
            changeset.insert(name, change);
        }
        Ok(changeset)
    }

    /// Full encoded snapshot minus skipped attributes.
    pub fn object_snapshot(&self, attrs: &Attributes) -> Result<EncodedAttributes, CodecError> {
        let kept: Attributes = attrs
            .iter()
            .filter(|(name, _)| !self.is_skipped(name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.codecs.encode_attributes(&kept)
    }
}
