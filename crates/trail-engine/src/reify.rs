//! Rebuilding past attribute states by replaying changesets backward.

use crate::TrailError;
use std::collections::BTreeSet;
use trail_types::{Attributes, CodecRegistry, Event, Version};

/// How a reified instance should behave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReifyOptions {
    /// Saving the reified instance records a create instead of an update.
    pub as_new_record: bool,
    /// Remove the identity attribute (for duplicating a past state).
    pub unset_id: bool,
    /// Copy version metadata whose key is an attribute back onto the instance.
    pub restore_metadata: bool,
}

pub(crate) struct Reifier<'a> {
    codecs: &'a CodecRegistry,
}

impl<'a> Reifier<'a> {
    pub(crate) fn new(codecs: &'a CodecRegistry) -> Self {
        Self { codecs }
    }

    /// State immediately after `target`. For a destroy, the snapshot taken
    /// before it. `history` is the item's full ascending history.
    pub(crate) fn state_after(
        &self,
        target: &Version,
        live: Option<&Attributes>,
        history: &[Version],
    ) -> Result<Attributes, TrailError> {
        if target.event == Event::Destroy {
            let object = target.object.as_ref().ok_or_else(|| {
                TrailError::InvalidState(format!("destroy version {} has no snapshot", target.id))
            })?;
            return Ok(self.codecs.decode_attributes(object)?);
        }
        let idx = history
            .iter()
            .position(|v| v.id == target.id)
            .ok_or_else(|| TrailError::NotFound(format!("version {} in history", target.id)))?;
        self.replay(live, history, idx + 1)?.ok_or_else(|| {
            TrailError::InvalidState(format!(
                "history of {} does not reach version {}",
                target.item_key(),
                target.id
            ))
        })
    }

    /// State before the first tracked version, when the item predates tracking.
    pub(crate) fn state_before_history(
        &self,
        live: Option<&Attributes>,
        history: &[Version],
    ) -> Result<Option<Attributes>, TrailError> {
        self.replay(live, history, 0)
    }

    /// Undo `history[from..]` newest first, starting from `live` (or from
    /// nothing if the item no longer exists). `None` means the item did not
    /// exist at that point.
    fn replay(
        &self,
        live: Option<&Attributes>,
        history: &[Version],
        from: usize,
    ) -> Result<Option<Attributes>, TrailError> {
        let schema = Self::schema(live, history)?;
        let mut state: Option<Attributes> = live.cloned();
        for newer in history[from.min(history.len())..].iter().rev() {
            match newer.event {
                Event::Destroy => {
                    let object = match &newer.object {
                        Some(o) => self.codecs.decode_attributes(o)?,
                        None => Attributes::new(),
                    };
                    state = Some(Self::restrict(object, schema.as_ref()));
                }
                Event::Create => state = None,
                Event::Update => {
                    let attrs = state.get_or_insert_with(Attributes::new);
                    for (name, change) in &newer.changeset {
                        if let Some(schema) = &schema {
                            if !schema.contains(name) {
                                tracing::warn!(
                                    item_type = %newer.item_type,
                                    item_id = %newer.item_id,
                                    version_id = %newer.id,
                                    attribute = %name,
                                    "attribute no longer exists; skipped during reify"
                                );
                                continue;
                            }
                        }
                        match change.before() {
                            Some(raw) => {
                                attrs.insert(name.clone(), self.codecs.decode(raw)?);
                            }
                            None => {
                                attrs.remove(name);
                            }
                        }
                    }
                }
            }
        }
        Ok(state)
    }

    /// Attribute names the current record type has: from the live record, or
    /// from the newest destroy snapshot. `None` when neither is available.
    fn schema(
        live: Option<&Attributes>,
        history: &[Version],
    ) -> Result<Option<BTreeSet<String>>, TrailError> {
        if let Some(live) = live {
            return Ok(Some(live.keys().cloned().collect()));
        }
        Ok(history
            .iter()
            .rev()
            .find(|v| v.event == Event::Destroy)
            .and_then(|v| v.object.as_ref())
            .map(|o| o.keys().cloned().collect()))
    }

    fn restrict(attrs: Attributes, schema: Option<&BTreeSet<String>>) -> Attributes {
        match schema {
            Some(schema) => attrs
                .into_iter()
                .filter(|(k, _)| schema.contains(k))
                .collect(),
            None => attrs,
        }
    }
}
