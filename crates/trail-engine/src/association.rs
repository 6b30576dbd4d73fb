//! Child versions attributed to an owner's update or destroy.

use crate::controller::UnitOfWork;
use crate::tracked::Tracked;
use crate::TrailError;
use trail_types::{Metadata, Trackable, Value, Version};

/// What happens to children when their owner is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerDestroy {
    /// Foreign key set to null; recorded as a child update.
    Nullify,
    /// Child removed with its owner; recorded as a child destroy.
    Destroy,
    /// Child left as is; nothing recorded.
    Keep,
}

/// A dependent association from an owner type to a child type.
#[derive(Debug, Clone)]
pub struct Association {
    pub name: String,
    /// Child attribute referencing the owner's identity.
    pub foreign_key: String,
    pub on_owner_destroy: OwnerDestroy,
}

impl Association {
    pub fn new(name: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            foreign_key: foreign_key.into(),
            on_owner_destroy: OwnerDestroy::Nullify,
        }
    }

    #[must_use]
    pub fn on_owner_destroy(mut self, behavior: OwnerDestroy) -> Self {
        self.on_owner_destroy = behavior;
        self
    }

    fn metadata<O: Trackable>(&self, owner: &Tracked<O>, owner_version: Option<&Version>) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("association".to_string(), self.name.clone().into());
        meta.insert("owner_type".to_string(), O::ITEM_TYPE.into());
        meta.insert(
            "owner_id".to_string(),
            owner.get().item_id().map(Into::into).unwrap_or_default(),
        );
        if let Some(v) = owner_version {
            meta.insert("owner_version_id".to_string(), v.id.0.into());
        }
        meta
    }
}

impl UnitOfWork<'_> {
    /// Record child versions caused by the owner's latest event in this unit of
    /// work. Call after the owner's own `update` or `destroy`.
    ///
    /// After an owner update, children whose foreign key changed since their
    /// snapshot get an update. After an owner destroy, children are handled per
    /// `on_owner_destroy`. Children already recorded directly in this unit of
    /// work are left alone.
    pub async fn track_association<O: Trackable, C: Trackable>(
        &mut self,
        owner: &Tracked<O>,
        association: &Association,
        children: &mut [Tracked<C>],
    ) -> Result<Vec<Version>, TrailError> {
        let owner_version = owner
            .last_version()
            .filter(|v| Some(v.transaction_id) == self.id());
        let meta = association.metadata(owner, owner_version);
        let mut recorded = Vec::new();
        for child in children.iter_mut() {
            let Some(key) = child.key() else { continue };
            if self.was_recorded(&key) {
                tracing::debug!(
                    association = %association.name,
                    item_type = C::ITEM_TYPE,
                    item_id = %key.item_id,
                    "child already recorded in this unit of work"
                );
                continue;
            }
            let version = if owner.is_destroyed() {
                match association.on_owner_destroy {
                    OwnerDestroy::Keep => None,
                    OwnerDestroy::Destroy => self.destroy_with(child, meta.clone()).await?,
                    OwnerDestroy::Nullify => {
                        let mut attrs = child.get().attributes();
                        attrs.insert(association.foreign_key.clone(), Value::Null);
                        child.replace_record(C::from_attributes(&attrs)?);
                        self.update_with(child, meta.clone()).await?
                    }
                }
            } else if child
                .changed_attributes()
                .contains(&association.foreign_key)
            {
                self.update_with(child, meta.clone()).await?
            } else {
                None
            };
            recorded.extend(version);
        }
        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{trail, Part, Widget};
    use serde_json::json;
    use trail_types::{Event, ItemKey};

    fn parts(widget_id: i64) -> Vec<Tracked<Part>> {
        (1..=3)
            .map(|id| {
                Tracked::persisted(Part {
                    id,
                    widget_id: Some(widget_id),
                    label: format!("part-{}", id),
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn owner_destroy_nullifies_children_with_attribution() {
        let (trail, _) = trail();
        let mut owner = Tracked::persisted(Widget::new(9, "Bob"));
        let mut children = parts(9);
        let assoc = Association::new("parts", "widget_id");

        let mut uow = trail.begin().await.unwrap();
        let owner_version = uow.destroy(&mut owner).await.unwrap().unwrap();
        let recorded = uow
            .track_association(&owner, &assoc, &mut children)
            .await
            .unwrap();
        uow.commit().await.unwrap();

        assert_eq!(recorded.len(), 3);
        for (v, child) in recorded.iter().zip(&children) {
            assert_eq!(v.event, Event::Update);
            assert_eq!(v.transaction_id, owner_version.transaction_id);
            assert_eq!(v.changeset["widget_id"].after(), Some(&json!(null)));
            let meta = v.metadata.as_ref().unwrap();
            assert_eq!(meta["association"], json!("parts"));
            assert_eq!(meta["owner_type"], json!("Widget"));
            assert_eq!(meta["owner_id"], json!("9"));
            assert_eq!(meta["owner_version_id"], json!(owner_version.id.0));
            assert_eq!(child.widget_id, None);
        }
    }

    #[tokio::test]
    async fn child_recorded_directly_is_not_recorded_again() {
        let (trail, store) = trail();
        let mut owner = Tracked::persisted(Widget::new(9, "Bob"));
        let mut children = parts(9);
        let assoc = Association::new("parts", "widget_id");

        let mut uow = trail.begin().await.unwrap();
        children[0].label = "renamed".to_string();
        children[0].widget_id = None;
        uow.update(&mut children[0]).await.unwrap();
        uow.destroy(&mut owner).await.unwrap();
        let recorded = uow
            .track_association(&owner, &assoc, &mut children)
            .await
            .unwrap();
        assert_eq!(recorded.len(), 2);
        // A second pass finds every child already recorded.
        assert!(uow
            .track_association(&owner, &assoc, &mut children)
            .await
            .unwrap()
            .is_empty());
        uow.commit().await.unwrap();

        let first = trail.history(&ItemKey::new("Part", "1")).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].metadata.is_none());
        assert_eq!(store.len().await, 4);
    }

    #[tokio::test]
    async fn destroy_and_keep_behaviors() {
        let (trail, _) = trail();
        let mut owner = Tracked::persisted(Widget::new(9, "Bob"));
        let mut doomed = parts(9);
        let mut kept = vec![Tracked::persisted(Part {
            id: 10,
            widget_id: Some(9),
            label: "spare".to_string(),
        })];

        let mut uow = trail.begin().await.unwrap();
        uow.destroy(&mut owner).await.unwrap();
        let destroyed = uow
            .track_association(
                &owner,
                &Association::new("parts", "widget_id").on_owner_destroy(OwnerDestroy::Destroy),
                &mut doomed,
            )
            .await
            .unwrap();
        assert_eq!(destroyed.len(), 3);
        assert!(destroyed.iter().all(|v| v.event == Event::Destroy && v.object.is_some()));
        assert!(doomed.iter().all(|c| c.is_destroyed()));

        let untouched = uow
            .track_association(
                &owner,
                &Association::new("spares", "widget_id").on_owner_destroy(OwnerDestroy::Keep),
                &mut kept,
            )
            .await
            .unwrap();
        assert!(untouched.is_empty());
        assert_eq!(kept[0].widget_id, Some(9));
    }

    #[tokio::test]
    async fn owner_update_records_children_whose_key_moved() {
        let (trail, _) = trail();
        let mut owner = Tracked::persisted(Widget::new(9, "Bob"));
        let mut children = parts(9);
        children[1].widget_id = Some(4);

        let mut uow = trail.begin().await.unwrap();
        owner.name = "Tom".to_string();
        let owner_version = uow.update(&mut owner).await.unwrap().unwrap();
        let recorded = uow
            .track_association(&owner, &Association::new("parts", "widget_id"), &mut children)
            .await
            .unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].item_id, "2");
        assert_eq!(
            recorded[0].metadata.as_ref().unwrap()["owner_version_id"],
            json!(owner_version.id.0)
        );
    }
}
