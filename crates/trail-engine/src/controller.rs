//! Versioning controller: the `Trail` handle and its units of work.

use crate::changeset::ChangesetBuilder;
use crate::config::TrailConfig;
use crate::policy::{PolicyConfigurationError, VersionPolicy};
use crate::reify::{ReifyOptions, Reifier};
use crate::tracked::{Tracked, UnitOutcome, VersioningState};
use crate::TrailError;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use trail_types::{
    Attributes, CodecError, CodecRegistry, Event, ItemKey, Metadata, NewVersion, StoreError,
    Trackable, TransactionId, Value, Version, VersionStore, VersionTransaction,
};

/// Decoded changeset: attribute -> (before, after).
pub type TypedChangeset = BTreeMap<String, (Option<Value>, Option<Value>)>;

type CommitHook = Box<dyn FnOnce(&[Version]) + Send>;
type RollbackHook = Box<dyn FnOnce() + Send>;

/// Versioning engine handle: store, per-type policies, and value codecs.
///
/// Registration (`register`, `codecs_mut`) happens at setup through `&mut self`;
/// afterwards the handle is shared, usually behind an `Arc`.
pub struct Trail {
    store: Arc<dyn VersionStore>,
    config: TrailConfig,
    enabled: AtomicBool,
    policies: HashMap<String, VersionPolicy>,
    default_policy: VersionPolicy,
    codecs: CodecRegistry,
}

impl Trail {
    pub fn new(store: Arc<dyn VersionStore>) -> Self {
        Self::with_config(store, TrailConfig::default())
    }

    pub fn with_config(store: Arc<dyn VersionStore>, config: TrailConfig) -> Self {
        Self {
            store,
            enabled: AtomicBool::new(config.enabled),
            config,
            policies: HashMap::new(),
            default_policy: VersionPolicy::default(),
            codecs: CodecRegistry::new(),
        }
    }

    pub fn config(&self) -> &TrailConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn VersionStore> {
        &self.store
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn codecs_mut(&mut self) -> &mut CodecRegistry {
        &mut self.codecs
    }

    /// Set the policy for `T`. Contradictory filters, and filters naming
    /// attributes outside `T::attribute_names()` when it is declared, are
    /// rejected here rather than at write time.
    pub fn register<T: Trackable>(
        &mut self,
        policy: VersionPolicy,
    ) -> Result<(), PolicyConfigurationError> {
        let known: BTreeSet<String> = T::attribute_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        policy.validate(&known)?;
        tracing::debug!(item_type = T::ITEM_TYPE, "registered version policy");
        self.policies.insert(T::ITEM_TYPE.to_string(), policy);
        Ok(())
    }

    /// Policy for an item type; unregistered types record every event.
    pub fn policy_for(&self, item_type: &str) -> &VersionPolicy {
        self.policies.get(item_type).unwrap_or(&self.default_policy)
    }

    /// Global recording switch.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Start a unit of work. Versions it records become visible on `commit`.
    pub async fn begin(&self) -> Result<UnitOfWork<'_>, TrailError> {
        let tx = self.store.begin().await?;
        Ok(UnitOfWork {
            trail: self,
            tx: Some(tx),
            outcome: Arc::new(UnitOutcome::default()),
            recorded: HashSet::new(),
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
        })
    }

    /// Run `fut` with recording switched off for `T` only.
    pub async fn without_versioning_for<T: Trackable, F: Future>(&self, fut: F) -> F::Output {
        trail_context::without_versioning_for(T::ITEM_TYPE, fut).await
    }

    pub(crate) fn builder_for(&self, item_type: &str) -> ChangesetBuilder<'_> {
        ChangesetBuilder::new(
            self.policy_for(item_type),
            &self.codecs,
            &self.config.skipped_attributes,
        )
    }

    /// Full history of one item, ascending.
    pub async fn history(&self, key: &ItemKey) -> Result<Vec<Version>, TrailError> {
        Ok(self.store.query(key).await?)
    }

    /// Versions of `tracked`, loaded once and cached on the instance. A record
    /// without identity has none.
    pub async fn versions<'r, T: Trackable>(
        &self,
        tracked: &'r mut Tracked<T>,
    ) -> Result<&'r [Version], TrailError> {
        if tracked.cached_versions().is_none() {
            let versions = match tracked.key() {
                Some(key) => self.store.query(&key).await?,
                None => Vec::new(),
            };
            tracked.set_cached_versions(versions);
        }
        Ok(tracked.cached_versions().unwrap_or_default())
    }

    /// Actor of the item's latest version.
    pub async fn originator<T: Trackable>(
        &self,
        tracked: &Tracked<T>,
    ) -> Result<Option<String>, TrailError> {
        let Some(key) = tracked.key() else {
            return Ok(None);
        };
        let history = self.store.query(&key).await?;
        Ok(history.last().and_then(|v| v.actor.clone()))
    }

    pub async fn previous_version(&self, version: &Version) -> Result<Option<Version>, TrailError> {
        let history = self.store.query(&version.item_key()).await?;
        let idx = history.iter().position(|v| v.id == version.id);
        Ok(idx
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| history.get(i).cloned()))
    }

    pub async fn next_version(&self, version: &Version) -> Result<Option<Version>, TrailError> {
        let history = self.store.query(&version.item_key()).await?;
        let idx = history.iter().position(|v| v.id == version.id);
        Ok(idx.and_then(|i| history.get(i + 1).cloned()))
    }

    /// Decoded before/after values of a version's changeset.
    pub fn changeset(&self, version: &Version) -> Result<TypedChangeset, CodecError> {
        version
            .changeset
            .iter()
            .map(|(name, change)| {
                let before = change.before().map(|v| self.codecs.decode(v)).transpose()?;
                let after = change.after().map(|v| self.codecs.decode(v)).transpose()?;
                Ok((name.clone(), (before, after)))
            })
            .collect()
    }

    /// Decoded pre-destroy snapshot, if the version carries one.
    pub fn object(&self, version: &Version) -> Result<Option<Attributes>, CodecError> {
        version
            .object
            .as_ref()
            .map(|o| self.codecs.decode_attributes(o))
            .transpose()
    }

    /// Rebuild the item as it was right after `version`. `live` is the current
    /// instance, or `None` when the item no longer exists. The live instance,
    /// including any versions it has cached, is left untouched.
    pub async fn reify<T: Trackable>(
        &self,
        version: &Version,
        live: Option<&Tracked<T>>,
        opts: ReifyOptions,
    ) -> Result<Tracked<T>, TrailError> {
        if version.item_type != T::ITEM_TYPE {
            return Err(TrailError::InvalidState(format!(
                "version {} belongs to {}, not {}",
                version.id,
                version.item_type,
                T::ITEM_TYPE
            )));
        }
        if let Some(key) = live.and_then(Tracked::key) {
            if key != version.item_key() {
                return Err(TrailError::InvalidState(format!(
                    "version {} belongs to {}, not {}",
                    version.id,
                    version.item_key(),
                    key
                )));
            }
        }
        let current = Self::live_attributes(live);
        let history = self.store.query(&version.item_key()).await?;
        let attrs = Reifier::new(&self.codecs).state_after(version, current.as_ref(), &history)?;
        self.finish_reify(attrs, Some(version), current, opts)
    }

    /// State of item `item_id` at `at`: the state after its latest version not
    /// newer than `at`. `None` if the item did not exist yet, or was already
    /// destroyed (a destroy at exactly `at` counts as destroyed).
    pub async fn version_at<T: Trackable>(
        &self,
        item_id: &str,
        live: Option<&Tracked<T>>,
        at: DateTime<Utc>,
    ) -> Result<Option<Tracked<T>>, TrailError> {
        let key = ItemKey::new(T::ITEM_TYPE, item_id);
        let history = self.store.query(&key).await?;
        let current = Self::live_attributes(live);
        let reifier = Reifier::new(&self.codecs);
        let latest = history
            .iter()
            .filter(|v| v.created_at <= at)
            .max_by_key(|v| v.order_key());
        match latest {
            Some(v) if v.is_terminal() => Ok(None),
            Some(v) => {
                let attrs = reifier.state_after(v, current.as_ref(), &history)?;
                self.finish_reify(attrs, Some(v), current, ReifyOptions::default())
                    .map(Some)
            }
            None if history.first().map(|v| v.event) == Some(Event::Create) => Ok(None),
            None => match reifier.state_before_history(current.as_ref(), &history)? {
                Some(attrs) => self
                    .finish_reify(attrs, None, current, ReifyOptions::default())
                    .map(Some),
                None => Ok(None),
            },
        }
    }

    fn live_attributes<T: Trackable>(live: Option<&Tracked<T>>) -> Option<Attributes> {
        live.filter(|t| !t.is_destroyed())
            .and_then(|t| t.persisted_attributes().cloned())
    }

    fn finish_reify<T: Trackable>(
        &self,
        mut attrs: Attributes,
        version: Option<&Version>,
        current: Option<Attributes>,
        opts: ReifyOptions,
    ) -> Result<Tracked<T>, TrailError> {
        if opts.restore_metadata {
            if let Some(metadata) = version.and_then(|v| v.metadata.as_ref()) {
                for (name, raw) in metadata {
                    if attrs.contains_key(name) {
                        attrs.insert(name.clone(), self.codecs.decode(raw)?);
                    }
                }
            }
        }
        if opts.unset_id {
            attrs.remove(&self.config.identity_attribute);
        }
        let record = T::from_attributes(&attrs)?;
        let persisted = if opts.as_new_record || opts.unset_id {
            None
        } else {
            current
        };
        Ok(Tracked::reified(record, persisted, version.map(|v| v.id)))
    }
}

/// One unit of work: every version recorded through it commits or rolls back
/// together. Dropping it without `commit` rolls back.
///
/// The host's own writes join through `on_commit` / `on_rollback`.
pub struct UnitOfWork<'t> {
    trail: &'t Trail,
    tx: Option<Box<dyn VersionTransaction>>,
    outcome: Arc<UnitOutcome>,
    recorded: HashSet<ItemKey>,
    on_commit: Vec<CommitHook>,
    on_rollback: Vec<RollbackHook>,
}

impl<'t> UnitOfWork<'t> {
    pub fn trail(&self) -> &'t Trail {
        self.trail
    }

    pub fn id(&self) -> Option<TransactionId> {
        self.tx.as_ref().map(|tx| tx.id())
    }

    /// Versions staged so far, in recording order.
    pub fn staged(&self) -> &[Version] {
        self.tx.as_ref().map(|tx| tx.staged()).unwrap_or_default()
    }

    /// Whether a version for `key` was recorded in this unit of work.
    pub fn was_recorded(&self, key: &ItemKey) -> bool {
        self.recorded.contains(key)
    }

    pub fn on_commit<F>(&mut self, hook: F)
    where
        F: FnOnce(&[Version]) + Send + 'static,
    {
        self.on_commit.push(Box::new(hook));
    }

    pub fn on_rollback<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_rollback.push(Box::new(hook));
    }

    /// Publish every staged version, then run the commit hooks.
    pub async fn commit(mut self) -> Result<Vec<Version>, TrailError> {
        let tx = self.take_tx()?;
        match tx.commit().await {
            Ok(versions) => {
                self.outcome.committed();
                self.on_rollback.clear();
                for hook in std::mem::take(&mut self.on_commit) {
                    hook(&versions);
                }
                Ok(versions)
            }
            Err(err) => {
                tracing::warn!(error = %err, "version commit failed; rolling back");
                self.outcome.rolled_back();
                self.run_rollback_hooks();
                Err(err.into())
            }
        }
    }

    pub async fn rollback(mut self) -> Result<(), TrailError> {
        let tx = self.take_tx()?;
        let res = tx.rollback().await;
        self.outcome.rolled_back();
        self.run_rollback_hooks();
        Ok(res?)
    }

    /// Record the first save of a new record.
    pub async fn create<T: Trackable>(
        &mut self,
        tracked: &mut Tracked<T>,
    ) -> Result<Option<Version>, TrailError> {
        if !tracked.is_new_record() {
            return Err(TrailError::InvalidState(format!(
                "{} is already persisted",
                T::ITEM_TYPE
            )));
        }
        tracked.begin_event(&self.outcome);
        tracked.set_state(VersioningState::PendingCreate);
        let attrs = tracked.get().attributes();
        let res = self.record_create(tracked.get(), &attrs).await;
        self.settle(tracked, res, |t, v| t.mark_saved(attrs, v))
    }

    /// Record a change to a persisted record, diffed against its snapshot.
    /// Writes nothing when no notable attribute changed.
    pub async fn update<T: Trackable>(
        &mut self,
        tracked: &mut Tracked<T>,
    ) -> Result<Option<Version>, TrailError> {
        self.update_with(tracked, Metadata::new()).await
    }

    /// Record the removal of a persisted record with a snapshot of its stored
    /// state. The version is also available as `tracked.last_version()`.
    pub async fn destroy<T: Trackable>(
        &mut self,
        tracked: &mut Tracked<T>,
    ) -> Result<Option<Version>, TrailError> {
        self.destroy_with(tracked, Metadata::new()).await
    }

    /// Create for a new record, update otherwise. Saving a reified instance
    /// through here records the restoration and makes it live again.
    pub async fn save<T: Trackable>(
        &mut self,
        tracked: &mut Tracked<T>,
    ) -> Result<Option<Version>, TrailError> {
        if tracked.is_destroyed() {
            return Err(TrailError::InvalidState(format!(
                "{} was destroyed; reify it to restore",
                T::ITEM_TYPE
            )));
        }
        if tracked.is_new_record() {
            self.create(tracked).await
        } else {
            self.update(tracked).await
        }
    }

    pub(crate) async fn update_with<T: Trackable>(
        &mut self,
        tracked: &mut Tracked<T>,
        extra: Metadata,
    ) -> Result<Option<Version>, TrailError> {
        let before = match (tracked.is_destroyed(), tracked.persisted_attributes()) {
            (false, Some(before)) => before.clone(),
            _ => {
                return Err(TrailError::InvalidState(format!(
                    "{} is not persisted",
                    T::ITEM_TYPE
                )))
            }
        };
        tracked.begin_event(&self.outcome);
        tracked.set_state(VersioningState::PendingUpdate);
        let after = tracked.get().attributes();
        let res = self.record_update(tracked.get(), &before, &after, extra).await;
        self.settle(tracked, res, |t, v| t.mark_saved(after, v))
    }

    pub(crate) async fn destroy_with<T: Trackable>(
        &mut self,
        tracked: &mut Tracked<T>,
        extra: Metadata,
    ) -> Result<Option<Version>, TrailError> {
        let before = match (tracked.is_destroyed(), tracked.persisted_attributes()) {
            (false, Some(before)) => before.clone(),
            _ => {
                return Err(TrailError::InvalidState(format!(
                    "{} is not persisted",
                    T::ITEM_TYPE
                )))
            }
        };
        tracked.begin_event(&self.outcome);
        tracked.set_state(VersioningState::PendingDestroy);
        let floor = tracked.last_version().map(|v| v.created_at);
        let res = self
            .record_destroy(tracked.get(), &before, floor, extra)
            .await;
        self.settle(tracked, res, |t, v| t.mark_destroyed(v))
    }

    fn settle<T: Trackable>(
        &self,
        tracked: &mut Tracked<T>,
        res: Result<Option<Version>, TrailError>,
        done: impl FnOnce(&mut Tracked<T>, Option<Version>),
    ) -> Result<Option<Version>, TrailError> {
        match res {
            Ok(version) => {
                done(tracked, version.clone());
                Ok(version)
            }
            Err(err) => {
                tracked.set_state(VersioningState::Idle);
                Err(err)
            }
        }
    }

    fn should_record<T: Trackable>(&self, record: &T, event: Event) -> bool {
        let record_it = self.trail.is_enabled()
            && trail_context::is_enabled_for(T::ITEM_TYPE)
            && self.trail.policy_for(T::ITEM_TYPE).records(event)
            && record.should_record(event);
        if !record_it {
            let item_id = record.item_id().unwrap_or_default();
            tracing::debug!(
                item_type = T::ITEM_TYPE,
                item_id = %item_id,
                event = %event,
                "recording skipped"
            );
        }
        record_it
    }

    async fn record_create<T: Trackable>(
        &mut self,
        record: &T,
        attrs: &Attributes,
    ) -> Result<Option<Version>, TrailError> {
        if !self.should_record(record, Event::Create) {
            return Ok(None);
        }
        let changeset = self.trail.builder_for(T::ITEM_TYPE).for_create(attrs)?;
        let new = self.new_version(record, Event::Create, changeset, None, Metadata::new())?;
        self.append(new).await.map(Some)
    }

    async fn record_update<T: Trackable>(
        &mut self,
        record: &T,
        before: &Attributes,
        after: &Attributes,
        extra: Metadata,
    ) -> Result<Option<Version>, TrailError> {
        if !self.should_record(record, Event::Update) {
            return Ok(None);
        }
        let changeset = self
            .trail
            .builder_for(T::ITEM_TYPE)
            .for_update(before, after)?;
        if changeset.is_empty() {
            let item_id = record.item_id().unwrap_or_default();
            tracing::debug!(
                item_type = T::ITEM_TYPE,
                item_id = %item_id,
                "no notable change; nothing recorded"
            );
            return Ok(None);
        }
        let new = self.new_version(record, Event::Update, changeset, None, extra)?;
        self.append(new).await.map(Some)
    }

    async fn record_destroy<T: Trackable>(
        &mut self,
        record: &T,
        before: &Attributes,
        floor: Option<DateTime<Utc>>,
        extra: Metadata,
    ) -> Result<Option<Version>, TrailError> {
        if !self.should_record(record, Event::Destroy) {
            return Ok(None);
        }
        let object = self.trail.builder_for(T::ITEM_TYPE).object_snapshot(before)?;
        let mut new =
            self.new_version(record, Event::Destroy, Default::default(), Some(object), extra)?;
        new.created_at = self
            .destroy_time(&ItemKey::new(&new.item_type, &new.item_id), floor)
            .await?;
        self.append(new).await.map(Some)
    }

    /// Wall clock, but never earlier than a version already written for the
    /// item, so the destroy sorts after the events it follows.
    async fn destroy_time(
        &mut self,
        key: &ItemKey,
        floor: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, TrailError> {
        let staged = self
            .staged()
            .iter()
            .filter(|v| v.item_type == key.item_type && v.item_id == key.item_id)
            .map(|v| v.created_at)
            .max();
        let committed = self
            .trail
            .store
            .query(key)
            .await?
            .last()
            .map(|v| v.created_at);
        Ok([floor, staged, committed]
            .into_iter()
            .flatten()
            .fold(Utc::now(), |acc, t| acc.max(t)))
    }

    fn new_version<T: Trackable>(
        &self,
        record: &T,
        event: Event,
        changeset: trail_types::Changeset,
        object: Option<trail_types::EncodedAttributes>,
        extra: Metadata,
    ) -> Result<NewVersion, TrailError> {
        let item_id = record.item_id().ok_or_else(|| {
            StoreError::Constraint(format!("{} has no identity", T::ITEM_TYPE))
        })?;
        let mut metadata = trail_context::current_metadata();
        metadata.extend(record.version_meta(event));
        metadata.extend(extra);
        Ok(NewVersion {
            item_type: T::ITEM_TYPE.to_string(),
            item_id,
            event,
            changeset,
            object,
            actor: trail_context::current_actor(),
            metadata: (!metadata.is_empty()).then_some(metadata),
            created_at: record.updated_at().unwrap_or_else(Utc::now),
        })
    }

    async fn append(&mut self, new: NewVersion) -> Result<Version, TrailError> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| TrailError::InvalidState("unit of work is finished".to_string()))?;
        let version = tx.append(new).await?;
        tracing::debug!(
            item_type = %version.item_type,
            item_id = %version.item_id,
            event = %version.event,
            version_id = %version.id,
            "version staged"
        );
        self.recorded.insert(version.item_key());
        Ok(version)
    }

    fn take_tx(&mut self) -> Result<Box<dyn VersionTransaction>, TrailError> {
        self.tx
            .take()
            .ok_or_else(|| TrailError::InvalidState("unit of work is finished".to_string()))
    }

    fn run_rollback_hooks(&mut self) {
        self.on_commit.clear();
        for hook in std::mem::take(&mut self.on_rollback) {
            hook();
        }
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tracing::debug!(
                transaction_id = %tx.id().0,
                staged = tx.staged().len(),
                "unit of work dropped without commit; discarding staged versions"
            );
            drop(tx);
            self.outcome.rolled_back();
            self.run_rollback_hooks();
        }
    }
}
