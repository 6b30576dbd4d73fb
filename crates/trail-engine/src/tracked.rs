//! Record wrapper holding versioning bookkeeping for one instance.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use trail_types::{Attributes, ItemKey, Trackable, Version, VersionId};

/// Whether an instance reflects current state or was rebuilt from history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Live,
    /// Rebuilt from history. `version_id` is `None` for the state that predates
    /// the first tracked change.
    Reified { version_id: Option<VersionId> },
}

/// Controller state for the current event on this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersioningState {
    Idle,
    PendingCreate,
    PendingUpdate,
    PendingDestroy,
    Recorded,
}

// Zero while the unit of work is still open.
const COMMITTED: u8 = 1;
const ROLLED_BACK: u8 = 2;

/// How a unit of work ended, shared with every instance it touched.
#[derive(Debug, Default)]
pub(crate) struct UnitOutcome(AtomicU8);

impl UnitOutcome {
    pub(crate) fn committed(&self) {
        self.0.store(COMMITTED, Ordering::SeqCst);
    }

    pub(crate) fn rolled_back(&self) {
        self.0.store(ROLLED_BACK, Ordering::SeqCst);
    }

    fn get(&self) -> u8 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct Bookkeeping {
    persisted: Option<Attributes>,
    liveness: Liveness,
    state: VersioningState,
    destroyed: bool,
    last_version: Option<Version>,
}

/// Bookkeeping as it was before the first event of a still-unsettled unit of
/// work. Restored if that unit rolls back.
#[derive(Debug, Clone)]
struct Pending {
    undo: Bookkeeping,
    outcome: Arc<UnitOutcome>,
}

/// A [`Trackable`] record plus its persisted snapshot, liveness, and the
/// handle to the last version written for it.
///
/// The snapshot is what the host last stored; `update` diffs against it.
/// Changes made by a unit of work that rolls back are undone, so a retry
/// diffs against the state the host actually kept.
#[derive(Debug, Clone)]
pub struct Tracked<T> {
    record: T,
    book: Bookkeeping,
    pending: Option<Pending>,
    versions: Option<Vec<Version>>,
}

impl<T: Trackable> Tracked<T> {
    /// A record that has not been stored yet; its first save is a create.
    pub fn new(record: T) -> Self {
        Self {
            record,
            book: Bookkeeping {
                persisted: None,
                liveness: Liveness::Live,
                state: VersioningState::Idle,
                destroyed: false,
                last_version: None,
            },
            pending: None,
            versions: None,
        }
    }

    /// A record loaded from the host's storage, in its stored state.
    pub fn persisted(record: T) -> Self {
        let snapshot = record.attributes();
        let mut tracked = Self::new(record);
        tracked.book.persisted = Some(snapshot);
        tracked
    }

    pub(crate) fn reified(
        record: T,
        persisted: Option<Attributes>,
        version_id: Option<VersionId>,
    ) -> Self {
        let mut tracked = Self::new(record);
        tracked.book.persisted = persisted;
        tracked.book.liveness = Liveness::Reified { version_id };
        tracked
    }

    pub fn key(&self) -> Option<ItemKey> {
        self.record
            .item_id()
            .map(|id| ItemKey::new(T::ITEM_TYPE, id))
    }

    pub fn is_new_record(&self) -> bool {
        let book = self.effective();
        book.persisted.is_none() && !book.destroyed
    }

    pub fn is_destroyed(&self) -> bool {
        self.effective().destroyed
    }

    pub fn is_live(&self) -> bool {
        self.effective().liveness == Liveness::Live
    }

    pub fn liveness(&self) -> Liveness {
        self.effective().liveness
    }

    pub fn state(&self) -> VersioningState {
        self.effective().state
    }

    /// The version written by the most recent recorded event on this instance.
    /// Versions discarded by a rollback are not reported.
    pub fn last_version(&self) -> Option<&Version> {
        self.effective().last_version.as_ref()
    }

    /// Versions loaded by `Trail::versions`, if they have been loaded.
    pub fn cached_versions(&self) -> Option<&[Version]> {
        if self.is_reverted() {
            return None;
        }
        self.versions.as_deref()
    }

    /// Attribute state as last stored by the host.
    pub fn persisted_attributes(&self) -> Option<&Attributes> {
        self.effective().persisted.as_ref()
    }

    /// Attributes that differ from the persisted snapshot.
    pub fn changed_attributes(&self) -> Vec<String> {
        match self.persisted_attributes() {
            Some(before) => {
                crate::ChangesetBuilder::changed_attributes(before, &self.record.attributes())
            }
            None => self.record.attributes().into_keys().collect(),
        }
    }

    pub fn get(&self) -> &T {
        &self.record
    }

    pub fn into_inner(self) -> T {
        self.record
    }

    fn is_reverted(&self) -> bool {
        matches!(&self.pending, Some(p) if p.outcome.get() == ROLLED_BACK)
    }

    fn effective(&self) -> &Bookkeeping {
        match &self.pending {
            Some(p) if p.outcome.get() == ROLLED_BACK => &p.undo,
            _ => &self.book,
        }
    }

    /// Fold a finished unit of work into the bookkeeping.
    fn settle_pending(&mut self) {
        let Some(outcome) = self.pending.as_ref().map(|p| p.outcome.get()) else {
            return;
        };
        match outcome {
            COMMITTED => self.pending = None,
            ROLLED_BACK => {
                if let Some(p) = self.pending.take() {
                    self.book = p.undo;
                    self.versions = None;
                }
            }
            _ => {}
        }
    }

    /// Called before every event a unit of work records on this instance. The
    /// first event of a unit captures the state to restore on rollback.
    pub(crate) fn begin_event(&mut self, outcome: &Arc<UnitOutcome>) {
        self.settle_pending();
        let same_unit = matches!(&self.pending, Some(p) if Arc::ptr_eq(&p.outcome, outcome));
        if !same_unit {
            self.pending = Some(Pending {
                undo: self.book.clone(),
                outcome: Arc::clone(outcome),
            });
        }
    }

    pub(crate) fn set_state(&mut self, state: VersioningState) {
        self.book.state = state;
    }

    pub(crate) fn replace_record(&mut self, record: T) {
        self.record = record;
    }

    /// The host stored the current attributes.
    pub(crate) fn mark_saved(&mut self, attrs: Attributes, version: Option<Version>) {
        self.book.persisted = Some(attrs);
        self.book.liveness = Liveness::Live;
        self.finish_event(version);
    }

    pub(crate) fn mark_destroyed(&mut self, version: Option<Version>) {
        self.book.persisted = None;
        self.book.destroyed = true;
        self.finish_event(version);
    }

    fn finish_event(&mut self, version: Option<Version>) {
        match version {
            Some(v) => {
                self.book.state = VersioningState::Recorded;
                self.book.last_version = Some(v);
                self.versions = None;
            }
            None => self.book.state = VersioningState::Idle,
        }
    }

    pub(crate) fn set_cached_versions(&mut self, versions: Vec<Version>) {
        self.settle_pending();
        self.versions = Some(versions);
    }
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.record
    }
}

impl<T> DerefMut for Tracked<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.record
    }
}
