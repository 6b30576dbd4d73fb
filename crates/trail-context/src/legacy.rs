//! Process-wide ambient actor, kept for callers that predate scoped blocks.
//!
//! This value is shared by every concurrent unit of work. It is read only when
//! no [`RequestScope`](crate::RequestScope) is active.

use std::collections::BTreeSet;
use std::panic::Location;
use std::sync::{Mutex, RwLock};

static LEGACY_ACTOR: RwLock<Option<String>> = RwLock::new(None);
static WARNED_SITES: Mutex<BTreeSet<(&'static str, u32, u32)>> = Mutex::new(BTreeSet::new());

/// Set the process-wide actor.
///
/// Unsafe under concurrency: another request running at the same time will
/// be attributed to this actor. Logs one warning per call site.
#[deprecated(note = "shared across concurrent requests; use `with_scope` instead")]
#[track_caller]
pub fn set_legacy_actor(actor: Option<String>) {
    warn_once(Location::caller());
    let mut guard = LEGACY_ACTOR.write().unwrap_or_else(|e| e.into_inner());
    *guard = actor;
}

/// Read the process-wide actor.
#[deprecated(note = "shared across concurrent requests; use `current_actor` instead")]
#[track_caller]
pub fn legacy_actor() -> Option<String> {
    warn_once(Location::caller());
    ambient_actor()
}

pub(crate) fn ambient_actor() -> Option<String> {
    LEGACY_ACTOR
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

fn warn_once(site: &'static Location<'static>) {
    let key = (site.file(), site.line(), site.column());
    let first = WARNED_SITES
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(key);
    if first {
        tracing::warn!(
            file = site.file(),
            line = site.line(),
            "process-wide actor used outside a request scope; concurrent requests may be misattributed"
        );
    }
}

#[cfg(test)]
pub(crate) fn warned_site_count() -> usize {
    WARNED_SITES
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .len()
}

#[cfg(test)]
#[allow(deprecated)]
mod tests {
    use super::*;
    use crate::{current_actor, with_scope, RequestScope};

    #[tokio::test]
    async fn legacy_actor_is_fallback_only_and_warns_once_per_site() {
        let before = warned_site_count();
        for _ in 0..3 {
            set_legacy_actor(Some("legacy".to_string()));
        }
        assert_eq!(warned_site_count(), before + 1);

        set_legacy_actor(Some("legacy".to_string()));
        assert_eq!(warned_site_count(), before + 2);

        assert_eq!(current_actor().as_deref(), Some("legacy"));
        assert_eq!(legacy_actor().as_deref(), Some("legacy"));
        with_scope(RequestScope::new().with_actor("scoped"), async {
            assert_eq!(current_actor().as_deref(), Some("scoped"));
        })
        .await;
        with_scope(RequestScope::new(), async {
            assert_eq!(current_actor(), None);
        })
        .await;

        set_legacy_actor(None);
        assert_eq!(current_actor(), None);
    }
}
