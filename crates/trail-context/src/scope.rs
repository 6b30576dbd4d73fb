//! Task-local request scope.

use crate::legacy;
use std::collections::BTreeSet;
use std::future::Future;
use trail_types::Metadata;

tokio::task_local! {
    static SCOPE: RequestScope;
}

/// Per-unit-of-work versioning context: who is acting, ambient metadata, and
/// whether recording is on.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestScope {
    pub actor: Option<String>,
    pub metadata: Metadata,
    pub enabled: bool,
    /// Item types with recording switched off inside this scope.
    pub disabled_types: BTreeSet<String>,
}

impl Default for RequestScope {
    fn default() -> Self {
        Self {
            actor: None,
            metadata: Metadata::new(),
            enabled: true,
            disabled_types: BTreeSet::new(),
        }
    }
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_enabled_for(&self, item_type: &str) -> bool {
        self.enabled && !self.disabled_types.contains(item_type)
    }
}

/// Run `fut` with `scope` active. The previous scope (or none) is back in place
/// once the future completes, fails, is dropped, or panics.
pub async fn with_scope<F: Future>(scope: RequestScope, fut: F) -> F::Output {
    SCOPE.scope(scope, fut).await
}

/// Synchronous variant of [`with_scope`].
pub fn with_scope_sync<R>(scope: RequestScope, f: impl FnOnce() -> R) -> R {
    SCOPE.sync_scope(scope, f)
}

/// Run `fut` with recording suppressed; actor and metadata are inherited.
pub async fn without_versioning<F: Future>(fut: F) -> F::Output {
    let scope = current_scope().unwrap_or_default().disabled();
    with_scope(scope, fut).await
}

/// Run `fut` with recording suppressed for one item type only.
pub async fn without_versioning_for<F: Future>(item_type: &str, fut: F) -> F::Output {
    let mut scope = current_scope().unwrap_or_default();
    scope.disabled_types.insert(item_type.to_string());
    with_scope(scope, fut).await
}

/// Copy of the active scope, if any.
pub fn current_scope() -> Option<RequestScope> {
    SCOPE.try_with(Clone::clone).ok()
}

/// Actor of the active scope. Outside any scope, falls back to the legacy
/// process-wide actor.
pub fn current_actor() -> Option<String> {
    SCOPE
        .try_with(|s| s.actor.clone())
        .unwrap_or_else(|_| legacy::ambient_actor())
}

pub fn current_metadata() -> Metadata {
    SCOPE.try_with(|s| s.metadata.clone()).unwrap_or_default()
}

pub fn is_enabled() -> bool {
    SCOPE.try_with(|s| s.enabled).unwrap_or(true)
}

pub fn is_enabled_for(item_type: &str) -> bool {
    SCOPE
        .try_with(|s| s.is_enabled_for(item_type))
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn scope_is_restored_after_nested_block() {
        let outer = RequestScope::new().with_actor("outer");
        with_scope(outer, async {
            assert_eq!(current_actor().as_deref(), Some("outer"));
            with_scope(RequestScope::new().with_actor("inner"), async {
                assert_eq!(current_actor().as_deref(), Some("inner"));
            })
            .await;
            assert_eq!(current_actor().as_deref(), Some("outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn scope_is_restored_when_block_fails() {
        with_scope(RequestScope::new().with_actor("outer"), async {
            let res: Result<(), &str> =
                with_scope(RequestScope::new().with_actor("inner"), async { Err("boom") }).await;
            assert!(res.is_err());
            assert_eq!(current_actor().as_deref(), Some("outer"));
        })
        .await;
    }

    #[test]
    fn scope_is_restored_after_panic() {
        with_scope_sync(RequestScope::new().with_actor("outer"), || {
            let caught = std::panic::catch_unwind(|| {
                with_scope_sync(RequestScope::new().with_actor("inner"), || {
                    panic!("inner block failed");
                })
            });
            assert!(caught.is_err());
            assert_eq!(current_actor().as_deref(), Some("outer"));
        });
    }

    #[tokio::test]
    async fn without_versioning_keeps_actor_and_restores_enabled() {
        let scope = RequestScope::new()
            .with_actor("alice")
            .with_metadata("ip", serde_json::json!("127.0.0.1"));
        with_scope(scope, async {
            without_versioning(async {
                assert!(!is_enabled());
                assert_eq!(current_actor().as_deref(), Some("alice"));
                assert_eq!(current_metadata()["ip"], "127.0.0.1");
            })
            .await;
            assert!(is_enabled());
        })
        .await;
    }

    #[tokio::test]
    async fn without_versioning_for_one_type_leaves_others_on() {
        without_versioning_for("Widget", async {
            assert!(is_enabled());
            assert!(!is_enabled_for("Widget"));
            assert!(is_enabled_for("Gadget"));
        })
        .await;
        assert!(is_enabled_for("Widget"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_scopes_never_see_each_other() {
        let mut handles = Vec::new();
        for i in 0..16 {
            handles.push(tokio::spawn(async move {
                let me = format!("user-{}", i);
                with_scope(RequestScope::new().with_actor(me.clone()), async move {
                    for _ in 0..10 {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        assert_eq!(current_actor(), Some(me.clone()));
                    }
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn spawned_task_does_not_inherit_scope() {
        with_scope(RequestScope::new().disabled(), async {
            let inner = tokio::spawn(async { is_enabled() }).await.unwrap();
            assert!(inner);
            assert!(!is_enabled());
        })
        .await;
    }
}
