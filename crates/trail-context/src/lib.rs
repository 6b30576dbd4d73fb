//! Request-scoped actor and metadata propagation.
//!
//! A [`RequestScope`] is carried in a tokio task-local for the duration of one
//! unit of work; concurrent tasks never observe each other's scope.

mod legacy;
mod scope;

#[allow(deprecated)]
pub use legacy::{legacy_actor, set_legacy_actor};
pub use scope::{
    current_actor, current_metadata, current_scope, is_enabled, is_enabled_for, with_scope,
    with_scope_sync, without_versioning, without_versioning_for, RequestScope,
};
