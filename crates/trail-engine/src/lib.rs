//! Versioning engine: decides when a mutation is recorded, builds its
//! changeset, writes it inside the caller's unit of work, and rebuilds past
//! states on read.

mod association;
mod changeset;
mod config;
mod controller;
mod error;
mod policy;
mod reify;
mod tracked;

#[cfg(test)]
mod testutil;

pub use association::{Association, OwnerDestroy};
pub use changeset::ChangesetBuilder;
pub use config::TrailConfig;
pub use controller::{Trail, TypedChangeset, UnitOfWork};
pub use error::TrailError;
pub use policy::{AttributeFilter, PolicyConfigurationError, VersionPolicy};
pub use reify::ReifyOptions;
pub use tracked::{Liveness, Tracked, VersioningState};

pub use trail_context::{with_scope, without_versioning, RequestScope};
pub use trail_types::*;
