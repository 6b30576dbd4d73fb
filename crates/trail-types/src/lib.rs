//! Core types and traits for the record versioning engine.
//!
//! Versions, changesets, typed values and their codecs, and the storage
//! traits that backends implement.

mod codec;
mod traits;
mod value;
mod version;

pub use codec::*;
pub use traits::*;
pub use value::*;
pub use version::*;
