//! HTTP surface for versioned documents.

pub mod document;
pub mod server;
