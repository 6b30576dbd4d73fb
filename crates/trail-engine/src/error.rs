use crate::policy::PolicyConfigurationError;
use trail_types::{CodecError, RecordError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum TrailError {
    #[error("recording failed: {0}")]
    Recording(#[from] StoreError),
    #[error("value codec: {0}")]
    Codec(#[from] CodecError),
    #[error("policy: {0}")]
    Policy(#[from] PolicyConfigurationError),
    #[error("record: {0}")]
    Record(#[from] RecordError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl TrailError {
    /// The version row could not be written; the unit of work must not commit.
    pub fn is_recording_failure(&self) -> bool {
        matches!(self, TrailError::Recording(_) | TrailError::Codec(_))
    }
}
