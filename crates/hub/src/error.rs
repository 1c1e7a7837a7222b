//! Error types for store access and feeding operations.

use crate::schedule::FeedingState;

/// Failure inside a realtime store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("stored value at '{path}' is not valid JSON: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The combined initial read failed for one or more keys.
///
/// `recovered` holds every key that did load, with the prior value kept for the
/// keys listed in `failed_keys`.
#[derive(Debug, thiserror::Error)]
#[error("failed to load {} for pond '{pond_id}'", failed_keys.join(", "))]
pub struct LoadError {
    pub pond_id: String,
    pub failed_keys: Vec<&'static str>,
    pub recovered: FeedingState,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// A write did not complete; the attempted change is not committed.
    #[error("failed to persist {what}: {source}")]
    Persistence {
        what: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("failed to read {what}: {source}")]
    Read {
        what: &'static str,
        #[source]
        source: StoreError,
    },

    /// Input rejected before any store call.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("unknown pond '{0}'")]
    UnknownPond(String),
}

impl FeedError {
    pub(crate) fn persistence(what: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Persistence { what, source }
    }

    pub(crate) fn read(what: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Read { what, source }
    }
}
