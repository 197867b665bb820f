//! Storage and loading error types.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by a [`ForumStore`](crate::store::ForumStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("forum database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    /// The backend could not serve the request at all.
    #[error("storage unavailable: {message}")]
    Unavailable { message: String },
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// The error delivered to a placeholder. A single failed flush hands the same
/// error to every placeholder waiting on it, so this type is cheap to clone.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("batched fetch from {source_name} failed: {error}")]
    Fetch {
        source_name: &'static str,
        #[source]
        error: Arc<StoreError>,
    },

    #[error("batched fetch from {source_name} did not finish within {after:?}")]
    Timeout {
        source_name: &'static str,
        after: Duration,
    },

    /// The request scope was torn down before the value was handed out.
    #[error("request scope closed before {source_name} resolved")]
    ScopeClosed { source_name: &'static str },
}

impl LoadError {
    pub(crate) fn fetch(source_name: &'static str, error: StoreError) -> Self {
        LoadError::Fetch {
            source_name,
            error: Arc::new(error),
        }
    }

    pub fn source_name(&self) -> &'static str {
        match self {
            LoadError::Fetch { source_name, .. }
            | LoadError::Timeout { source_name, .. }
            | LoadError::ScopeClosed { source_name } => source_name,
        }
    }
}

pub type LoadResult<T> = Result<T, LoadError>;
