use std::time::Duration;

use thiserror::Error;

use crate::store::DocRef;

/// Maximum length for transport error details carried in messages
const MAX_ERROR_DETAIL_LENGTH: usize = 500;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Document not found: {0}")]
    NotFound(DocRef),

    #[error("Timed out after {after:?} waiting for {id}")]
    Timeout { id: String, after: Duration },

    #[error("Already listening to {0} - stop listening before binding again")]
    AlreadyBound(String),

    #[error("Not bound to a collection: {0}")]
    Unbound(String),

    #[error("No decoder registered for entity kind {0}")]
    UnregisteredKind(&'static str),

    #[error("Failed to decode {reference}: {source}")]
    Decode {
        reference: DocRef,
        #[source]
        source: serde_json::Error,
    },
}

/// Coarse classification of a [`SyncError`], for callers that branch on the
/// failure type rather than the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    NotFound,
    Timeout,
    Programmer,
    Decode,
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Truncate a transport detail to avoid logging excessive data
    fn truncate_detail(detail: &str) -> String {
        if detail.len() <= MAX_ERROR_DETAIL_LENGTH {
            detail.to_string()
        } else {
            let mut end = MAX_ERROR_DETAIL_LENGTH;
            while !detail.is_char_boundary(end) {
                end -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &detail[..end],
                detail.len()
            )
        }
    }

    pub fn transport(detail: impl AsRef<str>) -> Self {
        SyncError::Transport(Self::truncate_detail(detail.as_ref()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transport(_) => ErrorKind::Transport,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Timeout { .. } => ErrorKind::Timeout,
            SyncError::AlreadyBound(_) | SyncError::Unbound(_) | SyncError::UnregisteredKind(_) => {
                ErrorKind::Programmer
            }
            SyncError::Decode { .. } => ErrorKind::Decode,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}
