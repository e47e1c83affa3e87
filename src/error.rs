//! Error taxonomy shared by every layer of the crate.

use std::{error::Error, io, sync::Arc};

use thiserror::Error;

/// Opaque error object raised by a backend implementation.
///
/// The engine never looks inside this, it is only carried through to the consumer.
pub type BackendError = Arc<dyn Error + Send + Sync + 'static>;

/// Errors reported by [`PvSupport`](crate::PvSupport), the provider and its helpers.
///
/// Cloneable, because a single backend failure during a notification round is
/// delivered to every subscribed consumer.
#[derive(Debug, Clone, Error)]
pub enum PvError {
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("No such process variable: {0}")]
    NotFound(String),
    #[error("Process variable is not writeable")]
    NotWritable,
    #[error("Unavailable: {0}")]
    Unavailable(&'static str),
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    #[error("Backend failure: {0}")]
    BackendFailure(BackendError),
    #[error("IO Error: {0}")]
    Io(Arc<io::Error>),
}

impl PvError {
    /// Wrap any backend-specific error as an opaque [`PvError::BackendFailure`]
    pub fn backend<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        PvError::BackendFailure(Arc::new(error))
    }
}

impl From<io::Error> for PvError {
    fn from(err: io::Error) -> Self {
        PvError::Io(Arc::new(err))
    }
}
