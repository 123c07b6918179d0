use crate::codec::CodecError;
use crate::pipeline::PipelineError;

/// Failure of a turn or a transaction. Application-level failures are
/// [`crate::Rejection`] values carried by promises instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("query transaction modified persistent state")]
    ProhibitedModification,
    #[error("transaction already in progress")]
    Reentrant,
    #[error("no such object: {0}")]
    NoSuchObject(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
