//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame or metadata size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// A sync flag is set but no correlation id was supplied
    #[error("sync envelope missing correlation id")]
    MissingCorrelation,

    /// Metadata key is not valid UTF-8
    #[error("metadata key is not valid utf-8")]
    MetaKey,

    /// Reserved flag bits nonzero
    #[error("reserved flag bits nonzero")]
    Reserved,

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,
}
