use thiserror::Error;

use crate::wire::{NoSpace, WireError};

/// Why a reply could not be produced. Either way the packet gets no answer.
#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("reply buffer exhausted")]
    NoSpace,

    #[error("malformed client option: {0}")]
    Malformed(#[from] WireError),

    #[error("{0}")]
    Failure(String),
}

impl From<NoSpace> for ReplyError {
    fn from(_: NoSpace) -> Self {
        ReplyError::NoSpace
    }
}

/// Allocation outcomes that are not a binding.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("no addresses or prefixes available")]
    NoResources,

    #[error("address or prefix already in use")]
    InUse,

    #[error("address or prefix not available")]
    NotAvailable,
}
