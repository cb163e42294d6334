use thiserror::Error;

use crate::buffer::AllocationError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("endpoint is not connected")]
    NotConnected,

    #[error("no buffer available without blocking")]
    Busy,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("buffer queue has been abandoned")]
    Abandoned,

    #[error("buffer allocation failed: {0}")]
    Allocation(#[from] AllocationError),
}

pub type Result<T> = std::result::Result<T, QueueError>;
