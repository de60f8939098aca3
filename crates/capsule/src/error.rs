//! Supervisor error type

use capsule_seal::SealError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The slot table is full
    #[error("no free slot")]
    NoFreeSlot,

    /// Operation on a slot that holds no container
    #[error("slot {0} is not allocated")]
    SlotNotAllocated(usize),

    /// Operation requiring a sealed code section before sealing happened
    #[error("slot {0} is not sealed")]
    NotSealed(usize),

    /// Two engines registered for the same runtime type
    #[error("engine type {0} already registered")]
    DuplicateEngine(u8),

    /// Metadata parsing or token verification failed
    #[error(transparent)]
    Seal(#[from] SealError),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
