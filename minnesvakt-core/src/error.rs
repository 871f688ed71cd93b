use thiserror::Error;

/// Storage acquisition failure conditions.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Allocation request could not be satisfied")]
    OutOfMemory,

    #[error("Pool has no free blocks")]
    PoolExhausted,

    #[error("Request of {requested} bytes does not fit a {block_size}-byte block")]
    BlockOverflow { requested: usize, block_size: usize },
}

/// Outcome of two-step construction: storage acquisition first, then
/// in-place initialization.
///
/// `Init` carries the initializer's error unchanged, so the caller observes
/// exactly the failure its constructor produced.
#[derive(Debug, Error)]
pub enum EmplaceError<E> {
    #[error("Storage acquisition failed: {0}")]
    Alloc(#[from] MemoryError),

    #[error("Initialization failed: {0}")]
    Init(E),
}
