//! Error surface (§7): every fallible entry point returns `Result<_, AllocError>`
//! instead of the C convention of a null pointer plus an implicit `errno`. A
//! thread-local "last error" cell is still kept alongside it, since the
//! `GlobalAlloc` facade (`lib.rs`) cannot thread a `Result` through the trait's
//! raw-pointer return type and needs somewhere to leave a diagnostic.

use core::cell::Cell;
use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// A zero or non-power-of-two alignment, or a size that would overflow
    /// `isize` once rounded up to the requested alignment.
    InvalidArgument,
    /// The backing OS memory source refused to satisfy a map/commit request.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidArgument => f.write_str("invalid allocation argument"),
            AllocError::OutOfMemory => f.write_str("out of memory"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

#[cfg(feature = "std")]
std::thread_local! {
    static LAST_ERROR: Cell<Option<AllocError>> = Cell::new(None);
}

/// Record an error for the current thread and log it at the appropriate level.
/// Called from the facade right before a raw-pointer API surfaces `null`.
pub fn set_last_error(err: AllocError) {
    match err {
        AllocError::InvalidArgument => log::warn!("{err}"),
        AllocError::OutOfMemory => log::error!("{err}"),
    }
    #[cfg(feature = "std")]
    LAST_ERROR.with(|cell| cell.set(Some(err)));
}

/// Retrieve (without clearing) the last error recorded on the current thread.
#[cfg(feature = "std")]
pub fn last_error() -> Option<AllocError> {
    LAST_ERROR.with(|cell| cell.get())
}

#[cfg(not(feature = "std"))]
pub fn last_error() -> Option<AllocError> {
    None
}
