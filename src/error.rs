use std::fmt;

/// Returned by `push` once the admission point is closed.
///
/// Carries the rejected item back to the caller.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PushError<T>(pub T);

impl<T> PushError<T> {
    #[inline]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("PushError(..)")
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("push on a closed queue")
    }
}

impl<T> std::error::Error for PushError<T> {}

/// Error raised by [MutableQueue::resize].
///
/// [MutableQueue::resize]: crate::MutableQueue::resize
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeError {
    /// Control channel is full. Transient - try again later.
    Rejected,
    /// Admission point is already closed.
    Closed,
}

impl fmt::Display for ResizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => f.write_str("resize rejected, too many pending requests"),
            Self::Closed => f.write_str("resize on a closed queue"),
        }
    }
}

impl std::error::Error for ResizeError {}
