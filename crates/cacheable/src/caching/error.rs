use thiserror::Error;

/// The outcome of a memoized call that did not produce a value.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CallError<E> {
    /// The producer failed. Every caller coalesced onto the invocation receives the same error.
    #[error("producer failed")]
    Producer(#[source] E),
    /// The producer was dropped before it settled, for example because its task panicked or
    /// the runtime shut down.
    #[error("computation for cache `{0}` was cancelled")]
    Cancelled(String),
}

impl<E> CallError<E> {
    /// Returns the producer's error, if that is what this is.
    pub fn into_producer_error(self) -> Option<E> {
        match self {
            Self::Producer(err) => Some(err),
            Self::Cancelled(_) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
