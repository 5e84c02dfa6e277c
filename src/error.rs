use thiserror::Error;

/// Errors surfaced by the endpoint API and by internal submission paths.
///
/// `Exhausted` is the transport's EAGAIN: a transient shortage of packets,
/// entries or device queue slots. Callers (and the progress engine) retry;
/// nothing is lost when it is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A pool, queue or device ring is temporarily full. Retry after progress.
    #[error("resources temporarily exhausted, retry after progress")]
    Exhausted,

    /// The remote peer signalled receiver-not-ready for a posted send.
    #[error("receiver not ready")]
    ReceiverNotReady,

    /// A non-transient resource failure (e.g. memory registration failed).
    #[error("resource failure: {0}")]
    Resource(String),

    /// The caller passed something the endpoint cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The operation was cancelled before it matched.
    #[error("operation cancelled")]
    Cancelled,

    /// An inbound packet could not be parsed.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// The device reported a completion error that is not RNR.
    #[error("device error {0}")]
    Device(i32),

    /// A message arrived for which no matching receive could be found or
    /// staged (truncation, staging pool permanently unavailable).
    #[error("message truncated: buffer of {provided} bytes for {required} byte message")]
    Truncated { required: u64, provided: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient errors resolve themselves through progress; everything else
    /// is reported to the operation's owner.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Exhausted | Error::ReceiverNotReady)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::exhausted(Error::Exhausted, true)]
    #[case::rnr(Error::ReceiverNotReady, true)]
    #[case::resource(Error::Resource("mr".to_string()), false)]
    #[case::cancelled(Error::Cancelled, false)]
    #[case::device(Error::Device(-12), false)]
    fn test_is_transient(#[case] error: Error, #[case] expected: bool) {
        assert_eq!(error.is_transient(), expected);
    }
}
