/// Errors surfaced by indexes, tables and the registry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested key, document or table does not exist.
    #[error("not found")]
    NotFound,

    /// Writing to an immutable table.
    #[error("table is read only")]
    ReadOnly,

    /// A seek with `start` past `end`.
    #[error("invalid range: start is past end")]
    InvalidRange,

    /// A reachable chunk failed its decoding invariants.
    #[error("corrupt manifest: {0}")]
    Corrupt(&'static str),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Malformed input.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// A table with this name already exists.
    #[error("table {0} already exists")]
    AlreadyExists(String),

    /// The table is not open on this registry.
    #[error("table {0} is not open")]
    NotOpen(String),

    /// An error bubbling up from the feed or block layer.
    #[error(transparent)]
    Feed(#[from] reef_feed::Error),
}

impl Error {
    /// Whether this error is a plain lookup miss, as opposed to a failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound => true,
            Error::Feed(err) => err.is_not_found(),
            _ => false,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }
}
