use reef_base::Hash;

/// Errors surfaced by the chunk store and the feed layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested feed or chunk does not exist.
    #[error("not found")]
    NotFound,

    /// The block layer kept failing after the configured retries.
    #[error("chunk {0} unavailable")]
    ChunkUnavailable(Hash),

    /// An update with a different payload already occupies the chosen epoch.
    #[error("conflicting update at the chosen epoch")]
    Conflict,

    /// A feed already exists for this `(topic, owner)` pair.
    #[error("feed already exists")]
    AlreadyExists,

    /// A reachable chunk failed its decoding invariants.
    #[error("corrupt chunk: {0}")]
    Corrupt(&'static str),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Malformed input.
    #[error("invalid input: {0}")]
    Invalid(String),
}

impl Error {
    /// Whether this error is a plain lookup miss, as opposed to a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}
