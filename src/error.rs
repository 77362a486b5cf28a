//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Kadnode crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Id is not 20 bytes long.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Id is not 40 hex characters.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// Request payload exceeds [crate::rpc::MAX_REQUEST_SIZE], nothing was sent.
    #[error("Request is too large to send: {0} bytes")]
    RequestTooLarge(usize),

    /// Frame is too short or has an unknown kind byte.
    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Request for a method other than `ping`, `store`, `find_node` and `find_value`.
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// Saved state file is not a valid snapshot.
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error(transparent)]
    /// Transparent [crate::DhtWasShutdown]
    DhtWasShutdown(#[from] crate::DhtWasShutdown),
}

/// Alias for `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
