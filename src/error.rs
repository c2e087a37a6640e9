//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// krpc-dht crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    /// Errors related to parsing DHT messages.
    BencodeError(#[from] serde_bencode::Error),

    /// Id is not 20 bytes long.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// A decoded packet failed structural verification.
    #[error("Malformed message: {0}")]
    MalformedMessage(&'static str),

    /// Compact node or address info of an unexpected length.
    #[error("Invalid compact info: {0}")]
    InvalidCompactInfo(&'static str),

    /// A method registry misses handlers for required verbs.
    #[error("Missing handlers for methods: {0:?}")]
    MissingHandlers(Vec<&'static str>),

    #[error(transparent)]
    /// The node's actor thread is gone.
    DhtWasShutdown(#[from] crate::dht::DhtWasShutdown),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
