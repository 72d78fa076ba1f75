//! Main Crate Error

use std::net::SocketAddr;

#[derive(thiserror::Error, Debug)]
/// Cairn crate error enum.
pub enum Error {
    /// The transport could not decode an inbound datagram.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A response carried a transaction id matching no outstanding request.
    #[error("Unexpected transaction id: {0}")]
    UnexpectedTransactionId(u16),

    /// The datagram came from an address no peer can legitimately use.
    #[error("Martian address: {0}")]
    MartianAddress(SocketAddr),

    /// The source address is administratively or dynamically blacklisted.
    #[error("Blacklisted address: {0}")]
    BlacklistedAddress(SocketAddr),

    /// A remote node answered a request with a protocol error.
    #[error("Protocol error {code}: {description}")]
    Protocol {
        /// Numeric error code as carried on the wire.
        code: u16,
        /// Human readable error description.
        description: String,
    },

    /// Accepting a value would exceed the storage budget.
    #[error("Storage is full")]
    StorageFull,

    /// Indicates that an id is not [ID_SIZE](crate::common::ID_SIZE) bytes.
    #[error("Invalid id size: {0}")]
    InvalidIdSize(usize),

    /// Failed to decode a values export blob.
    #[error("Failed to decode values export: {0}")]
    ValuesDecode(#[from] bincode::Error),
}
