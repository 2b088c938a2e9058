//! Error definitions shared across library modules.
//! Each type models a specific failure scenario (CAN identifier
//! construction, message validation).
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Errors that can occur while building a 29-bit CAN identifier.
pub enum CanIdBuildError {
    /// The PGN does not fit in eighteen bits.
    #[error("Invalid parameter group number: {0:#X}")]
    InvalidParameterGroupNumber(u32),
    /// Attempt to send a broadcast-format PGN (PF >= 240) to a specific
    /// destination.
    #[error("PGN {pgn:#X} is broadcast-format and cannot carry a destination")]
    InvalidForDestinationSpecific { pgn: u32 },
    /// In PDU1 the lower eight bits of the PGN must remain zero.
    #[error("Destination-specific PGNs require a zero PS byte")]
    PsMustBeNull,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Reasons a message was refused before reaching the bus.
pub enum SendError {
    /// The source control function is not hosted by this stack.
    #[error("the source is not an internal control function")]
    SourceNotInternal,
    /// The source has no claimed address and the message is not an
    /// address claim.
    #[error("the source holds no valid address")]
    SourceAddressInvalid,
    /// The destination exists but holds no claimable address.
    #[error("the destination holds no valid address")]
    DestinationAddressInvalid,
    /// The payload is empty or exceeds the transport ceiling.
    #[error("payload length {0} is out of range")]
    InvalidLength(usize),
    /// Payloads above eight bytes need a transport protocol, and none
    /// accepted the message.
    #[error("no transport protocol accepted the message")]
    NoProtocol,
    /// Chunk-provider payloads can only be moved by a transport protocol.
    #[error("chunked payloads require a transport protocol")]
    ChunkedWithoutProtocol,
    /// The identifier could not be constructed.
    #[error(transparent)]
    Identifier(#[from] CanIdBuildError),
}
