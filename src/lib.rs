//! `agribus` library: an ISO 11783 / SAE J1939 CAN stack. The crate exposes
//! the hardware pump (multi-channel frame I/O over pluggable transports),
//! the per-network manager (address table, busload, PGN dispatch), and the
//! address-claim machinery that gives locally hosted control functions
//! their bus addresses.
//==================================================================================
/// Constants shared across the stack: reserved addresses, timing, and
/// queue bounds.
pub mod core;
/// Domain errors (CAN identifier construction, transmission, storage).
pub mod error;
/// The hardware pump, the storage pump, their plugin contracts, and the
/// bundled plugins.
pub mod hardware;
/// Per-network management: address table, control functions, address
/// claiming, dispatch, and transport-protocol plug-ins.
pub mod network;
/// Wire-level types: identifiers, frames, and NAMEs.
pub mod protocol;
//==================================================================================
