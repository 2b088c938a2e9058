//! The network layer: per-bus management of addresses and control
//! functions, the address-claim machinery, message dispatch, and the
//! transport-protocol plug-in surface.
pub mod address_claim;
pub mod callbacks;
pub mod control_function;
pub mod manager;
pub mod message;
pub mod protocol;

pub(crate) mod busload;
