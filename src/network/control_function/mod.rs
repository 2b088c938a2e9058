//! Logical bus participants. A control function pairs a NAME with a
//! current address and belongs to exactly one network. The three variants
//! share one struct with a tagged kind:
//!
//! - **Internal**: hosted by this stack; the only variant that claims and
//!   defends an address.
//! - **External**: another device observed on the bus.
//! - **Partnered**: an external device the application wants to talk to,
//!   described by NAME filters and bound once a matching claim is seen.
use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::core::NULL_ADDRESS;
use crate::network::address_claim::{AddressClaimStateMachine, ClaimState};
use crate::network::callbacks::{MessageCallback, PgnCallbackRegistry};
use crate::network::manager::NetworkManager;
use crate::protocol::name::{Name, NameFilter};

/// Discriminates the three control-function variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlFunctionType {
    Internal,
    External,
    Partnered,
}

impl fmt::Display for ControlFunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlFunctionType::Internal => write!(f, "internal"),
            ControlFunctionType::External => write!(f, "external"),
            ControlFunctionType::Partnered => write!(f, "partnered"),
        }
    }
}

pub(crate) enum Kind {
    Internal {
        state_machine: Mutex<AddressClaimStateMachine>,
    },
    External,
    Partnered(PartnerState),
}

pub(crate) struct PartnerState {
    pub(crate) filters: Vec<NameFilter>,
    pub(crate) bound: AtomicBool,
    pub(crate) callbacks: PgnCallbackRegistry,
}

/// One participant on a bus. Created through the factory methods on
/// [`NetworkManager`]; shared by reference between the network's registries
/// and the application.
pub struct ControlFunction {
    name: Mutex<Name>,
    address: AtomicU8,
    network: Weak<NetworkManager>,
    kind: Kind,
}

impl ControlFunction {
    pub(crate) fn new_internal(
        name: Name,
        preferred_address: u8,
        network: Weak<NetworkManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: Mutex::new(name),
            address: AtomicU8::new(NULL_ADDRESS),
            network,
            kind: Kind::Internal {
                state_machine: Mutex::new(AddressClaimStateMachine::new(name, preferred_address)),
            },
        })
    }

    pub(crate) fn new_external(
        name: Name,
        address: u8,
        network: Weak<NetworkManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: Mutex::new(name),
            address: AtomicU8::new(address),
            network,
            kind: Kind::External,
        })
    }

    pub(crate) fn new_partnered(
        filters: Vec<NameFilter>,
        network: Weak<NetworkManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: Mutex::new(Name::from_raw(0)),
            address: AtomicU8::new(NULL_ADDRESS),
            network,
            kind: Kind::Partnered(PartnerState {
                filters,
                bound: AtomicBool::new(false),
                callbacks: PgnCallbackRegistry::new(),
            }),
        })
    }

    /// Current bus address. `0xFE` while unclaimed or after losing
    /// arbitration.
    pub fn address(&self) -> u8 {
        self.address.load(Ordering::SeqCst)
    }

    /// `true` when the address is neither null nor global.
    pub fn is_address_valid(&self) -> bool {
        self.address() < NULL_ADDRESS
    }

    /// The NAME announced in this control function's address claim.
    pub fn name(&self) -> Name {
        *self.name.lock().unwrap()
    }

    /// The variant of this control function.
    pub fn control_function_type(&self) -> ControlFunctionType {
        match self.kind {
            Kind::Internal { .. } => ControlFunctionType::Internal,
            Kind::External => ControlFunctionType::External,
            Kind::Partnered(_) => ControlFunctionType::Partnered,
        }
    }

    /// The network this control function lives on, while it still exists.
    pub fn network(&self) -> Option<Arc<NetworkManager>> {
        self.network.upgrade()
    }

    /// Claim progress of an internal control function, `None` for the other
    /// variants.
    pub fn claim_state(&self) -> Option<ClaimState> {
        match &self.kind {
            Kind::Internal { state_machine } => Some(state_machine.lock().unwrap().state()),
            _ => None,
        }
    }

    /// Preferred address of an internal control function.
    pub fn preferred_address(&self) -> Option<u8> {
        match &self.kind {
            Kind::Internal { state_machine } => {
                Some(state_machine.lock().unwrap().preferred_address())
            }
            _ => None,
        }
    }

    /// Restart arbitration at the preferred address. Only meaningful for an
    /// internal control function; returns `false` otherwise.
    pub fn reclaim(&self) -> bool {
        match &self.kind {
            Kind::Internal { state_machine } => {
                state_machine
                    .lock()
                    .unwrap()
                    .reclaim(std::time::Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Whether a partnered control function has been bound to a device on
    /// the bus. Always `false` for the other variants.
    pub fn is_bound(&self) -> bool {
        match &self.kind {
            Kind::Partnered(partner) => partner.bound.load(Ordering::SeqCst),
            _ => false,
        }
    }

    /// The NAME filters of a partnered control function.
    pub fn name_filters(&self) -> &[NameFilter] {
        match &self.kind {
            Kind::Partnered(partner) => &partner.filters,
            _ => &[],
        }
    }

    /// Check a NAME against a partner's filter set (conjunction over all
    /// filters). `false` for non-partnered control functions.
    pub fn matches_name(&self, name: &Name) -> bool {
        match &self.kind {
            Kind::Partnered(partner) => {
                partner.filters.iter().all(|filter| filter.matches(name))
            }
            _ => false,
        }
    }

    /// Register a callback on a partnered control function for messages it
    /// sends to one of our internal control functions. Returns `false` for
    /// other variants and for duplicate registrations.
    pub fn add_pgn_callback(&self, pgn: u32, callback: MessageCallback) -> bool {
        match &self.kind {
            Kind::Partnered(partner) => partner.callbacks.add(pgn, callback),
            _ => false,
        }
    }

    /// Remove a callback registered with [`add_pgn_callback`].
    ///
    /// [`add_pgn_callback`]: Self::add_pgn_callback
    pub fn remove_pgn_callback(&self, pgn: u32, callback: &MessageCallback) -> bool {
        match &self.kind {
            Kind::Partnered(partner) => partner.callbacks.remove(pgn, callback),
            _ => false,
        }
    }

    pub(crate) fn set_address(&self, address: u8) {
        self.address.store(address, Ordering::SeqCst);
    }

    pub(crate) fn set_name(&self, name: Name) {
        *self.name.lock().unwrap() = name;
    }

    pub(crate) fn state_machine(&self) -> Option<&Mutex<AddressClaimStateMachine>> {
        match &self.kind {
            Kind::Internal { state_machine } => Some(state_machine),
            _ => None,
        }
    }

    pub(crate) fn partner_state(&self) -> Option<&PartnerState> {
        match &self.kind {
            Kind::Partnered(partner) => Some(partner),
            _ => None,
        }
    }
}

impl fmt::Debug for ControlFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlFunction")
            .field("type", &self.control_function_type())
            .field("name", &self.name())
            .field("address", &self.address())
            .finish()
    }
}
