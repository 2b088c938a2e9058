//! SAE J1939-81 address-claim state machine: emit PGN 0x00EE00, listen for
//! conflicts during the contention window, defend a held address, and fall
//! back through the dynamic range when arbitration is lost.
//!
//! One machine is owned by each internal control function and is driven by
//! the network's periodic update. Competing claims reach it through
//! [`AddressClaimStateMachine::process_competing_claim`] after the network
//! has already updated its address table.
use std::time::{Duration, Instant};

use crate::core::{
    ADDRESS_CONTENTION_TIME_MS, CLAIM_HOLDOFF_SPAN_MS, GLOBAL_ADDRESS, NULL_ADDRESS,
    PGN_ADDRESS_CLAIM, PGN_REQUEST,
};
use crate::protocol::can_frame::Frame;
use crate::protocol::can_id::CanId;
use crate::protocol::name::Name;

/// Claim progress of one internal control function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimState {
    /// Machine constructed, hold-off not yet scheduled.
    Idle,
    /// Waiting out the per-NAME hold-off before requesting claims.
    WaitingForClaim,
    /// Request sent; collecting competing claims for the contention window.
    Claiming,
    /// Address won and defended.
    AddressClaimed,
    /// Arbitration lost with a fixed address; sends stay disabled until a
    /// reclaim is requested.
    UnableToClaim,
}

/// What the machine needs from its network: a way to put frames on the wire
/// and a view of which dynamic addresses are free.
pub(crate) trait ClaimEnvironment {
    fn transmit(&self, frame: Frame) -> bool;
    /// First free address in the 128..=247 range, preferring `start`.
    fn next_free_dynamic_address(&self, start: u8) -> Option<u8>;
}

pub(crate) struct AddressClaimStateMachine {
    name: Name,
    preferred_address: u8,
    target_address: u8,
    state: ClaimState,
    entered_state: Instant,
    holdoff: Duration,
}

impl AddressClaimStateMachine {
    pub(crate) fn new(name: Name, preferred_address: u8) -> Self {
        Self {
            name,
            preferred_address,
            target_address: preferred_address,
            state: ClaimState::Idle,
            entered_state: Instant::now(),
            holdoff: Duration::from_millis(claim_holdoff_ms(name.raw())),
        }
    }

    pub(crate) fn state(&self) -> ClaimState {
        self.state
    }

    pub(crate) fn preferred_address(&self) -> u8 {
        self.preferred_address
    }

    /// Address the machine currently holds: the target while claimed, the
    /// null address otherwise.
    pub(crate) fn claimed_address(&self) -> u8 {
        if self.state == ClaimState::AddressClaimed {
            self.target_address
        } else {
            NULL_ADDRESS
        }
    }

    /// Advance timers. Called on every network update.
    pub(crate) fn update(&mut self, now: Instant, env: &dyn ClaimEnvironment) {
        match self.state {
            ClaimState::Idle => {
                self.enter(ClaimState::WaitingForClaim, now);
            }
            ClaimState::WaitingForClaim => {
                if now.duration_since(self.entered_state) >= self.holdoff {
                    if env.transmit(request_for_claim_frame()) {
                        self.enter(ClaimState::Claiming, now);
                    } else {
                        log::warn!(
                            "[AC] {}: could not send the request for address claim",
                            self.name
                        );
                    }
                }
            }
            ClaimState::Claiming => {
                let contention = Duration::from_millis(ADDRESS_CONTENTION_TIME_MS);
                if now.duration_since(self.entered_state) >= contention {
                    if env.transmit(address_claim_frame(self.name, self.target_address)) {
                        log::info!(
                            "[AC] {}: claimed address {}",
                            self.name,
                            self.target_address
                        );
                        self.enter(ClaimState::AddressClaimed, now);
                    } else {
                        // No channel yet; restart the window and retry.
                        self.enter(ClaimState::Claiming, now);
                    }
                }
            }
            ClaimState::AddressClaimed | ClaimState::UnableToClaim => {}
        }
    }

    /// Handle a competing claim overheard on the bus. The network calls this
    /// for every address-claim frame after updating its own table.
    pub(crate) fn process_competing_claim(
        &mut self,
        their_name: Name,
        claimed_address: u8,
        now: Instant,
        env: &dyn ClaimEnvironment,
    ) {
        if claimed_address != self.target_address || their_name == self.name {
            return;
        }
        if !matches!(self.state, ClaimState::Claiming | ClaimState::AddressClaimed) {
            return;
        }

        if self.name < their_name {
            // Lower NAME wins: keep the address and, once claimed, defend it.
            if self.state == ClaimState::AddressClaimed {
                env.transmit(address_claim_frame(self.name, self.target_address));
            }
        } else if self.name.is_arbitrary_address_capable() {
            match env.next_free_dynamic_address(self.target_address) {
                Some(address) => {
                    log::warn!(
                        "[AC] {}: lost address {} to {}, moving to {}",
                        self.name,
                        claimed_address,
                        their_name,
                        address
                    );
                    self.target_address = address;
                    self.enter(ClaimState::Claiming, now);
                }
                None => self.fail_claim(env),
            }
        } else {
            log::warn!(
                "[AC] {}: lost address {} to {} and cannot arbitrate",
                self.name,
                claimed_address,
                their_name
            );
            self.fail_claim(env);
        }
    }

    /// Answer a request for the address-claim PGN.
    pub(crate) fn process_request_for_claim(&self, env: &dyn ClaimEnvironment) {
        match self.state {
            ClaimState::AddressClaimed => {
                env.transmit(address_claim_frame(self.name, self.target_address));
            }
            ClaimState::UnableToClaim => {
                env.transmit(cannot_claim_frame(self.name));
            }
            _ => {}
        }
    }

    /// Adopt a commanded address and re-claim it.
    pub(crate) fn process_commanded_address(&mut self, address: u8, now: Instant) {
        log::info!("[AC] {}: commanded to address {}", self.name, address);
        self.preferred_address = address;
        self.target_address = address;
        self.enter(ClaimState::Claiming, now);
    }

    /// Restart arbitration at the preferred address.
    pub(crate) fn reclaim(&mut self, now: Instant) {
        self.target_address = self.preferred_address;
        self.enter(ClaimState::Claiming, now);
    }

    fn enter(&mut self, state: ClaimState, now: Instant) {
        self.state = state;
        self.entered_state = now;
    }

    fn fail_claim(&mut self, env: &dyn ClaimEnvironment) {
        env.transmit(cannot_claim_frame(self.name));
        self.target_address = NULL_ADDRESS;
        self.state = ClaimState::UnableToClaim;
    }
}

/// Stable per-NAME hold-off in 0..=153 ms. A 64-bit integer mix spreads
/// neighbouring NAMEs across the span without any RNG state.
fn claim_holdoff_ms(raw_name: u64) -> u64 {
    let mut mixed = raw_name.wrapping_add(0x9E37_79B9_7F4A_7C15);
    mixed = (mixed ^ (mixed >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    mixed = (mixed ^ (mixed >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    mixed ^= mixed >> 31;
    mixed % CLAIM_HOLDOFF_SPAN_MS
}

/// Claim frame: PGN 0x00EE00 to the global address, NAME as payload.
pub(crate) fn address_claim_frame(name: Name, source_address: u8) -> Frame {
    let id = CanId::builder(PGN_ADDRESS_CLAIM, source_address)
        .to_destination(GLOBAL_ADDRESS)
        .with_priority(6)
        .build()
        .expect("the address-claim PGN with a global destination always builds");
    Frame::new(id, &name.to_le_bytes())
}

/// Cannot-claim frame: an address claim sent from the null address.
fn cannot_claim_frame(name: Name) -> Frame {
    address_claim_frame(name, NULL_ADDRESS)
}

/// Request for the address-claim PGN, sent to every node from the null
/// address before we hold one ourselves.
fn request_for_claim_frame() -> Frame {
    let id = CanId::builder(PGN_REQUEST, NULL_ADDRESS)
        .to_destination(GLOBAL_ADDRESS)
        .with_priority(6)
        .build()
        .expect("the request PGN with a global destination always builds");
    Frame::new(id, &PGN_ADDRESS_CLAIM.to_le_bytes()[..3])
}
