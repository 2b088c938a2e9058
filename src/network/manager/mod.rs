//! Per-network state: the address table, control-function registries, RX
//! dispatch, transmit paths, busload accounting, and the hooks transport
//! protocols and the hardware pump plug into.
//!
//! One `NetworkManager` exists per physical bus. The hardware interface
//! pushes received frames in with [`NetworkManager::process_received_frame`]
//! and drives [`NetworkManager::update`] from its periodic tick; everything
//! time-based in the stack hangs off that heartbeat.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::core::{
    ADDRESS_TABLE_SIZE, CAN_DATA_LENGTH, COMMANDED_ADDRESS_LENGTH, DYNAMIC_ADDRESS_RANGE_END,
    DYNAMIC_ADDRESS_RANGE_START, MAX_MESSAGE_LENGTH, NULL_ADDRESS, PGN_ADDRESS_CLAIM,
    PGN_COMMANDED_ADDRESS, PGN_REQUEST,
};
use crate::error::SendError;
use crate::network::busload::BusloadEstimator;
use crate::network::callbacks::{MessageCallback, PgnCallbackRegistry};
use crate::network::control_function::{ControlFunction, ControlFunctionType};
use crate::network::address_claim::ClaimEnvironment;
use crate::network::message::CanMessage;
use crate::network::protocol::{
    OutboundMessage, OutboundPayload, ProtocolHandle, TransmitCompleteCallback, TransportProtocol,
};
use crate::protocol::can_frame::Frame;
use crate::protocol::can_id::CanId;
use crate::protocol::name::{Name, NameFilter};

/// Egress for frames leaving this network. The hardware interface installs
/// one per assigned channel; tests install recording or cross-wired sinks.
pub trait FrameSink: Send + Sync {
    /// Queue one frame for transmission. Returns `false` when the channel
    /// cannot accept it.
    fn transmit(&self, frame: Frame) -> bool;
}

struct NetworkState {
    address_table: Vec<Option<Arc<ControlFunction>>>,
    inactive: Vec<Arc<ControlFunction>>,
    internal: Vec<Arc<ControlFunction>>,
    partners: Vec<Arc<ControlFunction>>,
    partners_pending: bool,
}

impl NetworkState {
    fn new() -> Self {
        Self {
            address_table: vec![None; ADDRESS_TABLE_SIZE],
            inactive: Vec::new(),
            internal: Vec::new(),
            partners: Vec::new(),
            partners_pending: false,
        }
    }

    fn control_function_at(&self, address: u8) -> Option<Arc<ControlFunction>> {
        if (address as usize) < ADDRESS_TABLE_SIZE {
            self.address_table[address as usize].clone()
        } else {
            None
        }
    }
}

struct ProtocolSlot {
    initialized: bool,
    protocol: Arc<Mutex<Box<dyn TransportProtocol>>>,
}

/// Scans the address table on behalf of a claim state machine and forwards
/// its frames to the channel sink.
struct ClaimEnv<'a> {
    state: &'a NetworkState,
    sink: Option<Arc<dyn FrameSink>>,
}

impl ClaimEnvironment for ClaimEnv<'_> {
    fn transmit(&self, frame: Frame) -> bool {
        match &self.sink {
            Some(sink) => sink.transmit(frame),
            None => {
                log::warn!("[NM]: dropping claim traffic, no hardware channel is attached");
                false
            }
        }
    }

    fn next_free_dynamic_address(&self, start: u8) -> Option<u8> {
        let start = start.clamp(DYNAMIC_ADDRESS_RANGE_START, DYNAMIC_ADDRESS_RANGE_END);
        (start..=DYNAMIC_ADDRESS_RANGE_END)
            .chain(DYNAMIC_ADDRESS_RANGE_START..start)
            .find(|&address| self.state.address_table[address as usize].is_none())
    }
}

/// The manager of one bus: address table, registries, dispatch, and send
/// paths.
pub struct NetworkManager {
    self_ref: Weak<NetworkManager>,
    /// Control-function processing lock. Held across the table and claim
    /// mutation phases of `update` so they observe one consistent snapshot,
    /// and released before any callback or protocol hook runs so those may
    /// call back into the network.
    state: Mutex<NetworkState>,
    rx_queue: Mutex<VecDeque<CanMessage>>,
    busload: Mutex<BusloadEstimator>,
    frame_sink: Mutex<Option<Arc<dyn FrameSink>>>,
    global_callbacks: PgnCallbackRegistry,
    any_cf_callbacks: PgnCallbackRegistry,
    protocols: Mutex<Vec<ProtocolSlot>>,
    protocol_routes: Mutex<Vec<(u32, usize)>>,
}

impl NetworkManager {
    /// Create the manager for one physical bus.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            state: Mutex::new(NetworkState::new()),
            rx_queue: Mutex::new(VecDeque::new()),
            busload: Mutex::new(BusloadEstimator::new()),
            frame_sink: Mutex::new(None),
            global_callbacks: PgnCallbackRegistry::new(),
            any_cf_callbacks: PgnCallbackRegistry::new(),
            protocols: Mutex::new(Vec::new()),
            protocol_routes: Mutex::new(Vec::new()),
        })
    }

    //==============================================================================FACTORIES

    /// Host a new internal control function on this network. Its claim
    /// machine starts on the next update.
    pub fn create_internal_control_function(
        &self,
        name: Name,
        preferred_address: u8,
    ) -> Arc<ControlFunction> {
        if preferred_address >= NULL_ADDRESS {
            log::warn!(
                "[NM]: preferred address {} is reserved and will never be won",
                preferred_address
            );
        }
        let control_function =
            ControlFunction::new_internal(name, preferred_address, self.self_ref.clone());
        self.state
            .lock()
            .unwrap()
            .internal
            .push(Arc::clone(&control_function));
        control_function
    }

    /// Register a partner described by NAME filters. The partner binds to
    /// the first matching external control function seen on the bus.
    pub fn create_partnered_control_function(
        &self,
        filters: Vec<NameFilter>,
    ) -> Arc<ControlFunction> {
        let control_function = ControlFunction::new_partnered(filters, self.self_ref.clone());
        let mut state = self.state.lock().unwrap();
        state.partners.push(Arc::clone(&control_function));
        state.partners_pending = true;
        control_function
    }

    /// Remove a control function from every registry. An active external or
    /// partnered control function is replaced in its slot by a plain
    /// external one, since the device itself is still on the bus.
    pub fn destroy_control_function(&self, control_function: &Arc<ControlFunction>) -> bool {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let mut removed = false;
        for list in [&mut state.internal, &mut state.partners, &mut state.inactive] {
            let before = list.len();
            list.retain(|candidate| !Arc::ptr_eq(candidate, control_function));
            removed |= list.len() != before;
        }
        for index in 0..ADDRESS_TABLE_SIZE {
            let occupied = state.address_table[index]
                .as_ref()
                .is_some_and(|candidate| Arc::ptr_eq(candidate, control_function));
            if occupied {
                removed = true;
                state.address_table[index] =
                    match control_function.control_function_type() {
                        ControlFunctionType::Internal => None,
                        _ => Some(ControlFunction::new_external(
                            control_function.name(),
                            index as u8,
                            self.self_ref.clone(),
                        )),
                    };
            }
        }
        if removed {
            log::debug!(
                "[NM]: {} control function at address {} was destroyed",
                control_function.control_function_type(),
                control_function.address()
            );
        }
        removed
    }

    //==============================================================================LOOKUPS

    /// The control function currently holding `address`, if any.
    pub fn get_control_function(&self, address: u8) -> Option<Arc<ControlFunction>> {
        self.state.lock().unwrap().control_function_at(address)
    }

    /// The internal control functions hosted on this network.
    pub fn internal_control_functions(&self) -> Vec<Arc<ControlFunction>> {
        self.state.lock().unwrap().internal.clone()
    }

    /// Busload percentage over the last ten seconds.
    pub fn get_estimated_busload(&self) -> f32 {
        self.busload.lock().unwrap().percent()
    }

    //==============================================================================HARDWARE_SIDE

    /// Install the egress for this network. Called by the hardware
    /// interface when a channel is assigned.
    pub fn set_frame_sink(&self, sink: Arc<dyn FrameSink>) {
        *self.frame_sink.lock().unwrap() = Some(sink);
    }

    /// Detach the egress. Sends fail until a new sink is installed.
    pub fn clear_frame_sink(&self) {
        *self.frame_sink.lock().unwrap() = None;
    }

    /// Accept one received frame from the hardware. The frame is queued and
    /// dispatched on the next update.
    pub fn process_received_frame(&self, frame: &Frame) {
        self.busload.lock().unwrap().add_bits(frame.on_wire_bits());
        self.rx_queue
            .lock()
            .unwrap()
            .push_back(CanMessage::from_frame(frame));
    }

    /// Account for a frame actually written to the bus.
    pub fn frame_transmitted(&self, frame: &Frame) {
        self.busload.lock().unwrap().add_bits(frame.on_wire_bits());
    }

    /// Number of frames waiting in the receive queue.
    pub fn rx_queue_len(&self) -> usize {
        self.rx_queue.lock().unwrap().len()
    }

    //==============================================================================UPDATE

    /// Drive the network: bind fresh partners, dispatch queued messages,
    /// advance every claim machine, update the protocols, and roll the
    /// busload window. Called from the hardware tick, or directly in
    /// applications that pump the network themselves.
    pub fn update(&self) {
        let now = Instant::now();
        {
            let mut state = self.state.lock().unwrap();
            self.update_new_partners(&mut state);
        }
        self.process_rx_messages(now);
        {
            let mut state = self.state.lock().unwrap();
            self.update_address_claiming(&mut state, now);
        }
        self.update_protocols();
        self.busload.lock().unwrap().roll(now);
    }

    fn current_sink(&self) -> Option<Arc<dyn FrameSink>> {
        self.frame_sink.lock().unwrap().clone()
    }

    /// Transmit a single pre-built frame on this network's channel. This is
    /// the raw path used by claim machinery and transport protocols.
    pub fn send_frame_raw(&self, frame: Frame) -> bool {
        match self.current_sink() {
            Some(sink) => sink.transmit(frame),
            None => false,
        }
    }

    //==============================================================================RX_PIPELINE

    fn process_rx_messages(&self, now: Instant) {
        loop {
            let message = self.rx_queue.lock().unwrap().pop_front();
            let Some(mut message) = message else { break };

            // Table work and reference resolution under the lock.
            let partners = {
                let mut state = self.state.lock().unwrap();
                self.update_address_table(&mut state, &message, now);

                message.set_source(state.control_function_at(message.source_address()));
                message.set_destination(if message.is_broadcast() {
                    None
                } else {
                    state.control_function_at(message.destination_address())
                });
                state.partners.clone()
            };

            // Callbacks and protocol hooks run with the lock released so
            // they may call back into the network (a protocol finishing a
            // reassembly inside `process_message` hands the result to
            // `protocol_message_callback`, which takes the lock itself).
            self.dispatch_protocol_routes(&message);
            self.dispatch_any_cf_callbacks(&message);
            self.dispatch_global_and_partner_callbacks(&partners, &message);

            {
                let mut state = self.state.lock().unwrap();
                self.process_commanded_address(&mut state, &message, now);
                self.process_request_for_claim(&state, &message);
            }
        }
    }

    /// Claim bookkeeping for one received message: update the table, bind
    /// partners seen under a matching NAME, then let every internal claim
    /// machine react to the competing claim.
    fn update_address_table(&self, state: &mut NetworkState, message: &CanMessage, now: Instant) {
        if message.pgn() != PGN_ADDRESS_CLAIM || message.len() != CAN_DATA_LENGTH {
            return;
        }
        let Some(raw_name) = message.u64_le_at(0) else {
            return;
        };
        let claimed_name = Name::from_raw(raw_name);
        let claimed_address = message.source_address();

        // Find the CF we may already track under this NAME: active table,
        // inactive list, then partners.
        let mut found = state
            .address_table
            .iter()
            .flatten()
            .find(|candidate| candidate.name().raw() == raw_name)
            .cloned()
            .or_else(|| {
                state
                    .inactive
                    .iter()
                    .find(|candidate| candidate.name().raw() == raw_name)
                    .cloned()
            });

        if found.is_none() {
            found = state
                .partners
                .iter()
                .find(|partner| {
                    if partner.is_bound() {
                        partner.name().raw() == raw_name
                    } else {
                        partner.matches_name(&claimed_name)
                    }
                })
                .cloned();
            if let Some(partner) = &found {
                if !partner.is_bound() {
                    partner.set_name(claimed_name);
                    if let Some(partner_state) = partner.partner_state() {
                        partner_state
                            .bound
                            .store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                    log::debug!(
                        "[NM]: bound partner to {} at address {}",
                        claimed_name,
                        claimed_address
                    );
                }
            }
        }

        if (claimed_address as usize) < ADDRESS_TABLE_SIZE {
            // Whoever else held that address just lost it.
            let occupant = state.address_table[claimed_address as usize].clone();
            if let Some(existing) = occupant {
                let is_claimant = found
                    .as_ref()
                    .is_some_and(|candidate| Arc::ptr_eq(candidate, &existing));
                if !is_claimant {
                    existing.set_address(NULL_ADDRESS);
                    state.address_table[claimed_address as usize] = None;
                    if existing.control_function_type() != ControlFunctionType::Internal {
                        state.inactive.push(Arc::clone(&existing));
                    }
                    log::debug!(
                        "[NM]: {} control function {} was evicted from address {}",
                        existing.control_function_type(),
                        existing.name(),
                        claimed_address
                    );
                }
            }

            match &found {
                Some(control_function) => {
                    let old_address = control_function.address();
                    if (old_address as usize) < ADDRESS_TABLE_SIZE
                        && old_address != claimed_address
                    {
                        let moved = state.address_table[old_address as usize]
                            .as_ref()
                            .is_some_and(|candidate| Arc::ptr_eq(candidate, control_function));
                        if moved {
                            state.address_table[old_address as usize] = None;
                        }
                    }
                    state
                        .inactive
                        .retain(|candidate| !Arc::ptr_eq(candidate, control_function));
                    control_function.set_address(claimed_address);
                    control_function.set_name(claimed_name);
                    state.address_table[claimed_address as usize] =
                        Some(Arc::clone(control_function));
                    log::debug!(
                        "[NM]: {} control function {} (re-)claimed address {}",
                        control_function.control_function_type(),
                        claimed_name,
                        claimed_address
                    );
                }
                None => {
                    let external = ControlFunction::new_external(
                        claimed_name,
                        claimed_address,
                        self.self_ref.clone(),
                    );
                    state.address_table[claimed_address as usize] = Some(external);
                    log::debug!(
                        "[NM]: new external control function {} at address {}",
                        claimed_name,
                        claimed_address
                    );
                }
            }
        } else if let Some(control_function) = &found {
            // A cannot-claim: the sender holds no address any more.
            let old_address = control_function.address();
            if (old_address as usize) < ADDRESS_TABLE_SIZE {
                let held = state.address_table[old_address as usize]
                    .as_ref()
                    .is_some_and(|candidate| Arc::ptr_eq(candidate, control_function));
                if held {
                    state.address_table[old_address as usize] = None;
                    if control_function.control_function_type() != ControlFunctionType::Internal {
                        state.inactive.push(Arc::clone(control_function));
                    }
                }
            }
            control_function.set_address(NULL_ADDRESS);
        }

        // Every internal claim machine overhears the claim after the table
        // has settled.
        let internals = state.internal.clone();
        let mut outcomes = Vec::with_capacity(internals.len());
        {
            let env = ClaimEnv {
                state: &*state,
                sink: self.current_sink(),
            };
            for control_function in &internals {
                if let Some(state_machine) = control_function.state_machine() {
                    let mut machine = state_machine.lock().unwrap();
                    machine.process_competing_claim(claimed_name, claimed_address, now, &env);
                    outcomes.push((Arc::clone(control_function), machine.claimed_address()));
                }
            }
        }
        for (control_function, address) in outcomes {
            self.apply_internal_address(state, &control_function, address);
        }
    }

    /// Reflect a claim machine's current address in the control function and
    /// the table, evicting any non-matching occupant.
    fn apply_internal_address(
        &self,
        state: &mut NetworkState,
        control_function: &Arc<ControlFunction>,
        new_address: u8,
    ) {
        let old_address = control_function.address();
        if old_address == new_address && new_address >= NULL_ADDRESS {
            return;
        }
        if (old_address as usize) < ADDRESS_TABLE_SIZE && old_address != new_address {
            let held = state.address_table[old_address as usize]
                .as_ref()
                .is_some_and(|candidate| Arc::ptr_eq(candidate, control_function));
            if held {
                state.address_table[old_address as usize] = None;
            }
        }
        control_function.set_address(new_address);
        if (new_address as usize) < ADDRESS_TABLE_SIZE {
            let occupant = state.address_table[new_address as usize].clone();
            match occupant {
                Some(existing) if Arc::ptr_eq(&existing, control_function) => {}
                Some(existing) => {
                    existing.set_address(NULL_ADDRESS);
                    if existing.control_function_type() != ControlFunctionType::Internal {
                        state.inactive.push(Arc::clone(&existing));
                    }
                    log::debug!(
                        "[NM]: {} control function {} was displaced from address {}",
                        existing.control_function_type(),
                        existing.name(),
                        new_address
                    );
                    state.address_table[new_address as usize] =
                        Some(Arc::clone(control_function));
                }
                None => {
                    state.address_table[new_address as usize] =
                        Some(Arc::clone(control_function));
                }
            }
        }
    }

    fn update_address_claiming(&self, state: &mut NetworkState, now: Instant) {
        let internals = state.internal.clone();
        let mut outcomes = Vec::with_capacity(internals.len());
        {
            let env = ClaimEnv {
                state: &*state,
                sink: self.current_sink(),
            };
            for control_function in &internals {
                if let Some(state_machine) = control_function.state_machine() {
                    let mut machine = state_machine.lock().unwrap();
                    machine.update(now, &env);
                    outcomes.push((Arc::clone(control_function), machine.claimed_address()));
                }
            }
        }
        for (control_function, address) in outcomes {
            self.apply_internal_address(state, &control_function, address);
        }
    }

    /// Bind any partner that is still waiting to the first external control
    /// function whose NAME passes its filters. Scans the inactive list
    /// first, then the active table; the matched external is replaced by
    /// the partner.
    fn update_new_partners(&self, state: &mut NetworkState) {
        if !state.partners_pending {
            return;
        }
        state.partners_pending = false;

        let partners = state.partners.clone();
        for partner in partners {
            if partner.is_bound() {
                continue;
            }

            let inactive_match = state.inactive.iter().position(|candidate| {
                candidate.control_function_type() == ControlFunctionType::External
                    && partner.matches_name(&candidate.name())
            });
            if let Some(position) = inactive_match {
                let external = state.inactive.remove(position);
                Self::bind_partner(&partner, &external);
                log::debug!(
                    "[NM]: remapped partner to inactive external control function {}",
                    external.name()
                );
                continue;
            }

            let active_match = state.address_table.iter().position(|slot| {
                slot.as_ref().is_some_and(|candidate| {
                    candidate.control_function_type() == ControlFunctionType::External
                        && partner.matches_name(&candidate.name())
                })
            });
            if let Some(index) = active_match {
                if let Some(external) = state.address_table[index].take() {
                    Self::bind_partner(&partner, &external);
                    state.address_table[index] = Some(Arc::clone(&partner));
                    log::debug!(
                        "[NM]: remapped partner to active external control function at address {}",
                        index
                    );
                }
            }
        }
    }

    fn bind_partner(partner: &Arc<ControlFunction>, external: &Arc<ControlFunction>) {
        partner.set_name(external.name());
        partner.set_address(external.address());
        if let Some(partner_state) = partner.partner_state() {
            partner_state
                .bound
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn dispatch_protocol_routes(&self, message: &CanMessage) {
        let routes: Vec<usize> = self
            .protocol_routes
            .lock()
            .unwrap()
            .iter()
            .filter(|(pgn, _)| *pgn == message.pgn())
            .map(|(_, index)| *index)
            .collect();
        for index in routes {
            let protocol = self
                .protocols
                .lock()
                .unwrap()
                .get(index)
                .map(|slot| Arc::clone(&slot.protocol));
            if let Some(protocol) = protocol {
                protocol.lock().unwrap().process_message(message, self);
            }
        }
    }

    fn dispatch_any_cf_callbacks(&self, message: &CanMessage) {
        let to_internal = message
            .destination_control_function()
            .is_some_and(|cf| cf.control_function_type() == ControlFunctionType::Internal);
        if message.is_broadcast() || to_internal {
            for callback in self.any_cf_callbacks.matching(message.pgn()) {
                callback(message);
            }
        }
    }

    fn dispatch_global_and_partner_callbacks(
        &self,
        partners: &[Arc<ControlFunction>],
        message: &CanMessage,
    ) {
        if message.is_broadcast() {
            // Requests may legitimately come from a node that holds no
            // address yet.
            let anonymous_request =
                message.pgn() == PGN_REQUEST && message.source_address() == NULL_ADDRESS;
            let own = message
                .source_control_function()
                .is_some_and(|cf| cf.control_function_type() == ControlFunctionType::Internal);
            if (message.source_control_function().is_some() || anonymous_request) && !own {
                for callback in self.global_callbacks.matching(message.pgn()) {
                    callback(message);
                }
            }
        } else {
            let to_internal = message
                .destination_control_function()
                .is_some_and(|cf| cf.control_function_type() == ControlFunctionType::Internal);
            if !to_internal {
                return;
            }
            let Some(source) = message.source_control_function() else {
                return;
            };
            for partner in partners {
                if !Arc::ptr_eq(partner, source) {
                    continue;
                }
                if let Some(partner_state) = partner.partner_state() {
                    for callback in partner_state.callbacks.matching(message.pgn()) {
                        callback(message);
                    }
                }
            }
        }
    }

    fn process_commanded_address(
        &self,
        state: &mut NetworkState,
        message: &CanMessage,
        now: Instant,
    ) {
        if message.pgn() != PGN_COMMANDED_ADDRESS
            || message.len() != COMMANDED_ADDRESS_LENGTH
            || !message.is_broadcast()
        {
            return;
        }
        let Some(target_name) = message.u64_le_at(0) else {
            return;
        };
        let Some(commanded_address) = message.u8_at(8) else {
            return;
        };

        let internals = state.internal.clone();
        let mut outcomes = Vec::new();
        for control_function in internals {
            if control_function.name().raw() != target_name {
                continue;
            }
            if let Some(state_machine) = control_function.state_machine() {
                let mut machine = state_machine.lock().unwrap();
                machine.process_commanded_address(commanded_address, now);
                let address = machine.claimed_address();
                drop(machine);
                outcomes.push((control_function, address));
            }
        }
        for (control_function, address) in outcomes {
            self.apply_internal_address(state, &control_function, address);
        }
    }

    /// Answer requests for the address-claim PGN addressed to everyone or
    /// to one of our internal control functions.
    fn process_request_for_claim(&self, state: &NetworkState, message: &CanMessage) {
        if message.pgn() != PGN_REQUEST || message.len() < 3 {
            return;
        }
        let requested = u32::from(message.data()[0])
            | u32::from(message.data()[1]) << 8
            | u32::from(message.data()[2]) << 16;
        if requested != PGN_ADDRESS_CLAIM {
            return;
        }
        let to_internal = message
            .destination_control_function()
            .is_some_and(|cf| cf.control_function_type() == ControlFunctionType::Internal);
        if !message.is_broadcast() && !to_internal {
            return;
        }
        let env = ClaimEnv {
            state,
            sink: self.current_sink(),
        };
        for control_function in &state.internal {
            if let Some(state_machine) = control_function.state_machine() {
                state_machine.lock().unwrap().process_request_for_claim(&env);
            }
        }
    }

    //==============================================================================TX_PATH

    /// Send an application message from one of our internal control
    /// functions.
    ///
    /// The message is offered to every registered transport protocol in
    /// registration order; the first to accept owns it. Payloads of at most
    /// eight bytes that no protocol takes are emitted directly as a single
    /// frame. The completion callback fires exactly once on every path.
    pub fn send_can_message(
        &self,
        pgn: u32,
        payload: OutboundPayload,
        source: &Arc<ControlFunction>,
        destination: Option<&Arc<ControlFunction>>,
        priority: u8,
        completion: Option<TransmitCompleteCallback>,
    ) -> bool {
        let mut message = OutboundMessage {
            pgn,
            payload,
            source: Arc::clone(source),
            destination: destination.map(Arc::clone),
            priority,
            completion,
        };

        if let Err(reason) = Self::validate_send(&message) {
            log::warn!("[NM]: rejecting send of PGN {:#X}: {}", pgn, reason);
            message.complete(false);
            return false;
        }

        for protocol in self.protocol_snapshot() {
            let mut guard = protocol.lock().unwrap();
            match guard.transmit(message, self) {
                Ok(()) => return true,
                Err(rejected) => message = rejected,
            }
        }

        match self.send_single_frame(&message) {
            Ok(sent) => {
                message.complete(sent);
                sent
            }
            Err(reason) => {
                log::warn!("[NM]: cannot send PGN {:#X}: {}", pgn, reason);
                message.complete(false);
                false
            }
        }
    }

    fn validate_send(message: &OutboundMessage) -> Result<(), SendError> {
        if message.source.control_function_type() != ControlFunctionType::Internal {
            return Err(SendError::SourceNotInternal);
        }
        if !message.source.is_address_valid() && message.pgn != PGN_ADDRESS_CLAIM {
            return Err(SendError::SourceAddressInvalid);
        }
        let length = message.payload.len();
        if length == 0 || length > MAX_MESSAGE_LENGTH {
            return Err(SendError::InvalidLength(length));
        }
        Ok(())
    }

    /// The direct emission path for messages no transport protocol took.
    fn send_single_frame(&self, message: &OutboundMessage) -> Result<bool, SendError> {
        if message.payload.len() > CAN_DATA_LENGTH {
            return Err(SendError::NoProtocol);
        }
        let OutboundPayload::Data(data) = &message.payload else {
            return Err(SendError::ChunkedWithoutProtocol);
        };

        let mut builder =
            CanId::builder(message.pgn, message.source.address()).with_priority(message.priority);
        if let Some(destination) = &message.destination {
            if !destination.is_address_valid() {
                return Err(SendError::DestinationAddressInvalid);
            }
            builder = builder.to_destination(destination.address());
        }
        let id = builder.build()?;
        Ok(self.send_frame_raw(Frame::new(id, data)))
    }

    //==============================================================================PROTOCOLS

    /// Register a transport protocol. It is initialized lazily before its
    /// first update and dropped with the network.
    pub fn register_transport_protocol(
        &self,
        protocol: Box<dyn TransportProtocol>,
    ) -> ProtocolHandle {
        let mut protocols = self.protocols.lock().unwrap();
        protocols.push(ProtocolSlot {
            initialized: false,
            protocol: Arc::new(Mutex::new(protocol)),
        });
        ProtocolHandle(protocols.len() - 1)
    }

    /// Subscribe a registered protocol to one inbound PGN. Duplicate
    /// subscriptions are rejected.
    pub fn add_protocol_pgn_callback(&self, pgn: u32, handle: ProtocolHandle) -> bool {
        if handle.0 >= self.protocols.lock().unwrap().len() {
            return false;
        }
        let mut routes = self.protocol_routes.lock().unwrap();
        if routes.contains(&(pgn, handle.0)) {
            return false;
        }
        routes.push((pgn, handle.0));
        true
    }

    /// Drop a protocol's subscription to one PGN.
    pub fn remove_protocol_pgn_callback(&self, pgn: u32, handle: ProtocolHandle) -> bool {
        let mut routes = self.protocol_routes.lock().unwrap();
        let before = routes.len();
        routes.retain(|route| *route != (pgn, handle.0));
        routes.len() != before
    }

    fn protocol_snapshot(&self) -> Vec<Arc<Mutex<Box<dyn TransportProtocol>>>> {
        self.protocols
            .lock()
            .unwrap()
            .iter()
            .map(|slot| Arc::clone(&slot.protocol))
            .collect()
    }

    fn update_protocols(&self) {
        let Some(network) = self.self_ref.upgrade() else {
            return;
        };
        let slots: Vec<(bool, Arc<Mutex<Box<dyn TransportProtocol>>>)> = {
            let mut protocols = self.protocols.lock().unwrap();
            protocols
                .iter_mut()
                .map(|slot| {
                    let needs_initialize = !slot.initialized;
                    slot.initialized = true;
                    (needs_initialize, Arc::clone(&slot.protocol))
                })
                .collect()
        };
        for (needs_initialize, protocol) in slots {
            let mut guard = protocol.lock().unwrap();
            if needs_initialize {
                guard.initialize(&network);
            }
            guard.update(self);
        }
    }

    /// Entry point for transport protocols delivering a reassembled
    /// message: runs the global/partner callbacks and the commanded-address
    /// handling on it. Safe to call from within
    /// [`TransportProtocol::process_message`].
    pub fn protocol_message_callback(&self, message: &CanMessage) {
        let now = Instant::now();
        let mut resolved = message.clone();
        let partners = {
            let state = self.state.lock().unwrap();
            resolved.set_source(state.control_function_at(resolved.source_address()));
            resolved.set_destination(if resolved.is_broadcast() {
                None
            } else {
                state.control_function_at(resolved.destination_address())
            });
            state.partners.clone()
        };
        self.dispatch_global_and_partner_callbacks(&partners, &resolved);
        let mut state = self.state.lock().unwrap();
        self.process_commanded_address(&mut state, &resolved, now);
    }

    //==============================================================================CALLBACK_REGISTRATION

    /// Register a callback for broadcast messages carrying `pgn`.
    pub fn add_global_pgn_callback(&self, pgn: u32, callback: MessageCallback) -> bool {
        self.global_callbacks.add(pgn, callback)
    }

    /// Remove a global PGN callback.
    pub fn remove_global_pgn_callback(&self, pgn: u32, callback: &MessageCallback) -> bool {
        self.global_callbacks.remove(pgn, callback)
    }

    /// Register a callback for messages carrying `pgn` that are broadcast
    /// or destined to any of our internal control functions.
    pub fn add_any_cf_pgn_callback(&self, pgn: u32, callback: MessageCallback) -> bool {
        self.any_cf_callbacks.add(pgn, callback)
    }

    /// Remove an any-CF PGN callback.
    pub fn remove_any_cf_pgn_callback(&self, pgn: u32, callback: &MessageCallback) -> bool {
        self.any_cf_callbacks.remove(pgn, callback)
    }
}
