//! Plug-in surface for transport-layer protocols (BAM/CM, extended
//! transport, fast packet and friends). Protocols are registered with a
//! network, offered every outbound message larger than one frame, updated
//! on every network tick, and fed the inbound messages whose PGNs they
//! subscribe to.
use std::sync::Arc;

use crate::network::control_function::ControlFunction;
use crate::network::manager::NetworkManager;
use crate::network::message::CanMessage;

/// Payload of an outbound message: either owned bytes, or a provider that
/// yields chunks on demand so large transfers do not have to be resident.
pub enum OutboundPayload {
    Data(Vec<u8>),
    Chunked {
        length: usize,
        /// Fill `buffer` with bytes starting at `offset`; `false` aborts the
        /// transfer.
        read_chunk: Arc<dyn Fn(usize, &mut [u8]) -> bool + Send + Sync>,
    },
}

impl OutboundPayload {
    /// Total number of bytes this payload will produce.
    pub fn len(&self) -> usize {
        match self {
            OutboundPayload::Data(data) => data.len(),
            OutboundPayload::Chunked { length, .. } => *length,
        }
    }

    /// Whether the payload carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome handed to a transmit-complete callback.
pub struct TransmitResult {
    pub pgn: u32,
    pub length: usize,
    pub source: Arc<ControlFunction>,
    pub destination: Option<Arc<ControlFunction>>,
    pub success: bool,
}

/// Called exactly once when an outbound message finishes, on either path.
pub type TransmitCompleteCallback = Box<dyn FnOnce(&TransmitResult) + Send>;

/// An outbound message offered to the transport protocols.
pub struct OutboundMessage {
    pub pgn: u32,
    pub payload: OutboundPayload,
    pub source: Arc<ControlFunction>,
    pub destination: Option<Arc<ControlFunction>>,
    pub priority: u8,
    pub completion: Option<TransmitCompleteCallback>,
}

impl OutboundMessage {
    /// Fire the completion callback, if any, consuming it.
    pub fn complete(&mut self, success: bool) {
        if let Some(completion) = self.completion.take() {
            completion(&TransmitResult {
                pgn: self.pgn,
                length: self.payload.len(),
                source: Arc::clone(&self.source),
                destination: self.destination.clone(),
                success,
            });
        }
    }
}

/// Identifies a registered protocol within its network. Returned by
/// [`NetworkManager::register_transport_protocol`] and used to subscribe
/// the protocol to PGNs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolHandle(pub(crate) usize);

/// A transport-layer protocol owned by a network.
///
/// # Re-entrancy
///
/// Every registered protocol sits behind its own mutex, and that mutex is
/// held while any of its hooks (`transmit`, `update`, `process_message`)
/// runs. [`NetworkManager::send_can_message`] offers the outbound message
/// to every registered protocol in turn, so calling it from inside a hook
/// deadlocks on the calling protocol's own mutex: put frames on the wire
/// with [`NetworkManager::send_frame_raw`] instead.
///
/// The network's control-function lock is released before any hook runs,
/// so hooks may otherwise call back into the network freely — in
/// particular, a protocol that completes a reassembly inside
/// `process_message` hands the result up through
/// [`NetworkManager::protocol_message_callback`], and table queries such as
/// [`NetworkManager::get_control_function`] are safe.
pub trait TransportProtocol: Send {
    /// Called once by the network before the first update.
    fn initialize(&mut self, network: &Arc<NetworkManager>);

    /// Offer an outbound message. Return `Ok(())` to take ownership of the
    /// transfer, or give the message back to let the next protocol look at
    /// it.
    fn transmit(
        &mut self,
        message: OutboundMessage,
        network: &NetworkManager,
    ) -> Result<(), OutboundMessage>;

    /// Advance timers and in-flight sessions. Called on every network
    /// update.
    fn update(&mut self, network: &NetworkManager);

    /// Handle an inbound message whose PGN this protocol subscribed to via
    /// [`NetworkManager::add_protocol_pgn_callback`].
    fn process_message(&mut self, message: &CanMessage, network: &NetworkManager);
}
