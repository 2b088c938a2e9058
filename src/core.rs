//! Constants shared across the stack: reserved bus addresses, the dynamic
//! address range, address-claim timing, and the bounds of the hardware
//! pump's queues.

/// The null address (0xFE). Used as the source of a node that has not yet
/// claimed an address, and as the address of a control function that lost
/// arbitration and cannot claim.
pub const NULL_ADDRESS: u8 = 0xFE;

/// The global broadcast address (0xFF).
pub const GLOBAL_ADDRESS: u8 = 0xFF;

/// First address of the dynamic range available to arbitrary-address-capable
/// control functions (ISO 11783-5).
pub const DYNAMIC_ADDRESS_RANGE_START: u8 = 128;

/// Last address of the dynamic range (inclusive).
pub const DYNAMIC_ADDRESS_RANGE_END: u8 = 247;

/// Number of slots in a network's address table. Addresses 0..=253 are
/// claimable; 0xFE and 0xFF are reserved.
pub const ADDRESS_TABLE_SIZE: usize = 254;

/// Payload bytes carried by a classic CAN frame.
pub const CAN_DATA_LENGTH: usize = 8;

/// Largest message the stack will accept for transmission. Messages above
/// eight bytes must be taken by a transport protocol; this is the ceiling
/// any such protocol can move (ISO 11783-3 TP limit).
pub const MAX_MESSAGE_LENGTH: usize = 1785;

/// PGN of the address-claim message (0x00EE00, "ISO Address Claim").
pub const PGN_ADDRESS_CLAIM: u32 = 0x00EE00;

/// PGN of the parameter-group request message (0x00EA00, "ISO Request").
pub const PGN_REQUEST: u32 = 0x00EA00;

/// PGN of the commanded-address message (0x00FED8).
pub const PGN_COMMANDED_ADDRESS: u32 = 0x00FED8;

/// Length of a commanded-address payload: the 8-byte target NAME followed by
/// the 1-byte commanded address.
pub const COMMANDED_ADDRESS_LENGTH: usize = 9;

/// Contention window after a claim or request during which competing claims
/// are collected before an address is considered won (J1939-81).
pub const ADDRESS_CONTENTION_TIME_MS: u64 = 250;

/// Upper bound of the pseudo-random claim hold-off. The hold-off is derived
/// from the NAME so that every node computes a stable value in 0..=153 ms.
pub const CLAIM_HOLDOFF_SPAN_MS: u64 = 154;

/// Nominal ISOBUS bit rate used by the busload estimator.
pub const ISOBUS_BAUD_RATE_BPS: f32 = 250_000.0;

/// Width of one busload accumulation bucket.
pub const BUSLOAD_UPDATE_FREQUENCY_MS: u64 = 100;

/// Length of the busload observation window.
pub const BUSLOAD_SAMPLE_WINDOW_MS: u64 = 10_000;

/// Capacity of a channel's receive ring. When full, the oldest frame is
/// displaced and a drop counter is incremented.
pub const RX_QUEUE_CAPACITY: usize = 256;

/// Bound on a channel's transmit queue, enforced with the same drop-oldest
/// policy as the receive ring.
pub const TX_QUEUE_CAPACITY: usize = 256;

/// Default period of the hardware tick thread.
pub const DEFAULT_PERIODIC_INTERVAL_MS: u64 = 4;

/// How long a channel thread backs off when its transport reports invalid.
pub const TRANSPORT_RETRY_DELAY_MS: u64 = 1000;

/// Timeout of the update thread's condition-variable wait, and the longest a
/// transport's `read_frame` may block before yielding for shutdown checks.
pub const UPDATE_WAKEUP_TIMEOUT_MS: u64 = 1000;
