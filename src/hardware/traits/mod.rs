//! Plug-in contracts for the hardware layer: one for CAN frame transports
//! and one for persisted key-value storage. Implementations never panic and
//! never block indefinitely; failures are signalled through return values
//! and the validity flag.
use crate::protocol::can_frame::Frame;

/// A driver for one bus channel (SocketCAN, a serial tunnel, an in-process
/// virtual bus). Methods take `&self` because the receive thread and the
/// update thread use the transport concurrently; implementations carry
/// their own interior state.
pub trait FrameTransport: Send + Sync {
    /// Acquire the OS resources for this channel, best effort. Idempotent;
    /// the outcome is observable through [`FrameTransport::is_valid`].
    fn open(&self);

    /// Release the OS resources. Safe to call when not open. Must unblock
    /// any thread waiting inside [`FrameTransport::read_frame`].
    fn close(&self);

    /// Whether the channel is usable. Drops to `false` on hard errors; the
    /// owning channel thread backs off and polls until it recovers.
    fn is_valid(&self) -> bool;

    /// Block until a frame arrives, with an internal timeout of roughly one
    /// second so shutdown stays cooperative. `None` on timeout or a
    /// transient error.
    fn read_frame(&self) -> Option<Frame>;

    /// Write one frame synchronously. `false` on hard error.
    fn write_frame(&self, frame: &Frame) -> bool;
}

/// An identifier-keyed blob store backing the storage pump.
pub trait StorageBackend: Send {
    /// Persist `data` under `id`, replacing any previous contents.
    fn write(&mut self, id: u64, data: &[u8]) -> bool;

    /// Fetch the blob stored under `id`.
    fn read(&mut self, id: u64) -> Option<Vec<u8>>;
}
