//! An in-process CAN bus. Every transport created from one
//! [`VirtualCanBus`] sees the frames written by all the others, which is
//! enough to run several networks (or a test harness) against each other
//! without hardware.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::core::UPDATE_WAKEUP_TIMEOUT_MS;
use crate::hardware::traits::FrameTransport;
use crate::protocol::can_frame::Frame;

struct Endpoint {
    queue: Mutex<VecDeque<Frame>>,
    available: Condvar,
    open: AtomicBool,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            open: AtomicBool::new(false),
        }
    }
}

struct BusInner {
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
}

/// A shared in-process bus. Clone-by-handle: create it once and hand out
/// transports for every participant.
#[derive(Clone)]
pub struct VirtualCanBus {
    inner: Arc<BusInner>,
}

impl VirtualCanBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                endpoints: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach a new endpoint to the bus and return its transport.
    pub fn create_transport(&self) -> VirtualCanTransport {
        let endpoint = Arc::new(Endpoint::new());
        self.inner.endpoints.lock().unwrap().push(Arc::clone(&endpoint));
        VirtualCanTransport {
            bus: Arc::clone(&self.inner),
            endpoint,
        }
    }
}

impl Default for VirtualCanBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a [`VirtualCanBus`]. Writing delivers the frame to every
/// other endpoint; reading blocks until a peer writes or the cooperative
/// timeout elapses.
pub struct VirtualCanTransport {
    bus: Arc<BusInner>,
    endpoint: Arc<Endpoint>,
}

impl FrameTransport for VirtualCanTransport {
    fn open(&self) {
        self.endpoint.open.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.endpoint.open.store(false, Ordering::SeqCst);
        // Unblock any reader stuck in read_frame.
        let _guard = self.endpoint.queue.lock().unwrap();
        self.endpoint.available.notify_all();
    }

    fn is_valid(&self) -> bool {
        self.endpoint.open.load(Ordering::SeqCst)
    }

    fn read_frame(&self) -> Option<Frame> {
        let mut queue = self.endpoint.queue.lock().unwrap();
        if queue.is_empty() && self.is_valid() {
            let (guard, _timeout) = self
                .endpoint
                .available
                .wait_timeout(queue, Duration::from_millis(UPDATE_WAKEUP_TIMEOUT_MS))
                .unwrap();
            queue = guard;
        }
        queue.pop_front()
    }

    fn write_frame(&self, frame: &Frame) -> bool {
        if !self.is_valid() {
            return false;
        }
        let endpoints = self.bus.endpoints.lock().unwrap();
        for endpoint in endpoints.iter() {
            if Arc::ptr_eq(endpoint, &self.endpoint) {
                continue;
            }
            let mut queue = endpoint.queue.lock().unwrap();
            queue.push_back(*frame);
            endpoint.available.notify_all();
        }
        true
    }
}
