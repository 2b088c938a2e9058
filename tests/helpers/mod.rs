//! Test doubles shared by the integration tests: a recording frame sink, a
//! pair of cross-wired networks sharing a software bus, and claim-frame
//! builders for scripting competing nodes.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agribus::core::GLOBAL_ADDRESS;
use agribus::network::manager::{FrameSink, NetworkManager};
use agribus::protocol::can_frame::Frame;
use agribus::protocol::can_id::CanId;
use agribus::protocol::name::Name;

/// Sink that records every frame a network tries to transmit.
pub struct RecordingSink {
    frames: Mutex<Vec<Frame>>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
        })
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn take_frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().drain(..).collect()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl FrameSink for RecordingSink {
    fn transmit(&self, frame: Frame) -> bool {
        self.frames.lock().unwrap().push(frame);
        true
    }
}

/// Sink wiring one network's egress straight into a peer network's receive
/// queue, with a copy kept for assertions.
pub struct CrossWiredSink {
    peer: Arc<NetworkManager>,
    record: Arc<RecordingSink>,
}

#[allow(dead_code)]
impl CrossWiredSink {
    pub fn new(peer: &Arc<NetworkManager>, record: &Arc<RecordingSink>) -> Arc<Self> {
        Arc::new(Self {
            peer: Arc::clone(peer),
            record: Arc::clone(record),
        })
    }
}

impl FrameSink for CrossWiredSink {
    fn transmit(&self, frame: Frame) -> bool {
        self.record.transmit(frame);
        self.peer.process_received_frame(&frame);
        true
    }
}

/// Drive one or more networks through enough updates to settle a claim
/// cycle (hold-off, contention window, and follow-up arbitration).
#[allow(dead_code)]
pub fn settle(networks: &[&Arc<NetworkManager>], total: Duration) {
    let step = Duration::from_millis(5);
    let rounds = (total.as_millis() / step.as_millis()).max(1) as usize;
    for _ in 0..rounds {
        for network in networks {
            network.update();
        }
        std::thread::sleep(step);
    }
}

/// An address-claim frame as a competing node would emit it.
#[allow(dead_code)]
pub fn claim_frame(name: Name, address: u8) -> Frame {
    let id = CanId::builder(agribus::core::PGN_ADDRESS_CLAIM, address)
        .to_destination(GLOBAL_ADDRESS)
        .with_priority(6)
        .build()
        .unwrap();
    Frame::new(id, &name.to_le_bytes())
}

/// A NAME with the arbitrary-address bit set and a distinguishing identity.
#[allow(dead_code)]
pub fn capable_name(identity: u32) -> Name {
    Name::builder()
        .identity_number(identity)
        .arbitrary_address_capable(true)
        .build()
}

/// A fixed-address NAME (cannot fall back to the dynamic range).
#[allow(dead_code)]
pub fn fixed_name(identity: u32) -> Name {
    Name::builder().identity_number(identity).build()
}
