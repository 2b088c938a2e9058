//! SocketCAN transport (Linux). Opens a raw CAN socket on a named interface
//! with a one-second read timeout so the receive thread stays cooperative.
use std::sync::RwLock;
use std::time::Duration;

use socketcan::{CanFrame as LinuxCanFrame, EmbeddedFrame, Socket};

use crate::core::UPDATE_WAKEUP_TIMEOUT_MS;
use crate::hardware::traits::FrameTransport;
use crate::protocol::can_frame::Frame;
use crate::protocol::can_id::CanId;

/// Drives one SocketCAN interface (for example `can0` or `vcan0`).
pub struct SocketCanTransport {
    interface: String,
    socket: RwLock<Option<socketcan::CanSocket>>,
}

impl SocketCanTransport {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            socket: RwLock::new(None),
        }
    }
}

impl FrameTransport for SocketCanTransport {
    fn open(&self) {
        let mut socket = self.socket.write().unwrap();
        if socket.is_some() {
            return;
        }
        match socketcan::CanSocket::open(&self.interface) {
            Ok(opened) => *socket = Some(opened),
            Err(error) => {
                log::error!("[HW]: failed to open {}: {}", self.interface, error);
            }
        }
    }

    fn close(&self) {
        *self.socket.write().unwrap() = None;
    }

    fn is_valid(&self) -> bool {
        self.socket.read().unwrap().is_some()
    }

    fn read_frame(&self) -> Option<Frame> {
        let socket = self.socket.read().unwrap();
        let socket = socket.as_ref()?;
        match socket.read_frame_timeout(Duration::from_millis(UPDATE_WAKEUP_TIMEOUT_MS)) {
            Ok(LinuxCanFrame::Data(data)) => {
                let raw = match data.id() {
                    embedded_can::Id::Standard(id) => u32::from(id.as_raw()),
                    embedded_can::Id::Extended(id) => id.as_raw(),
                };
                Some(Frame::new(CanId(raw), data.data()))
            }
            // Remote and error frames carry nothing for this stack.
            Ok(_) => None,
            Err(_) => None,
        }
    }

    fn write_frame(&self, frame: &Frame) -> bool {
        let socket = self.socket.read().unwrap();
        let Some(socket) = socket.as_ref() else {
            return false;
        };
        let id = embedded_can::Frame::id(frame);
        match LinuxCanFrame::new(id, frame.payload()) {
            Some(out) => socket.write_frame(&out).is_ok(),
            None => false,
        }
    }
}
