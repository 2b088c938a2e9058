//! The multi-channel CAN pump. Each assigned channel gets a dedicated
//! receive thread blocking in its transport; one update thread drains the
//! queues and drives the networks; one tick thread converts time into
//! wakeups.
//!
//! The update thread performs three stages in fixed order on every wakeup:
//! drain received frames to the networks, run the periodic tick when due,
//! then write queued outbound frames. Within one channel, frames keep bus
//! order in both directions; nothing is promised across channels.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use crate::core::{
    DEFAULT_PERIODIC_INTERVAL_MS, RX_QUEUE_CAPACITY, TRANSPORT_RETRY_DELAY_MS, TX_QUEUE_CAPACITY,
    UPDATE_WAKEUP_TIMEOUT_MS,
};
use crate::hardware::events::EventDispatcher;
use crate::hardware::traits::FrameTransport;
use crate::network::manager::{FrameSink, NetworkManager};
use crate::protocol::can_frame::Frame;

struct Channel {
    id: u8,
    network: Arc<NetworkManager>,
    transport: Arc<dyn FrameTransport>,
    rx_queue: Arc<ArrayQueue<Frame>>,
    rx_dropped: Arc<AtomicU64>,
    tx_queue: Arc<Mutex<VecDeque<Frame>>>,
    tx_dropped: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
    rx_thread: Option<JoinHandle<()>>,
}

/// Cloneable view of a channel used by the update-loop stages so no channel
/// lock is held across callbacks or transport I/O.
#[derive(Clone)]
struct ChannelHandle {
    network: Arc<NetworkManager>,
    transport: Arc<dyn FrameTransport>,
    rx_queue: Arc<ArrayQueue<Frame>>,
    tx_queue: Arc<Mutex<VecDeque<Frame>>>,
}

struct Shared {
    channels: Mutex<Vec<Channel>>,
    running: AtomicBool,
    tick_due: AtomicBool,
    wakeup_pending: AtomicBool,
    periodic_interval_ms: AtomicU64,
    next_channel_id: AtomicU64,
    wakeup_lock: Mutex<()>,
    wakeup: Condvar,
    frame_received: EventDispatcher<Frame>,
    frame_transmitted: EventDispatcher<Frame>,
    periodic_tick: EventDispatcher<()>,
}

impl Shared {
    fn notify(&self) {
        self.wakeup_pending.store(true, Ordering::SeqCst);
        let _guard = self.wakeup_lock.lock().unwrap();
        self.wakeup.notify_all();
    }

    fn channel_handles(&self) -> Vec<ChannelHandle> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .map(|channel| ChannelHandle {
                network: Arc::clone(&channel.network),
                transport: Arc::clone(&channel.transport),
                rx_queue: Arc::clone(&channel.rx_queue),
                tx_queue: Arc::clone(&channel.tx_queue),
            })
            .collect()
    }

    fn enqueue_tx(&self, channel_id: u8, frame: Frame) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            log::error!("[HW]: cannot transmit before the interface is started");
            return false;
        }
        let channels = self.channels.lock().unwrap();
        let Some(channel) = channels.iter().find(|channel| channel.id == channel_id) else {
            log::warn!("[HW]: cannot transmit, the channel is no longer assigned");
            return false;
        };
        if !channel.transport.is_valid() {
            return false;
        }
        {
            let mut queue = channel.tx_queue.lock().unwrap();
            if queue.len() >= TX_QUEUE_CAPACITY {
                queue.pop_front();
                channel.tx_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("[HW]: transmit queue overflow, dropping the oldest frame");
            }
            queue.push_back(frame);
        }
        drop(channels);
        self.notify();
        true
    }
}

/// Sink installed into a network when its channel is assigned; forwards the
/// network's outbound frames into that channel's transmit queue.
struct ChannelSink {
    shared: Weak<Shared>,
    channel_id: u8,
}

impl FrameSink for ChannelSink {
    fn transmit(&self, frame: Frame) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.enqueue_tx(self.channel_id, frame),
            None => false,
        }
    }
}

/// Owns the channel table and the pump threads. Create one per process (or
/// per isolated set of buses), assign a transport per network, then
/// [`start`](CanHardwareInterface::start) it.
pub struct CanHardwareInterface {
    shared: Arc<Shared>,
    update_thread: Mutex<Option<JoinHandle<()>>>,
    tick_thread: Mutex<Option<JoinHandle<()>>>,
}

impl CanHardwareInterface {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                channels: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                tick_due: AtomicBool::new(false),
                wakeup_pending: AtomicBool::new(false),
                periodic_interval_ms: AtomicU64::new(DEFAULT_PERIODIC_INTERVAL_MS),
                next_channel_id: AtomicU64::new(0),
                wakeup_lock: Mutex::new(()),
                wakeup: Condvar::new(),
                frame_received: EventDispatcher::new(),
                frame_transmitted: EventDispatcher::new(),
                periodic_tick: EventDispatcher::new(),
            }),
            update_thread: Mutex::new(None),
            tick_thread: Mutex::new(None),
        }
    }

    //==============================================================================CHANNELS

    /// Bind `network` to `transport` as one bus channel. May be called
    /// before or while running; when running, the transport is opened and
    /// the receive thread spawned inline. Re-assigning a network replaces
    /// its transport.
    pub fn assign(&self, network: &Arc<NetworkManager>, transport: Arc<dyn FrameTransport>) -> bool {
        // Replace any existing channel for this network first.
        self.unassign_internal(network, false);

        let id = self.shared.next_channel_id.fetch_add(1, Ordering::Relaxed) as u8;
        let mut channel = Channel {
            id,
            network: Arc::clone(network),
            transport,
            rx_queue: Arc::new(ArrayQueue::new(RX_QUEUE_CAPACITY)),
            rx_dropped: Arc::new(AtomicU64::new(0)),
            tx_queue: Arc::new(Mutex::new(VecDeque::new())),
            tx_dropped: Arc::new(AtomicU64::new(0)),
            alive: Arc::new(AtomicBool::new(true)),
            rx_thread: None,
        };

        network.set_frame_sink(Arc::new(ChannelSink {
            shared: Arc::downgrade(&self.shared),
            channel_id: id,
        }));

        if self.shared.running.load(Ordering::SeqCst) {
            channel.transport.open();
            if !channel.transport.is_valid() {
                log::error!("[HW]: channel {} transport failed to open", id);
            }
            channel.rx_thread = spawn_rx_thread(&self.shared, &channel);
        }

        self.shared.channels.lock().unwrap().push(channel);
        true
    }

    /// Unbind the channel of `network`, closing its transport and joining
    /// its receive thread. The network's frame sink is cleared.
    pub fn unassign(&self, network: &Arc<NetworkManager>) -> bool {
        self.unassign_internal(network, true)
    }

    fn unassign_internal(&self, network: &Arc<NetworkManager>, warn_when_absent: bool) -> bool {
        let channel = {
            let mut channels = self.shared.channels.lock().unwrap();
            match channels
                .iter()
                .position(|channel| Arc::ptr_eq(&channel.network, network))
            {
                Some(position) => channels.remove(position),
                None => {
                    if warn_when_absent {
                        log::error!("[HW]: cannot unassign, the network has no channel");
                    }
                    return false;
                }
            }
        };
        network.clear_frame_sink();
        teardown_channel(channel);
        true
    }

    /// Number of assigned channels.
    pub fn channel_count(&self) -> usize {
        self.shared.channels.lock().unwrap().len()
    }

    /// Frames dropped on a network's channel because its queues were full,
    /// as `(receive, transmit)` counts.
    pub fn dropped_frame_counts(&self, network: &Arc<NetworkManager>) -> Option<(u64, u64)> {
        let channels = self.shared.channels.lock().unwrap();
        channels
            .iter()
            .find(|channel| Arc::ptr_eq(&channel.network, network))
            .map(|channel| {
                (
                    channel.rx_dropped.load(Ordering::Relaxed),
                    channel.tx_dropped.load(Ordering::Relaxed),
                )
            })
    }

    //==============================================================================LIFECYCLE

    /// Spawn the pump threads and open every assigned transport.
    pub fn start(&self) -> bool {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            log::error!("[HW]: cannot start the interface more than once");
            return false;
        }

        let shared = Arc::clone(&self.shared);
        let update = std::thread::Builder::new()
            .name("agribus-update".into())
            .spawn(move || update_thread_main(shared));
        let shared = Arc::clone(&self.shared);
        let tick = std::thread::Builder::new()
            .name("agribus-tick".into())
            .spawn(move || tick_thread_main(shared));
        let (Ok(update), Ok(tick)) = (update, tick) else {
            log::error!("[HW]: failed to spawn the pump threads");
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.notify();
            return false;
        };
        *self.update_thread.lock().unwrap() = Some(update);
        *self.tick_thread.lock().unwrap() = Some(tick);

        let mut channels = self.shared.channels.lock().unwrap();
        for channel in channels.iter_mut() {
            channel.transport.open();
            if !channel.transport.is_valid() {
                log::error!("[HW]: channel {} transport failed to open", channel.id);
            }
            channel.alive.store(true, Ordering::SeqCst);
            channel.rx_thread = spawn_rx_thread(&self.shared, channel);
        }
        true
    }

    /// Stop the pump: join the update and tick threads, close every
    /// transport, join the receive threads, and clear all queues. Channels
    /// stay assigned, so the interface can be restarted.
    pub fn stop(&self) -> bool {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            log::error!("[HW]: cannot stop the interface before it is started");
            return false;
        }
        self.shared.notify();

        if let Some(handle) = self.update_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.tick_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        let mut channels = self.shared.channels.lock().unwrap();
        for channel in channels.iter_mut() {
            channel.alive.store(false, Ordering::SeqCst);
            channel.transport.close();
            if let Some(handle) = channel.rx_thread.take() {
                let _ = handle.join();
            }
            while channel.rx_queue.pop().is_some() {}
            channel.tx_queue.lock().unwrap().clear();
        }
        true
    }

    /// Whether the pump threads are running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Queue one frame on the channel bound to `network` and wake the
    /// update thread.
    pub fn transmit(&self, network: &Arc<NetworkManager>, frame: Frame) -> bool {
        let channel_id = {
            let channels = self.shared.channels.lock().unwrap();
            channels
                .iter()
                .find(|channel| Arc::ptr_eq(&channel.network, network))
                .map(|channel| channel.id)
        };
        match channel_id {
            Some(id) => self.shared.enqueue_tx(id, frame),
            None => {
                log::warn!("[HW]: cannot transmit, the network has no channel");
                false
            }
        }
    }

    /// Change the tick period. Takes effect on the next tick.
    pub fn set_periodic_interval(&self, interval_ms: u64) {
        self.shared
            .periodic_interval_ms
            .store(interval_ms.max(1), Ordering::SeqCst);
    }

    /// Current tick period in milliseconds.
    pub fn get_periodic_interval(&self) -> u64 {
        self.shared.periodic_interval_ms.load(Ordering::SeqCst)
    }

    //==============================================================================EVENTS

    /// Fired for every received frame, before the frame reaches the network.
    pub fn on_frame_received(&self) -> &EventDispatcher<Frame> {
        &self.shared.frame_received
    }

    /// Fired for every frame successfully written to a transport.
    pub fn on_frame_transmitted(&self) -> &EventDispatcher<Frame> {
        &self.shared.frame_transmitted
    }

    /// Fired on every periodic tick, before the networks are updated.
    pub fn on_periodic_tick(&self) -> &EventDispatcher<()> {
        &self.shared.periodic_tick
    }
}

impl Default for CanHardwareInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CanHardwareInterface {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

fn teardown_channel(mut channel: Channel) {
    channel.alive.store(false, Ordering::SeqCst);
    channel.transport.close();
    if let Some(handle) = channel.rx_thread.take() {
        let _ = handle.join();
    }
}

fn spawn_rx_thread(shared: &Arc<Shared>, channel: &Channel) -> Option<JoinHandle<()>> {
    let shared = Arc::clone(shared);
    let transport = Arc::clone(&channel.transport);
    let rx_queue = Arc::clone(&channel.rx_queue);
    let rx_dropped = Arc::clone(&channel.rx_dropped);
    let alive = Arc::clone(&channel.alive);
    let channel_id = channel.id;
    std::thread::Builder::new()
        .name(format!("agribus-rx-{channel_id}"))
        .spawn(move || {
            rx_thread_main(shared, channel_id, transport, rx_queue, rx_dropped, alive)
        })
        .map_err(|error| {
            log::error!("[HW]: failed to spawn the receive thread for channel {channel_id}: {error}")
        })
        .ok()
}

fn rx_thread_main(
    shared: Arc<Shared>,
    channel_id: u8,
    transport: Arc<dyn FrameTransport>,
    rx_queue: Arc<ArrayQueue<Frame>>,
    rx_dropped: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
) {
    while shared.running.load(Ordering::SeqCst) && alive.load(Ordering::SeqCst) {
        if transport.is_valid() {
            if let Some(mut frame) = transport.read_frame() {
                frame.channel = channel_id;
                if rx_queue.force_push(frame).is_some() {
                    rx_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "[HW]: channel {} receive ring overflow, dropped the oldest frame",
                        channel_id
                    );
                }
                shared.notify();
            }
        } else {
            log::error!(
                "[HW]: channel {} transport is invalid, retrying in 1 s",
                channel_id
            );
            std::thread::sleep(Duration::from_millis(TRANSPORT_RETRY_DELAY_MS));
        }
    }
}

fn update_thread_main(shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        if !shared.wakeup_pending.swap(false, Ordering::SeqCst) {
            let guard = shared.wakeup_lock.lock().unwrap();
            let _ = shared
                .wakeup
                .wait_timeout(guard, Duration::from_millis(UPDATE_WAKEUP_TIMEOUT_MS))
                .unwrap();
        }
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        // Stage 1: drain received frames, oldest first. The received event
        // fires before the frame reaches the network.
        for channel in shared.channel_handles() {
            while let Some(frame) = channel.rx_queue.pop() {
                shared.frame_received.invoke(&frame);
                channel.network.process_received_frame(&frame);
            }
        }

        // Stage 2: run the periodic tick when the tick thread flagged one.
        if shared.tick_due.swap(false, Ordering::SeqCst) {
            shared.periodic_tick.invoke(&());
            for channel in shared.channel_handles() {
                channel.network.update();
            }
        }

        // Stage 3: write queued outbound frames. A write failure leaves the
        // frame at the head for the next wakeup.
        for channel in shared.channel_handles() {
            loop {
                let frame = channel.tx_queue.lock().unwrap().front().copied();
                let Some(frame) = frame else { break };
                if channel.transport.is_valid() && channel.transport.write_frame(&frame) {
                    channel.tx_queue.lock().unwrap().pop_front();
                    shared.frame_transmitted.invoke(&frame);
                    channel.network.frame_transmitted(&frame);
                } else {
                    break;
                }
            }
        }
    }
}

fn tick_thread_main(shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        shared.tick_due.store(true, Ordering::SeqCst);
        shared.notify();
        let interval = shared.periodic_interval_ms.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(interval));
    }
}
