//! Pump behavior over the in-process virtual bus: the full claim flow with
//! two networks, ordering guarantees, event streams, and stop/restart.
mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agribus::hardware::interface::CanHardwareInterface;
use agribus::hardware::plugins::virtual_can::VirtualCanBus;
use agribus::hardware::traits::FrameTransport;
use agribus::network::callbacks::MessageCallback;
use agribus::network::manager::NetworkManager;
use agribus::protocol::can_frame::Frame;
use agribus::protocol::can_id::CanId;
use agribus::protocol::name::{Name, NameField, NameFilter};

use helpers::capable_name;

fn terminal_name(identity: u32, function: u8) -> Name {
    Name::builder()
        .identity_number(identity)
        .function(function)
        .arbitrary_address_capable(true)
        .build()
}

#[test]
fn two_networks_claim_and_bind_partners_over_one_bus() {
    let bus = VirtualCanBus::new();
    let first_network = NetworkManager::new();
    let second_network = NetworkManager::new();

    let interface = CanHardwareInterface::new();
    assert!(interface.assign(&first_network, Arc::new(bus.create_transport())));
    assert!(interface.assign(&second_network, Arc::new(bus.create_transport())));
    assert_eq!(interface.channel_count(), 2);
    assert!(interface.start());
    assert!(interface.is_running());

    let first_ecu =
        first_network.create_internal_control_function(terminal_name(1, 60), 0x1C);
    let second_ecu =
        second_network.create_internal_control_function(terminal_name(2, 61), 0x1D);

    let first_partner = first_network
        .create_partnered_control_function(vec![NameFilter::new(NameField::Function, 61)]);
    let second_partner = second_network
        .create_partnered_control_function(vec![NameFilter::new(NameField::Function, 60)]);

    std::thread::sleep(Duration::from_millis(1000));

    assert!(first_ecu.is_address_valid());
    assert!(second_ecu.is_address_valid());
    assert_eq!(first_ecu.address(), 0x1C);
    assert_eq!(second_ecu.address(), 0x1D);

    assert!(first_partner.is_bound());
    assert!(second_partner.is_bound());
    assert_eq!(first_partner.address(), 0x1D);
    assert_eq!(second_partner.address(), 0x1C);
    assert_eq!(first_partner.name(), terminal_name(2, 61));
    assert_eq!(second_partner.name(), terminal_name(1, 60));

    assert!(interface.stop());
    assert!(!interface.is_running());
}

#[test]
fn transmitted_frames_keep_enqueue_order() {
    let bus = VirtualCanBus::new();
    let network = NetworkManager::new();
    let peer = bus.create_transport();
    peer.open();

    let interface = CanHardwareInterface::new();
    interface.assign(&network, Arc::new(bus.create_transport()));

    let transmitted = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&transmitted);
    interface.on_frame_transmitted().add_listener(move |_frame| {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    assert!(interface.start());

    let id = CanId::builder(0xFEF1, 0x1C).build().unwrap();
    for value in 0..5u8 {
        assert!(interface.transmit(&network, Frame::new(id, &[value; 8])));
    }

    std::thread::sleep(Duration::from_millis(200));

    for expected in 0..5u8 {
        let frame = peer.read_frame().expect("frame should have been forwarded");
        assert_eq!(frame.payload(), &[expected; 8]);
    }
    assert_eq!(transmitted.load(Ordering::SeqCst), 5);

    interface.stop();
}

#[test]
fn received_frames_reach_the_network_in_bus_order() {
    let bus = VirtualCanBus::new();
    let network = NetworkManager::new();
    let peer = bus.create_transport();
    peer.open();

    let interface = CanHardwareInterface::new();
    interface.assign(&network, Arc::new(bus.create_transport()));

    // Interleave the hardware event stream and the network dispatch into
    // one log: for every frame the received event must come first.
    let log = Arc::new(Mutex::new(Vec::new()));

    let hardware_log = Arc::clone(&log);
    interface.on_frame_received().add_listener(move |frame: &Frame| {
        hardware_log.lock().unwrap().push(("hardware", frame.data[0]));
    });

    let network_log = Arc::clone(&log);
    let callback: MessageCallback = Arc::new(move |message| {
        network_log.lock().unwrap().push(("network", message.data()[0]));
    });
    network.add_any_cf_pgn_callback(0xFEF1, callback);

    assert!(interface.start());

    let id = CanId::builder(0xFEF1, 0x42).build().unwrap();
    for value in 0..4u8 {
        assert!(peer.write_frame(&Frame::new(id, &[value; 8])));
    }

    std::thread::sleep(Duration::from_millis(200));
    interface.stop();

    let log = log.lock().unwrap();
    for value in 0..4u8 {
        let hardware_at = log
            .iter()
            .position(|entry| *entry == ("hardware", value))
            .expect("missing hardware event");
        let network_at = log
            .iter()
            .position(|entry| *entry == ("network", value))
            .expect("missing network dispatch");
        assert!(
            hardware_at < network_at,
            "frame {} reached the network before the received event",
            value
        );
    }
    // Network dispatch saw the frames in bus order.
    let network_entries: Vec<u8> = log
        .iter()
        .filter(|(stage, _)| *stage == "network")
        .map(|(_, value)| *value)
        .collect();
    assert_eq!(network_entries, vec![0, 1, 2, 3]);
}

#[test]
fn stop_clears_queues_and_allows_restart() {
    let bus = VirtualCanBus::new();
    let network = NetworkManager::new();
    let peer = bus.create_transport();
    peer.open();

    let interface = CanHardwareInterface::new();
    interface.assign(&network, Arc::new(bus.create_transport()));

    // Transmitting before start is refused.
    let id = CanId::builder(0xFEF1, 0x1C).build().unwrap();
    assert!(!interface.transmit(&network, Frame::new(id, &[0; 8])));

    assert!(interface.start());
    assert!(!interface.start(), "a second start must be refused");
    assert!(interface.transmit(&network, Frame::new(id, &[1; 8])));
    std::thread::sleep(Duration::from_millis(100));
    assert!(interface.stop());
    assert!(!interface.stop(), "a second stop must be refused");

    // Restart and keep working on the same channel assignment.
    assert!(interface.start());
    assert!(interface.transmit(&network, Frame::new(id, &[2; 8])));
    std::thread::sleep(Duration::from_millis(100));
    interface.stop();

    let mut seen = Vec::new();
    while let Some(frame) = peer.read_frame() {
        seen.push(frame.data[0]);
    }
    assert!(seen.contains(&1));
    assert!(seen.contains(&2));
}

#[test]
fn unassign_detaches_the_channel() {
    let bus = VirtualCanBus::new();
    let network = NetworkManager::new();

    let interface = CanHardwareInterface::new();
    interface.assign(&network, Arc::new(bus.create_transport()));
    assert!(interface.start());

    assert!(interface.unassign(&network));
    assert!(!interface.unassign(&network));
    assert_eq!(interface.channel_count(), 0);

    // With the sink cleared, network egress fails.
    let id = CanId::builder(0xFEF1, 0x1C).build().unwrap();
    assert!(!network.send_frame_raw(Frame::new(id, &[0; 8])));
    assert!(!interface.transmit(&network, Frame::new(id, &[0; 8])));

    interface.stop();
}

#[test]
fn periodic_ticks_drive_the_networks() {
    let network = NetworkManager::new();
    let bus = VirtualCanBus::new();

    let interface = CanHardwareInterface::new();
    assert_eq!(interface.get_periodic_interval(), 4);
    interface.set_periodic_interval(2);
    assert_eq!(interface.get_periodic_interval(), 2);

    interface.assign(&network, Arc::new(bus.create_transport()));

    let ticks = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&ticks);
    interface.on_periodic_tick().add_listener(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    // An internal control function only claims if ticks reach the network.
    let ecu = network.create_internal_control_function(capable_name(1), 0x1C);

    assert!(interface.start());
    std::thread::sleep(Duration::from_millis(800));
    interface.stop();

    assert!(ticks.load(Ordering::SeqCst) > 10);
    assert!(ecu.is_address_valid());
    assert_eq!(ecu.address(), 0x1C);
}
