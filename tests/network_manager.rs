//! Network-manager behavior: address-table invariants, partner binding,
//! callback dispatch, the send paths, and the busload estimate.
mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agribus::core::NULL_ADDRESS;
use agribus::network::callbacks::MessageCallback;
use agribus::network::control_function::ControlFunctionType;
use agribus::network::manager::NetworkManager;
use agribus::network::protocol::{OutboundPayload, TransmitResult};
use agribus::protocol::can_frame::Frame;
use agribus::protocol::can_id::CanId;
use agribus::protocol::name::{Name, NameField, NameFilter};

use helpers::{capable_name, claim_frame, settle, RecordingSink};

fn assert_table_invariant(network: &Arc<NetworkManager>) {
    for address in 0..=253u8 {
        if let Some(control_function) = network.get_control_function(address) {
            assert_eq!(
                control_function.address(),
                address,
                "slot {} holds a control function reporting a different address",
                address
            );
        }
    }
}

#[test]
fn claims_create_external_control_functions() {
    let network = NetworkManager::new();

    let name = Name::from_raw(0x1234);
    network.process_received_frame(&claim_frame(name, 0x26));
    network.update();

    let external = network.get_control_function(0x26).unwrap();
    assert_eq!(external.control_function_type(), ControlFunctionType::External);
    assert_eq!(external.name(), name);
    assert_eq!(external.address(), 0x26);
    assert_table_invariant(&network);
}

#[test]
fn a_reclaim_moves_the_control_function_between_slots() {
    let network = NetworkManager::new();
    let name = Name::from_raw(0x1234);

    network.process_received_frame(&claim_frame(name, 0x26));
    network.update();
    let original = network.get_control_function(0x26).unwrap();

    // The same NAME claims a different address: same control function, new
    // slot, old slot empty.
    network.process_received_frame(&claim_frame(name, 0x42));
    network.update();

    assert!(network.get_control_function(0x26).is_none());
    let moved = network.get_control_function(0x42).unwrap();
    assert!(Arc::ptr_eq(&original, &moved));
    assert_eq!(moved.address(), 0x42);
    assert_table_invariant(&network);
}

#[test]
fn competing_claims_never_leave_two_owners() {
    let network = NetworkManager::new();
    let first = Name::from_raw(0x10);
    let second = Name::from_raw(0x20);

    network.process_received_frame(&claim_frame(first, 0x26));
    network.process_received_frame(&claim_frame(second, 0x26));
    network.update();

    // The last claim processed owns the slot; the displaced node holds no
    // slot anywhere in the table.
    let owner = network.get_control_function(0x26).unwrap();
    assert_eq!(owner.name(), second);
    for address in 0..=253u8 {
        if let Some(control_function) = network.get_control_function(address) {
            assert_ne!(control_function.name(), first, "the displaced NAME still owns a slot");
        }
    }
    assert_table_invariant(&network);
}

#[test]
fn cannot_claim_releases_the_senders_slot() {
    let network = NetworkManager::new();
    let name = Name::from_raw(0x1234);

    network.process_received_frame(&claim_frame(name, 0x26));
    network.update();
    assert!(network.get_control_function(0x26).is_some());

    network.process_received_frame(&claim_frame(name, NULL_ADDRESS));
    network.update();

    assert!(network.get_control_function(0x26).is_none());
    assert_table_invariant(&network);
}

#[test]
fn partner_binds_to_a_matching_active_external() {
    let network = NetworkManager::new();

    // A virtual terminal (function 29) claims address 0x26 before the
    // partner exists.
    let terminal_name = Name::builder()
        .identity_number(500)
        .function(29)
        .arbitrary_address_capable(true)
        .build();
    network.process_received_frame(&claim_frame(terminal_name, 0x26));
    network.update();
    let external = network.get_control_function(0x26).unwrap();
    assert_eq!(external.control_function_type(), ControlFunctionType::External);

    let partner = network
        .create_partnered_control_function(vec![NameFilter::new(NameField::Function, 29)]);
    assert!(!partner.is_bound());

    network.update();

    // The partner inherited the external's identity and replaced it in the
    // table.
    assert!(partner.is_bound());
    assert_eq!(partner.address(), 0x26);
    assert_eq!(partner.name(), terminal_name);
    let slot = network.get_control_function(0x26).unwrap();
    assert!(Arc::ptr_eq(&slot, &partner));
    assert_eq!(slot.control_function_type(), ControlFunctionType::Partnered);
    assert_table_invariant(&network);
}

#[test]
fn partner_binds_directly_from_a_claim() {
    let network = NetworkManager::new();
    let partner = network
        .create_partnered_control_function(vec![NameFilter::new(NameField::Function, 29)]);
    network.update();
    assert!(!partner.is_bound());

    let terminal_name = Name::builder().identity_number(500).function(29).build();
    network.process_received_frame(&claim_frame(terminal_name, 0x26));
    network.update();

    assert!(partner.is_bound());
    assert_eq!(partner.address(), 0x26);
    assert_eq!(partner.name(), terminal_name);
    let slot = network.get_control_function(0x26).unwrap();
    assert!(Arc::ptr_eq(&slot, &partner));
}

#[test]
fn partner_with_unmatched_filters_stays_unbound() {
    let network = NetworkManager::new();
    let partner = network.create_partnered_control_function(vec![
        NameFilter::new(NameField::Function, 29),
        NameFilter::new(NameField::ManufacturerCode, 777),
    ]);

    let name = Name::builder().identity_number(500).function(29).build();
    network.process_received_frame(&claim_frame(name, 0x26));
    network.update();

    assert!(!partner.is_bound());
    assert_eq!(partner.address(), NULL_ADDRESS);
}

#[test]
fn global_callbacks_fire_for_broadcasts_from_known_sources() {
    let network = NetworkManager::new();
    let count = Arc::new(AtomicUsize::new(0));

    let counted = Arc::clone(&count);
    let callback: MessageCallback = Arc::new(move |message| {
        assert_eq!(message.pgn(), 0xFEF1);
        counted.fetch_add(1, Ordering::SeqCst);
    });
    assert!(network.add_global_pgn_callback(0xFEF1, Arc::clone(&callback)));
    // Re-registering the same closure is refused.
    assert!(!network.add_global_pgn_callback(0xFEF1, Arc::clone(&callback)));

    // Unknown source: the message is dropped.
    let id = CanId::builder(0xFEF1, 0x26).with_priority(3).build().unwrap();
    network.process_received_frame(&Frame::new(id, &[0; 8]));
    network.update();
    assert_eq!(count.load(Ordering::SeqCst), 0);

    // Once the source has claimed, the callback fires.
    network.process_received_frame(&claim_frame(Name::from_raw(0x55), 0x26));
    network.process_received_frame(&Frame::new(id, &[0; 8]));
    network.update();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    assert!(network.remove_global_pgn_callback(0xFEF1, &callback));
    network.process_received_frame(&Frame::new(id, &[0; 8]));
    network.update();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn any_cf_callbacks_see_directed_traffic_to_our_nodes() {
    let network = NetworkManager::new();
    let sink = RecordingSink::new();
    network.set_frame_sink(sink);
    let ecu = network.create_internal_control_function(capable_name(1), 0x1C);
    settle(&[&network], Duration::from_millis(600));
    assert_eq!(ecu.address(), 0x1C);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    let callback: MessageCallback = Arc::new(move |message| {
        recorded.lock().unwrap().push(message.destination_address());
    });
    assert!(network.add_any_cf_pgn_callback(0xEF00, Arc::clone(&callback)));

    // Directed to us: dispatched.
    let to_us = CanId::builder(0xEF00, 0x26).to_destination(0x1C).build().unwrap();
    network.process_received_frame(&Frame::new(to_us, &[1; 8]));
    // Directed to some other node: ignored.
    let to_other = CanId::builder(0xEF00, 0x26).to_destination(0x99).build().unwrap();
    network.process_received_frame(&Frame::new(to_other, &[2; 8]));
    network.update();

    assert_eq!(*seen.lock().unwrap(), vec![0x1C]);
}

#[test]
fn partner_callbacks_require_the_bound_source() {
    let network = NetworkManager::new();
    let sink = RecordingSink::new();
    network.set_frame_sink(sink);
    let ecu = network.create_internal_control_function(capable_name(1), 0x1C);
    settle(&[&network], Duration::from_millis(600));
    assert_eq!(ecu.address(), 0x1C);

    let partner = network
        .create_partnered_control_function(vec![NameFilter::new(NameField::Function, 29)]);
    let terminal_name = Name::builder().identity_number(500).function(29).build();
    network.process_received_frame(&claim_frame(terminal_name, 0x26));
    // An unrelated node also claims.
    network.process_received_frame(&claim_frame(Name::from_raw(0x9999), 0x30));
    network.update();
    assert!(partner.is_bound());

    let count = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&count);
    let callback: MessageCallback = Arc::new(move |_message| {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    assert!(partner.add_pgn_callback(0xE800, Arc::clone(&callback)));
    // Partner callbacks are a partnered-only surface.
    assert!(!ecu.add_pgn_callback(0xE800, Arc::clone(&callback)));

    // From the partner to us: fires.
    let from_partner = CanId::builder(0xE800, 0x26).to_destination(0x1C).build().unwrap();
    network.process_received_frame(&Frame::new(from_partner, &[0; 8]));
    // Same PGN from the unrelated node: does not fire.
    let from_other = CanId::builder(0xE800, 0x30).to_destination(0x1C).build().unwrap();
    network.process_received_frame(&Frame::new(from_other, &[0; 8]));
    network.update();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn single_frame_sends_are_emitted_directly() {
    let network = NetworkManager::new();
    let sink = RecordingSink::new();
    network.set_frame_sink(sink.clone());
    let ecu = network.create_internal_control_function(capable_name(1), 0x1C);
    settle(&[&network], Duration::from_millis(600));
    sink.take_frames();

    let completed = Arc::new(Mutex::new(None::<bool>));
    let completion_flag = Arc::clone(&completed);
    let sent = network.send_can_message(
        0xFEF1,
        OutboundPayload::Data(vec![0xAA; 8]),
        &ecu,
        None,
        3,
        Some(Box::new(move |result: &TransmitResult| {
            *completion_flag.lock().unwrap() = Some(result.success);
        })),
    );

    assert!(sent);
    assert_eq!(*completed.lock().unwrap(), Some(true));
    let frames = sink.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id.0, 0x0CFE_F11C);
    assert_eq!(frames[0].payload(), &[0xAA; 8]);
}

#[test]
fn oversize_sends_without_a_protocol_fail() {
    let network = NetworkManager::new();
    let sink = RecordingSink::new();
    network.set_frame_sink(sink.clone());
    let ecu = network.create_internal_control_function(capable_name(1), 0x1C);
    settle(&[&network], Duration::from_millis(600));
    sink.take_frames();

    let completed = Arc::new(Mutex::new(None::<bool>));
    let completion_flag = Arc::clone(&completed);
    let sent = network.send_can_message(
        0xFEF1,
        OutboundPayload::Data(vec![0; 100]),
        &ecu,
        None,
        6,
        Some(Box::new(move |result: &TransmitResult| {
            *completion_flag.lock().unwrap() = Some(result.success);
        })),
    );

    assert!(!sent);
    assert_eq!(*completed.lock().unwrap(), Some(false));
    assert!(sink.take_frames().is_empty());

    // Above the absolute ceiling the message is rejected outright.
    assert!(!network.send_can_message(
        0xFEF1,
        OutboundPayload::Data(vec![0; 1786]),
        &ecu,
        None,
        6,
        None,
    ));
}

#[test]
fn broadcast_format_pgns_reject_specific_destinations() {
    let network = NetworkManager::new();
    let sink = RecordingSink::new();
    network.set_frame_sink(sink.clone());
    let ecu = network.create_internal_control_function(capable_name(1), 0x1C);
    settle(&[&network], Duration::from_millis(600));

    network.process_received_frame(&claim_frame(Name::from_raw(0x55), 0x26));
    network.update();
    let destination = network.get_control_function(0x26).unwrap();
    sink.take_frames();

    // 0xFEF1 is a broadcast-format PGN; it cannot be sent to 0x26.
    let sent = network.send_can_message(
        0xFEF1,
        OutboundPayload::Data(vec![0; 8]),
        &ecu,
        Some(&destination),
        6,
        None,
    );
    assert!(!sent);
    assert!(sink.take_frames().is_empty());

    // A destination-specific PGN works.
    let sent = network.send_can_message(
        0xEF00,
        OutboundPayload::Data(vec![0; 8]),
        &ecu,
        Some(&destination),
        6,
        None,
    );
    assert!(sent);
    let frames = sink.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id.destination_address(), 0x26);
}

#[test]
fn sends_from_foreign_control_functions_are_rejected() {
    let network = NetworkManager::new();
    let sink = RecordingSink::new();
    network.set_frame_sink(sink);

    network.process_received_frame(&claim_frame(Name::from_raw(0x55), 0x26));
    network.update();
    let external = network.get_control_function(0x26).unwrap();

    assert!(!network.send_can_message(
        0xFEF1,
        OutboundPayload::Data(vec![0; 8]),
        &external,
        None,
        6,
        None,
    ));
}

#[test]
fn busload_accumulates_with_traffic() {
    let network = NetworkManager::new();
    assert_eq!(network.get_estimated_busload(), 0.0);

    for _ in 0..100 {
        network.process_received_frame(&claim_frame(Name::from_raw(0x55), 0x26));
    }
    // Let a busload bucket roll over.
    std::thread::sleep(Duration::from_millis(120));
    network.update();

    let load = network.get_estimated_busload();
    assert!(load > 0.0);
    assert!(load <= 100.0);
}

#[test]
fn destroyed_partners_leave_an_external_shadow() {
    let network = NetworkManager::new();
    let partner = network
        .create_partnered_control_function(vec![NameFilter::new(NameField::Function, 29)]);
    let terminal_name = Name::builder().identity_number(500).function(29).build();
    network.process_received_frame(&claim_frame(terminal_name, 0x26));
    network.update();
    assert!(partner.is_bound());

    assert!(network.destroy_control_function(&partner));
    assert!(!network.destroy_control_function(&partner));

    // The device is still on the bus, so the slot now holds a plain
    // external control function with the same identity.
    let shadow = network.get_control_function(0x26).unwrap();
    assert_eq!(shadow.control_function_type(), ControlFunctionType::External);
    assert_eq!(shadow.name(), terminal_name);
    assert_eq!(shadow.address(), 0x26);
}

#[test]
fn broadcasts_from_our_own_node_skip_global_callbacks() {
    let network = NetworkManager::new();
    let sink = RecordingSink::new();
    network.set_frame_sink(sink);
    let ecu = network.create_internal_control_function(capable_name(1), 0x1C);
    settle(&[&network], Duration::from_millis(600));
    assert_eq!(ecu.address(), 0x1C);

    let count = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&count);
    network.add_global_pgn_callback(
        0xFEF1,
        Arc::new(move |_message| {
            counted.fetch_add(1, Ordering::SeqCst);
        }),
    );

    // A frame sourced from our own address (as echoed by some adapters).
    let id = CanId::builder(0xFEF1, 0x1C).build().unwrap();
    network.process_received_frame(&Frame::new(id, &[0; 8]));
    network.update();

    assert_eq!(count.load(Ordering::SeqCst), 0);
}
