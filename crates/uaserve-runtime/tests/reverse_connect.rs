//! Reverse-connect integration tests against the simulation event loop

use std::sync::{Arc, Mutex};
use std::time::Duration;

use uaserve_core::{EventLoop, EventSourceState, ServerConfig, UaError};
use uaserve_harness::SimEventLoop;
use uaserve_runtime::{
    ReverseConnectHandle, ReverseConnectStateCallback, SecureChannelState, Server,
};

type StateLog = Arc<Mutex<Vec<(ReverseConnectHandle, SecureChannelState)>>>;

fn state_recorder() -> (StateLog, ReverseConnectStateCallback) {
    let log: StateLog = Arc::new(Mutex::new(Vec::new()));
    let log_in_cb = Arc::clone(&log);
    let callback: ReverseConnectStateCallback = Box::new(move |handle, state| {
        log_in_cb.lock().unwrap().push((handle, state));
    });
    (log, callback)
}

fn started_server(el: &Arc<SimEventLoop>) -> Server {
    let server = Server::new(ServerConfig::testing(Arc::clone(el) as Arc<dyn EventLoop>)).unwrap();
    server.run_startup().unwrap();
    server
}

#[test]
fn happy_path_reaches_connected() {
    let el = SimEventLoop::new();
    let server = started_server(&el);
    let (log, callback) = state_recorder();

    let handle = server
        .add_reverse_connect("opc.tcp://client.example:4841", Some(callback))
        .unwrap();
    assert!(handle > 0);

    // The open request carries address and port of the target
    let requests = el.connection_manager().open_requests();
    let outbound = requests.iter().find(|r| !r.listening).unwrap();
    assert_eq!(outbound.params.get_string("address"), Some("client.example"));
    assert_eq!(outbound.params.get_u16("port"), Some(4841));

    // Transport confirmation arrives on the next iteration
    server.run_iterate(true);
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            (handle, SecureChannelState::Connecting),
            (handle, SecureChannelState::Connected)
        ]
    );
}

#[test]
fn transport_close_falls_back_and_retry_reconnects() {
    let el = SimEventLoop::new();
    let cm = el.connection_manager();
    let server = started_server(&el);
    let (log, callback) = state_recorder();

    let handle = server
        .add_reverse_connect("opc.tcp://client.example:4841", Some(callback))
        .unwrap();
    server.run_iterate(true);

    let connection_id = cm.open_requests().iter().find(|r| !r.listening).unwrap().connection_id;
    cm.drop_connection(connection_id);
    server.run_iterate(true);
    assert_eq!(log.lock().unwrap().last().unwrap(), &(handle, SecureChannelState::Closed));

    // The 1 Hz retry re-attempts the closed entry; the transport
    // confirmation arrives one iteration later
    el.advance(Duration::from_millis(1_000));
    server.run_iterate(true);
    server.run_iterate(true);
    let states: Vec<SecureChannelState> =
        log.lock().unwrap().iter().map(|(_, s)| *s).collect();
    assert_eq!(
        states,
        vec![
            SecureChannelState::Connecting,
            SecureChannelState::Connected,
            SecureChannelState::Closed,
            SecureChannelState::Connecting,
            SecureChannelState::Connected,
        ]
    );
}

#[test]
fn attempt_defers_until_connection_manager_starts() {
    let el = SimEventLoop::new();
    let server = Server::new(ServerConfig::testing(Arc::clone(&el) as Arc<dyn EventLoop>)).unwrap();
    // No startup: the event loop and its connection manager are fresh
    let (log, callback) = state_recorder();

    let handle = server
        .add_reverse_connect("opc.tcp://client.example:4841", Some(callback))
        .unwrap();
    assert!(el.connection_manager().open_requests().is_empty());
    assert!(log.lock().unwrap().is_empty());
    // The retry callback is armed even though the attempt was deferred
    assert!(el.next_cyclic_time().is_some());

    // Once the manager is up, the next tick connects
    el.start().unwrap();
    el.advance(Duration::from_millis(1_000));
    el.run(Duration::ZERO).unwrap();
    el.run(Duration::ZERO).unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            (handle, SecureChannelState::Connecting),
            (handle, SecureChannelState::Connected)
        ]
    );
}

#[test]
fn rapid_remove_frees_synchronously() {
    let el = SimEventLoop::new();
    let server = Server::new(ServerConfig::testing(Arc::clone(&el) as Arc<dyn EventLoop>)).unwrap();
    let (log, callback) = state_recorder();

    let handle = server
        .add_reverse_connect("opc.tcp://client.example:4841", Some(callback))
        .unwrap();
    assert_eq!(server.reverse_connect_count(), 1);
    assert!(el.next_cyclic_time().is_some());

    // Removed before any transport callback: released on the spot
    server.remove_reverse_connect(handle).unwrap();
    assert_eq!(server.reverse_connect_count(), 0);
    // The retry cyclic callback is deregistered with the last entry
    assert_eq!(el.next_cyclic_time(), None);
    // A never-connected entry triggers no state callback
    assert!(log.lock().unwrap().is_empty());

    assert!(matches!(
        server.remove_reverse_connect(handle),
        Err(UaError::NotFound)
    ));
}

#[test]
fn remove_with_live_connection_quarantines_until_close_confirmed() {
    let el = SimEventLoop::new();
    let server = started_server(&el);
    let (log, callback) = state_recorder();

    let handle = server
        .add_reverse_connect("opc.tcp://client.example:4841", Some(callback))
        .unwrap();
    server.run_iterate(true);
    assert_eq!(log.lock().unwrap().last().unwrap(), &(handle, SecureChannelState::Connected));

    server.remove_reverse_connect(handle).unwrap();
    // The entry survives until the transport confirms and the delayed
    // callback runs at the end of the next iteration
    assert_eq!(server.reverse_connect_count(), 1);

    server.run_iterate(true);
    assert_eq!(server.reverse_connect_count(), 0);
    assert_eq!(log.lock().unwrap().last().unwrap(), &(handle, SecureChannelState::Closed));

    // No further callback after reclamation
    let recorded = log.lock().unwrap().len();
    el.advance(Duration::from_millis(2_000));
    server.run_iterate(true);
    assert_eq!(log.lock().unwrap().len(), recorded);
}

#[test]
fn failed_open_keeps_entry_for_retry() {
    let el = SimEventLoop::new();
    let cm = el.connection_manager();
    let server = started_server(&el);
    let (log, callback) = state_recorder();

    cm.fail_next_open();
    let handle = server
        .add_reverse_connect("opc.tcp://client.example:4841", Some(callback))
        .unwrap();
    // The failed attempt still transitions the entry to connecting
    assert_eq!(*log.lock().unwrap(), vec![(handle, SecureChannelState::Connecting)]);
    assert_eq!(server.reverse_connect_count(), 1);
}

#[test]
fn handles_are_never_reused() {
    let el = SimEventLoop::new();
    let server = started_server(&el);

    let first = server.add_reverse_connect("opc.tcp://a.example:4841", None).unwrap();
    server.remove_reverse_connect(first).unwrap_or(());
    let second = server.add_reverse_connect("opc.tcp://b.example:4841", None).unwrap();
    assert!(second > first);
}

#[test]
fn invalid_url_is_rejected() {
    let el = SimEventLoop::new();
    let server = started_server(&el);
    assert!(matches!(
        server.add_reverse_connect("http://client.example", None),
        Err(UaError::InvalidUrl { .. })
    ));
    assert_eq!(server.reverse_connect_count(), 0);
}

#[test]
fn shutdown_tears_down_reverse_connects() {
    let el = SimEventLoop::new();
    let server = started_server(&el);
    let (log, callback) = state_recorder();

    let handle = server
        .add_reverse_connect("opc.tcp://client.example:4841", Some(callback))
        .unwrap();
    server.run_iterate(true);
    assert_eq!(log.lock().unwrap().last().unwrap(), &(handle, SecureChannelState::Connected));

    server.run_shutdown().unwrap();
    assert_eq!(server.reverse_connect_count(), 0);
    assert_eq!(log.lock().unwrap().last().unwrap(), &(handle, SecureChannelState::Closed));
    assert_eq!(el.next_cyclic_time(), None);
}

#[test]
fn connection_manager_stopped_mid_flight_defers_attempts() {
    let el = SimEventLoop::new();
    let cm = el.connection_manager();
    let server = started_server(&el);
    let (log, callback) = state_recorder();

    let handle = server
        .add_reverse_connect("opc.tcp://client.example:4841", Some(callback))
        .unwrap();
    server.run_iterate(true);

    // The transport goes away; the entry falls back to closed
    let connection_id = cm.open_requests().iter().find(|r| !r.listening).unwrap().connection_id;
    cm.set_state(EventSourceState::Stopped);
    cm.drop_connection(connection_id);
    server.run_iterate(true);
    assert_eq!(log.lock().unwrap().last().unwrap(), &(handle, SecureChannelState::Closed));

    // Retries defer while the manager is down and no new open is recorded
    let opens_before = cm.open_requests().len();
    el.advance(Duration::from_millis(3_000));
    server.run_iterate(true);
    assert_eq!(cm.open_requests().len(), opens_before);
}
