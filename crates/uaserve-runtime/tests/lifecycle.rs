//! Server lifecycle integration tests against the simulation event loop

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use uaserve_core::{
    EventLoop, EventLoopState, ServerConfig, ServerLimits, PARAM_ADDRESS, PARAM_PORT,
};
use uaserve_harness::SimEventLoop;
use uaserve_runtime::{Server, ServerLifecycle, NS0_URI};

fn started_server(el: &Arc<SimEventLoop>) -> Server {
    let server = Server::new(ServerConfig::testing(Arc::clone(el) as Arc<dyn EventLoop>)).unwrap();
    server.run_startup().unwrap();
    server
}

#[test]
fn empty_config_uses_default_listener() {
    let el = SimEventLoop::new();
    let server = started_server(&el);
    assert_eq!(server.lifecycle(), ServerLifecycle::Started);
    assert!(server.start_time().is_some());

    // One listen request on the default URL: port 4840, all interfaces
    let requests = el.connection_manager().open_requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].listening);
    assert_eq!(requests[0].params.get_u16(PARAM_PORT), Some(4840));
    assert_eq!(requests[0].params.get_string(PARAM_ADDRESS), None);

    // ns0 is the standard namespace, ns1 the application URI
    assert_eq!(server.get_namespace_by_index(0).unwrap(), NS0_URI);
    assert_eq!(server.get_namespace_by_index(1).unwrap(), "urn:uaserve:test");

    // The iteration never reports more than its own pump bound
    let to_next = server.run_iterate(true);
    assert!(to_next <= 50);
}

#[test]
fn startup_is_idempotent_past_fresh() {
    let el = SimEventLoop::new();
    let server = started_server(&el);
    let start_time = server.start_time();

    server.run_startup().unwrap();
    assert_eq!(server.start_time(), start_time);
    // No second listen socket was opened
    assert_eq!(el.connection_manager().open_requests().len(), 1);
}

#[test]
fn startup_registers_housekeeping_and_shutdown_cancels_it() {
    let el = SimEventLoop::new();
    let server = Server::new(ServerConfig::testing(Arc::clone(&el) as Arc<dyn EventLoop>)).unwrap();
    assert_eq!(el.next_cyclic_time(), None);

    server.run_startup().unwrap();
    assert!(el.next_cyclic_time().is_some());

    server.run_shutdown().unwrap();
    assert_eq!(server.lifecycle(), ServerLifecycle::Stopped);
    assert_eq!(el.next_cyclic_time(), None);
    assert!(server.start_time().is_none());
    assert_eq!(el.state(), EventLoopState::Stopped);
}

#[test]
fn housekeeping_expires_sessions_and_channels() {
    let el = SimEventLoop::new();
    let mut config = ServerConfig::testing(Arc::clone(&el) as Arc<dyn EventLoop>);
    config.limits = ServerLimits {
        session_timeout: Duration::from_millis(100),
        secure_channel_lifetime: Duration::from_millis(300),
        ..ServerLimits::default()
    };
    let server = Server::new(config).unwrap();
    server.run_startup().unwrap();

    let channel = server.open_secure_channel("http://opcfoundation.org/UA/SecurityPolicy#None");
    server.create_session(Some(channel), "expiring client").unwrap();
    assert_eq!(server.statistics().sessions.current_session_count, 1);
    assert_eq!(server.statistics().secure_channels.current_channel_count, 1);

    // Jump past both lifetimes; the next housekeeping tick sweeps them
    el.advance(Duration::from_millis(2_000));
    server.run_iterate(true);

    let stats = server.statistics();
    assert_eq!(stats.sessions.current_session_count, 0);
    assert_eq!(stats.sessions.session_timeout_count, 1);
    assert_eq!(stats.secure_channels.current_channel_count, 0);
    assert_eq!(stats.secure_channels.channel_timeout_count, 1);
}

#[test]
fn delayed_shutdown_honors_grace_period() {
    let el = SimEventLoop::new();
    let mut config = ServerConfig::testing(Arc::clone(&el) as Arc<dyn EventLoop>);
    config.shutdown_delay = Duration::from_millis(500);
    let server = Server::new(config).unwrap();
    server.run_startup().unwrap();

    // The request arms the deadline instead of stopping immediately
    assert!(!server.request_shutdown());
    assert!(!server.shutdown_deadline_reached());

    el.advance(Duration::from_millis(600));
    assert!(server.shutdown_deadline_reached());

    server.run_shutdown().unwrap();
    assert_eq!(server.lifecycle(), ServerLifecycle::Stopped);
    assert_eq!(el.state(), EventLoopState::Stopped);
}

#[test]
fn run_drives_startup_iterate_shutdown() {
    let el = SimEventLoop::new();
    let server = Server::new(ServerConfig::testing(Arc::clone(&el) as Arc<dyn EventLoop>)).unwrap();

    let running = AtomicBool::new(false);
    server.run(&running).unwrap();
    assert_eq!(server.lifecycle(), ServerLifecycle::Stopped);
}

#[test]
fn run_with_delay_keeps_iterating_until_deadline() {
    let el = SimEventLoop::new();
    let mut config = ServerConfig::testing(Arc::clone(&el) as Arc<dyn EventLoop>);
    config.shutdown_delay = Duration::from_millis(500);
    let server = Server::new(config).unwrap();

    let running = AtomicBool::new(false);
    server.run(&running).unwrap();
    assert_eq!(server.lifecycle(), ServerLifecycle::Stopped);
    // The grace period elapsed on the simulated clock before stopping
    assert!(el.now_monotonic().as_millis() >= 500);
}

#[test]
fn external_event_loop_is_not_stopped() {
    let el = SimEventLoop::new();
    let mut config = ServerConfig::testing(Arc::clone(&el) as Arc<dyn EventLoop>);
    config.external_event_loop = true;
    let server = Server::new(config).unwrap();
    server.run_startup().unwrap();

    server.run_shutdown().unwrap();
    assert_eq!(server.lifecycle(), ServerLifecycle::Stopped);
    assert_eq!(el.state(), EventLoopState::Started);
}

#[test]
fn discovery_urls_skip_wildcard_hosts() {
    let el = SimEventLoop::new();
    let mut config = ServerConfig::testing(Arc::clone(&el) as Arc<dyn EventLoop>);
    config.server_urls = vec![
        "opc.tcp://:4840".into(),
        "opc.tcp://plc.example:4840".into(),
    ];
    let server = Server::new(config).unwrap();
    server.run_startup().unwrap();

    server.with_config(|config| {
        assert_eq!(
            config.application.discovery_urls,
            vec!["opc.tcp://plc.example:4840".to_string()]
        );
        // Every endpoint republishes the application description
        for endpoint in &config.endpoints {
            assert_eq!(endpoint.server.discovery_urls, config.application.discovery_urls);
        }
    });

    // Both URLs still got a listen socket
    assert_eq!(el.connection_manager().open_requests().len(), 2);
}

#[test]
fn fresh_server_rejects_construction_without_node_store() {
    let el = SimEventLoop::new();
    let mut config = ServerConfig::testing(Arc::clone(&el) as Arc<dyn EventLoop>);
    config.node_store = None;
    assert!(Server::new(config).is_err());
}
