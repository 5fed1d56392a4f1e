//! Certificate rotation integration tests

use std::sync::Arc;

use uaserve_core::{
    ByteString, EndpointDescription, EventLoop, SecurityPolicy, ServerConfig,
    SECURITY_POLICY_NONE_URI,
};
use uaserve_harness::SimEventLoop;
use uaserve_runtime::Server;

const POLICY_URI: &str = "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256";

fn server_with_certified_endpoint(el: &Arc<SimEventLoop>, cert: &ByteString) -> Server {
    let mut config = ServerConfig::testing(Arc::clone(el) as Arc<dyn EventLoop>);
    config.security_policies.push(SecurityPolicy::new(
        POLICY_URI,
        cert.clone(),
        ByteString::from("old-key"),
    ));
    config.endpoints.push(EndpointDescription {
        endpoint_url: "opc.tcp://plc.example:4840".into(),
        security_policy_uri: POLICY_URI.into(),
        server_certificate: cert.clone(),
        server: Default::default(),
    });
    let server = Server::new(config).unwrap();
    server.run_startup().unwrap();
    server
}

#[test]
fn rotation_closes_bound_sessions_and_channels() {
    let el = SimEventLoop::new();
    let old_cert = ByteString::from("old-cert");
    let new_cert = ByteString::from("new-cert");
    let new_key = ByteString::from("new-key");
    let server = server_with_certified_endpoint(&el, &old_cert);

    let channel = server.open_secure_channel(POLICY_URI);
    server.create_session(Some(channel), "operator").unwrap();
    assert_eq!(server.statistics().sessions.current_session_count, 1);
    assert_eq!(server.statistics().secure_channels.current_channel_count, 1);

    server
        .update_certificate(&old_cert, &new_cert, &new_key, true, true)
        .unwrap();

    let stats = server.statistics();
    assert_eq!(stats.sessions.current_session_count, 0);
    assert_eq!(stats.secure_channels.current_channel_count, 0);

    server.with_config(|config| {
        let endpoint = config
            .endpoints
            .iter()
            .find(|e| e.security_policy_uri == POLICY_URI)
            .unwrap();
        assert_eq!(endpoint.server_certificate, new_cert);

        let policy = config.security_policy_by_uri(POLICY_URI).unwrap();
        assert_eq!(policy.local_certificate, new_cert);
        assert_eq!(policy.private_key(), &new_key);
    });
}

#[test]
fn rotation_spares_unrelated_sessions() {
    let el = SimEventLoop::new();
    let old_cert = ByteString::from("old-cert");
    let server = server_with_certified_endpoint(&el, &old_cert);

    // A session over the None policy is not bound to the rotated certificate
    let plain_channel = server.open_secure_channel(SECURITY_POLICY_NONE_URI);
    server.create_session(Some(plain_channel), "plain client").unwrap();
    let certified_channel = server.open_secure_channel(POLICY_URI);
    server.create_session(Some(certified_channel), "secured client").unwrap();

    server
        .update_certificate(
            &old_cert,
            &ByteString::from("new-cert"),
            &ByteString::from("new-key"),
            true,
            true,
        )
        .unwrap();

    let stats = server.statistics();
    assert_eq!(stats.sessions.current_session_count, 1);
    assert_eq!(stats.secure_channels.current_channel_count, 1);
}

#[test]
fn rotation_without_close_flags_only_swaps_certificates() {
    let el = SimEventLoop::new();
    let old_cert = ByteString::from("old-cert");
    let new_cert = ByteString::from("new-cert");
    let server = server_with_certified_endpoint(&el, &old_cert);

    let channel = server.open_secure_channel(POLICY_URI);
    server.create_session(Some(channel), "operator").unwrap();

    server
        .update_certificate(&old_cert, &new_cert, &ByteString::from("new-key"), false, false)
        .unwrap();

    // Existing traffic keeps running on the old secrets until re-negotiated
    let stats = server.statistics();
    assert_eq!(stats.sessions.current_session_count, 1);
    assert_eq!(stats.secure_channels.current_channel_count, 1);
    server.with_config(|config| {
        assert_eq!(
            config.security_policy_by_uri(POLICY_URI).unwrap().local_certificate,
            new_cert
        );
    });
}

#[test]
fn rotation_with_unknown_certificate_changes_nothing() {
    let el = SimEventLoop::new();
    let old_cert = ByteString::from("old-cert");
    let server = server_with_certified_endpoint(&el, &old_cert);

    server
        .update_certificate(
            &ByteString::from("some-other-cert"),
            &ByteString::from("new-cert"),
            &ByteString::from("new-key"),
            true,
            true,
        )
        .unwrap();

    server.with_config(|config| {
        assert_eq!(
            config.security_policy_by_uri(POLICY_URI).unwrap().local_certificate,
            old_cert
        );
    });
}
