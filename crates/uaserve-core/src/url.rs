//! Endpoint URL parsing
//!
//! Implements the `opc.tcp://[host][:port][/path]` grammar. The host may be
//! empty ("listen on all interfaces"), the port defaults to 4840, and IPv6
//! hosts are written in brackets.

use crate::errors::{UaError, UaResult};

/// Default OPC UA TCP port
pub const DEFAULT_PORT: u16 = 4840;

/// URL scheme accepted by the TCP transport
pub const OPC_TCP_SCHEME: &str = "opc.tcp://";

// ----------------------------------------------------------------------------
// Parsed Endpoint URL
// ----------------------------------------------------------------------------

/// Components of an `opc.tcp` endpoint URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUrl {
    /// Hostname or IP address; empty means "any interface"
    pub host: String,
    /// TCP port, defaulted to 4840 when absent
    pub port: u16,
    /// Path after the authority, without the leading slash
    pub path: String,
}

/// Parse an endpoint URL of the form `opc.tcp://[host][:port][/path]`
pub fn parse_endpoint_url(url: &str) -> UaResult<EndpointUrl> {
    let invalid = || UaError::InvalidUrl { url: url.to_string() };

    let rest = url.strip_prefix(OPC_TCP_SCHEME).ok_or_else(invalid)?;

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx + 1..]),
        None => (rest, ""),
    };

    // Bracketed IPv6 hosts contain colons, so the authority is split after
    // the closing bracket rather than at the first colon.
    let (host, port_str) = if let Some(stripped) = authority.strip_prefix('[') {
        let end = stripped.find(']').ok_or_else(invalid)?;
        let host = &stripped[..end];
        let after = &stripped[end + 1..];
        match after.strip_prefix(':') {
            Some(p) => (host, Some(p)),
            None if after.is_empty() => (host, None),
            None => return Err(invalid()),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (authority, None),
        }
    };

    let port = match port_str {
        Some("") => return Err(invalid()),
        Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
        None => DEFAULT_PORT,
    };

    Ok(EndpointUrl {
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
