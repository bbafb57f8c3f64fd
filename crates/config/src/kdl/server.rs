//! Server and listener KDL parsing.

use anyhow::Result;
use tracing::trace;

use certmesh_common::types::{ClientAuthMode, LogFormat, TlsVersion};

use crate::server::*;

use super::helpers::{get_child, get_int_entry, get_string_entry, get_string_list, int_to};

/// Parse server configuration block
pub fn parse_server_config(node: &kdl::KdlNode) -> Result<ServerConfig> {
    trace!("Parsing server configuration block");

    let config = ServerConfig {
        drain_timeout_secs: get_int_entry(node, "drain-timeout-secs")
            .map(|v| int_to(v, "drain-timeout-secs"))
            .transpose()?
            .unwrap_or_else(default_drain_timeout),
        handshake_timeout_secs: get_int_entry(node, "handshake-timeout-secs")
            .map(|v| int_to(v, "handshake-timeout-secs"))
            .transpose()?
            .unwrap_or_else(default_handshake_timeout),
        log_format: get_string_entry(node, "log-format")
            .map(|s| LogFormat::from_str_loose(&s))
            .unwrap_or_default(),
    };

    trace!(
        drain_timeout_secs = config.drain_timeout_secs,
        handshake_timeout_secs = config.handshake_timeout_secs,
        "Parsed server configuration"
    );

    Ok(config)
}

/// Parse listener configuration block
pub fn parse_listener_config(node: &kdl::KdlNode) -> Result<ListenerConfig> {
    trace!("Parsing listener configuration block");

    let min_tls_version = match get_string_entry(node, "min-tls-version") {
        Some(raw) => TlsVersion::from_str_loose(&raw).ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid min-tls-version '{}'. Valid versions: 1.2, 1.3",
                raw
            )
        })?,
        None => TlsVersion::default(),
    };

    let client_auth = match get_string_entry(node, "client-auth") {
        Some(raw) => ClientAuthMode::from_str_loose(&raw).ok_or_else(|| {
            anyhow::anyhow!("Invalid client-auth '{}'. Valid modes: none, request", raw)
        })?,
        None => ClientAuthMode::default(),
    };

    let alpn_protocols = if get_child(node, "alpn").is_some() {
        get_string_list(node, "alpn")
    } else {
        default_alpn_protocols()
    };

    let config = ListenerConfig {
        bind_address: get_string_entry(node, "bind-address").unwrap_or_else(default_bind_address),
        port: get_int_entry(node, "port")
            .map(|v| int_to(v, "port"))
            .transpose()?
            .unwrap_or_else(default_port),
        min_tls_version,
        cipher_suites: get_string_list(node, "cipher-suites"),
        client_auth,
        alpn_protocols,
    };

    trace!(
        address = %config.socket_address(),
        min_tls_version = %config.min_tls_version,
        cipher_suites = config.cipher_suites.len(),
        "Parsed listener"
    );

    Ok(config)
}
