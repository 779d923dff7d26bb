//! Advertised-address helpers.
//!
//! Registration needs a concrete address peers can reach. Addresses are
//! `host:port` (IPv6 hosts bracketed) or bare queue names for brokers
//! that route by name rather than port.

use std::net::IpAddr;

/// Errors from address parsing.
#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("invalid address: {0}")]
    Invalid(String),
}

/// Split an address into host and optional port.
///
/// Accepts `host:port`, `[v6]:port` and bare hosts/queue names.
pub fn parse_host_port(addr: &str) -> Result<(String, Option<String>), AddrError> {
    if addr.is_empty() {
        return Err(AddrError::Invalid(addr.to_string()));
    }

    // Bracketed IPv6: [::1]:8080
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest
            .split_once("]:")
            .ok_or_else(|| AddrError::Invalid(addr.to_string()))?;
        return Ok((host.to_string(), Some(port.to_string())));
    }

    match addr.matches(':').count() {
        0 => Ok((addr.to_string(), None)),
        1 => {
            let (host, port) = addr.split_once(':').expect("one separator present");
            Ok((host.to_string(), Some(port.to_string())))
        }
        // Unbracketed IPv6 is ambiguous.
        _ => Err(AddrError::Invalid(addr.to_string())),
    }
}

/// Resolve a host into something peers can dial.
///
/// Unspecified hosts (empty, `0.0.0.0`, `::`) fall back to the loopback
/// address; anything else is taken as given.
pub fn extract(host: &str) -> String {
    match host {
        "" | "0.0.0.0" | "::" | "[::]" => "127.0.0.1".to_string(),
        other => other.to_string(),
    }
}

/// Join a host and port, bracketing IPv6 hosts.
pub fn host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Whether the host is an IP literal (as opposed to a hostname or queue
/// name). Literals never change under resolution, so registrations built
/// from them can be cached.
pub fn is_ip_literal(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}
