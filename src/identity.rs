//! # Client identity
//!
//! Every proxy instance presents a client id to the broker and the
//! coordination service and stamps it on its logs. The id has to tell one
//! instance apart from every other instance in the fleet, stay stable for the
//! lifetime of the process and still be readable by an operator:
//!
//! ```text
//! proxy_<host>_<pid>_<UTC timestamp>
//! ```
//!
//! `<host>` comes from the first resolver that succeeds: the local hostname,
//! then the outbound IP address. When both fail 8 random bytes are used, so
//! generating an id never fails.

use std::net::UdpSocket;

use chrono::{SecondsFormat, Utc};
use rand::RngCore;

/// Prefix of every generated client id.
pub const CLIENT_ID_PREFIX: &str = "proxy";

/// One step of the fallback chain. `None` moves on to the next step.
pub type Resolver = fn() -> Option<String>;

/// Resolvers tried in order by [`new_client_id`].
pub const DEFAULT_RESOLVERS: &[Resolver] = &[local_hostname, outbound_ip];

/// Creates a client id using [`DEFAULT_RESOLVERS`].
pub fn new_client_id() -> String {
    client_id_from(DEFAULT_RESOLVERS)
}

/// Creates a client id from the first resolver that yields a host part,
/// falling back to random bytes.
pub fn client_id_from(resolvers: &[Resolver]) -> String {
    let host = resolvers
        .iter()
        .find_map(|resolve| resolve())
        .unwrap_or_else(random_hex);
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    format!(
        "{CLIENT_ID_PREFIX}_{host}_{}_{timestamp}",
        std::process::id()
    )
}

/// Kernel hostname of this machine.
pub fn local_hostname() -> Option<String> {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
}

/// Address of the interface used for outbound traffic.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
pub fn outbound_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() || ip.is_loopback() {
        return None;
    }
    Some(ip.to_string())
}

fn random_hex() -> String {
    let mut buffer = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut buffer);
    hex::encode_upper(buffer)
}
