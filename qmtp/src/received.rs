//! `Received:` trace header prepended to every message

use chrono::{DateTime, Utc};

/// Identity of both ends of the connection, as reported by the TCP server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Name or address of the local end
    pub local: Option<String>,
    /// Address of the client
    pub remote_ip: Option<String>,
    /// Reverse DNS name of the client
    pub remote_host: Option<String>,
    /// Identity of the remote user (RFC 1413), if known
    pub remote_info: Option<String>,
}

// Header bytes outside this set are replaced with '?'
fn is_safe(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ".@%+/=:-".contains(ch)
}

fn push_safe(out: &mut String, value: Option<&str>) {
    out.extend(
        value
            .unwrap_or("unknown")
            .chars()
            .map(|c| if is_safe(c) { c } else { '?' }),
    );
}

/// Format the trace header for a message received now-ish at `date`
pub fn received_header(peer: &PeerInfo, date: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(128);
    out.push_str("Received: from ");
    push_safe(&mut out, peer.remote_host.as_deref());
    out.push_str(" (");
    if let Some(info) = peer.remote_info.as_deref() {
        push_safe(&mut out, Some(info));
        out.push('@');
    }
    push_safe(&mut out, peer.remote_ip.as_deref());
    out.push_str(")\n  by ");
    push_safe(&mut out, peer.local.as_deref());
    out.push_str(" with QMTP; ");
    out.push_str(&date.format("%-d %b %Y %H:%M:%S -0000").to_string());
    out.push('\n');
    out
}
