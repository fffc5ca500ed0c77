//! Recipient acceptance

use crate::error::Abort;
use std::collections::HashSet;
use std::sync::Arc;

/// Answer from a [`DomainTable`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The server accepts mail for this address
    Accepted,
    /// The address is not in a domain served or relayed by this server
    Rejected,
    /// The table itself is unusable
    LookupFailed(String),
}

/// Decides which recipient domains this server accepts mail for.
///
/// A lookup failure is fatal to the whole connection: the server refuses to
/// guess when it cannot read its own configuration.
pub trait DomainTable {
    /// Check the complete recipient `address`.
    ///
    /// With `disallow_local` set, addresses in domains delivered on this host
    /// must be rejected.
    fn lookup(&self, address: &[u8], disallow_local: bool) -> Lookup;
}

impl<T: DomainTable + ?Sized> DomainTable for &T {
    fn lookup(&self, address: &[u8], disallow_local: bool) -> Lookup {
        (**self).lookup(address, disallow_local)
    }
}

impl<T: DomainTable + ?Sized> DomainTable for Arc<T> {
    fn lookup(&self, address: &[u8], disallow_local: bool) -> Lookup {
        (**self).lookup(address, disallow_local)
    }
}

/// What happened to a single recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientStatus {
    /// Passed on to the queue
    Accepted,
    /// Too long for the address buffer
    Oversized,
    /// Contains a NUL byte
    Malformed,
    /// The domain table refused it
    DomainRejected,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Forward this address to the queue
    Accept(Vec<u8>),
    Reject,
}

/// Per-connection recipient policy
#[derive(Debug, Clone, Default)]
pub(crate) struct RecipientPolicy {
    pub relay_client: Option<Vec<u8>>,
    pub disallow_local: bool,
}

impl RecipientPolicy {
    /// Bytes appended to every accepted address, counted against the address buffer
    pub fn annotation_len(&self) -> u64 {
        self.relay_client.as_ref().map_or(0, |r| r.len() as u64)
    }

    pub fn evaluate(&self, table: &dyn DomainTable, address: &[u8]) -> Result<Verdict, Abort> {
        if let Some(relay) = &self.relay_client {
            let mut forward = address.to_vec();
            forward.extend_from_slice(relay);
            return Ok(Verdict::Accept(forward));
        }
        match table.lookup(address, self.disallow_local) {
            Lookup::Accepted => Ok(Verdict::Accept(address.to_vec())),
            Lookup::Rejected => Ok(Verdict::Reject),
            Lookup::LookupFailed(reason) => Err(Abort::LookupFailed(reason)),
        }
    }
}

/// Return the host part of an address: everything after the last `@`
pub fn host_part(address: &[u8]) -> Option<&[u8]> {
    let at = address.iter().rposition(|&b| b == b'@')?;
    Some(&address[at + 1..])
}

/// The host itself, followed by every suffix of it that starts with a `.`
pub fn host_suffixes(host: &[u8]) -> impl Iterator<Item = &[u8]> {
    (0..host.len())
        .filter(move |&i| i == 0 || host[i] == b'.')
        .map(move |i| &host[i..])
}

/// A domain table held in memory, in the format of qmail's `rcpthosts`.
///
/// An entry `example.com` matches that host only, an entry `.example.com`
/// matches every host below it. Matching ignores ASCII case. A table without
/// any entries accepts every address.
#[derive(Debug, Clone, Default)]
pub struct RcptHosts {
    hosts: HashSet<Vec<u8>>,
    locals: HashSet<Vec<u8>>,
}

impl RcptHosts {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from the contents of `rcpthosts` and `locals` files
    pub fn from_lines(rcpthosts: &str, locals: &str) -> Self {
        let mut table = Self::new();
        for host in control_lines(rcpthosts) {
            table.add_host(host);
        }
        for host in control_lines(locals) {
            table.add_local(host);
        }
        table
    }

    /// Accept mail for `host`
    pub fn add_host(&mut self, host: &str) -> &mut Self {
        self.hosts.insert(host.as_bytes().to_ascii_lowercase());
        self
    }

    /// Mark `host` as delivered on this machine
    pub fn add_local(&mut self, host: &str) -> &mut Self {
        self.locals.insert(host.as_bytes().to_ascii_lowercase());
        self
    }

    /// Has any accepted host been configured?
    pub fn is_configured(&self) -> bool {
        !self.hosts.is_empty()
    }

    /// Does an entry match the lower case `host`?
    pub fn contains(&self, host: &[u8]) -> bool {
        host_suffixes(host).any(|h| self.hosts.contains(h))
    }

    /// Is the lower case `host` delivered locally?
    pub fn is_local(&self, host: &[u8]) -> bool {
        self.locals.contains(host)
    }
}

impl DomainTable for RcptHosts {
    fn lookup(&self, address: &[u8], disallow_local: bool) -> Lookup {
        let host = match host_part(address) {
            Some(host) => host.to_ascii_lowercase(),
            None => return Lookup::Accepted,
        };
        if disallow_local && self.is_local(&host) {
            return Lookup::Rejected;
        }
        if !self.is_configured() || self.contains(&host) {
            Lookup::Accepted
        } else {
            Lookup::Rejected
        }
    }
}

/// Iterate over the meaningful lines of a control file
pub fn control_lines(contents: &str) -> impl Iterator<Item = &str> {
    contents
        .lines()
        .map(|l| l.split('#').next().unwrap_or_default().trim())
        .filter(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unreadable;

    impl DomainTable for Unreadable {
        fn lookup(&self, _address: &[u8], _disallow_local: bool) -> Lookup {
            Lookup::LookupFailed("unreadable".into())
        }
    }

    fn table() -> RcptHosts {
        RcptHosts::from_lines(
            "example.com\n.example.org\n# comment\n\nMixed.Case\n",
            "example.com\n",
        )
    }

    #[test]
    fn exact_and_suffix_entries() {
        let t = table();
        assert_eq!(t.lookup(b"a@example.com", false), Lookup::Accepted);
        assert_eq!(t.lookup(b"a@sub.example.com", false), Lookup::Rejected);
        assert_eq!(t.lookup(b"a@mx.example.org", false), Lookup::Accepted);
        assert_eq!(t.lookup(b"a@deep.mx.example.org", false), Lookup::Accepted);
        assert_eq!(t.lookup(b"a@example.org", false), Lookup::Rejected);
        assert_eq!(t.lookup(b"a@elsewhere.net", false), Lookup::Rejected);
    }

    #[test]
    fn case_insensitive() {
        let t = table();
        assert_eq!(t.lookup(b"a@EXAMPLE.com", false), Lookup::Accepted);
        assert_eq!(t.lookup(b"a@mixed.case", false), Lookup::Accepted);
    }

    #[test]
    fn last_at_sign_wins() {
        let t = table();
        assert_eq!(t.lookup(b"a@elsewhere.net@example.com", false), Lookup::Accepted);
        assert_eq!(t.lookup(b"a@example.com@elsewhere.net", false), Lookup::Rejected);
    }

    #[test]
    fn no_host_is_accepted() {
        assert_eq!(table().lookup(b"postmaster", false), Lookup::Accepted);
    }

    #[test]
    fn unconfigured_accepts_everything() {
        let t = RcptHosts::new();
        assert_eq!(t.lookup(b"a@anything.net", false), Lookup::Accepted);
    }

    #[test]
    fn disallow_local() {
        let t = table();
        assert_eq!(t.lookup(b"a@example.com", true), Lookup::Rejected);
        assert_eq!(t.lookup(b"a@mx.example.org", true), Lookup::Accepted);
    }

    #[test]
    fn suffixes() {
        let all: Vec<&[u8]> = host_suffixes(b"a.b.c").collect();
        assert_eq!(all, vec![&b"a.b.c"[..], b".b.c", b".c"]);
    }

    #[test]
    fn relay_client_annotates() {
        let policy = RecipientPolicy {
            relay_client: Some(b"@relay".to_vec()),
            disallow_local: false,
        };
        let mut only_local = RcptHosts::new();
        only_local.add_host("local.test");
        let verdict = policy.evaluate(&only_local, b"a@b").unwrap();
        assert_eq!(verdict, Verdict::Accept(b"a@b@relay".to_vec()));
        assert_eq!(policy.annotation_len(), 6);
    }

    #[test]
    fn lookup_failure_aborts() {
        let policy = RecipientPolicy::default();
        let res = policy.evaluate(&Unreadable, b"a@b");
        assert!(matches!(res, Err(Abort::LookupFailed(_))));
    }
}
