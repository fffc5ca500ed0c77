use crate::config::read_control;
use anyhow::{Context, Result};
use log::debug;
use qmtp::{host_part, host_suffixes, DomainTable, Lookup, RcptHosts};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MORE_RCPTHOSTS: &str = "morercpthosts.sqlite";

/// Recipient domains accepted by this server.
///
/// Hosts come from `control/rcpthosts` and `control/locals`, with an optional
/// sqlite database for sites that accept mail for too many domains to keep in
/// a flat file.
pub struct Store {
    path: Option<PathBuf>,
    table: Arc<RcptHosts>,
    connection: Option<Connection>,
}

impl Store {
    /// Load the control files under `home`
    pub fn open(home: &Path) -> Result<Store> {
        let rcpthosts = read_control(home, "rcpthosts")?.unwrap_or_default();
        let locals = read_control(home, "locals")?.unwrap_or_default();
        let table = RcptHosts::from_lines(&rcpthosts, &locals);
        let path = home.join("control").join(MORE_RCPTHOSTS);
        let path = if path.exists() { Some(path) } else { None };
        debug!(
            "rcpthosts loaded, sqlite table: {}",
            path.as_ref().map_or("none".into(), |p| p.display().to_string())
        );
        Store::new(Arc::new(table), path)
    }

    fn new(table: Arc<RcptHosts>, path: Option<PathBuf>) -> Result<Store> {
        let connection = match &path {
            Some(p) => Some(
                Connection::open_with_flags(p, OpenFlags::SQLITE_OPEN_READ_ONLY)
                    .with_context(|| format!("unable to open {}", p.display()))?,
            ),
            None => None,
        };
        Ok(Store {
            path,
            table,
            connection,
        })
    }

    /// Open another handle on the same tables, for use on another thread
    pub fn reopen(&self) -> Result<Store> {
        Store::new(self.table.clone(), self.path.clone())
    }

    #[cfg(test)]
    pub fn in_memory(table: RcptHosts, hosts: &[&str]) -> Store {
        let connection = Connection::open_in_memory().unwrap();
        connection
            .execute("CREATE TABLE rcpthosts (host VARCHAR(255) PRIMARY KEY)", [])
            .unwrap();
        for host in hosts {
            connection
                .execute("INSERT INTO rcpthosts (host) VALUES (?1)", [host])
                .unwrap();
        }
        Store {
            path: None,
            table: Arc::new(table),
            connection: Some(connection),
        }
    }

    fn is_configured(&self) -> bool {
        self.table.is_configured() || self.connection.is_some()
    }

    // Look the host and its parent domains up in the sqlite table
    fn more_rcpthosts(&self, host: &[u8]) -> rusqlite::Result<bool> {
        let connection = match &self.connection {
            Some(c) => c,
            None => return Ok(false),
        };
        let mut stmt = connection.prepare_cached("SELECT count(0) FROM rcpthosts WHERE host = ?1")?;
        for candidate in host_suffixes(host) {
            let candidate = String::from_utf8_lossy(candidate);
            let count: i64 = stmt.query_row([candidate.as_ref()], |row| row.get(0))?;
            if count > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl DomainTable for Store {
    fn lookup(&self, address: &[u8], disallow_local: bool) -> Lookup {
        let host = match host_part(address) {
            Some(host) => host.to_ascii_lowercase(),
            None => return Lookup::Accepted,
        };
        if disallow_local && self.table.is_local(&host) {
            return Lookup::Rejected;
        }
        if !self.is_configured() || self.table.contains(&host) {
            return Lookup::Accepted;
        }
        match self.more_rcpthosts(&host) {
            Ok(true) => Lookup::Accepted,
            Ok(false) => Lookup::Rejected,
            Err(e) => Lookup::LookupFailed(format!("{}: {}", MORE_RCPTHOSTS, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_home(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("qmtpd-store-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("control")).unwrap();
        dir
    }

    #[test]
    fn control_files() {
        let home = temp_home("control");
        fs::write(home.join("control/rcpthosts"), "example.com\n.example.org\n").unwrap();
        fs::write(home.join("control/locals"), "example.com\n").unwrap();
        let store = Store::open(&home).unwrap();
        assert_eq!(store.lookup(b"a@example.com", false), Lookup::Accepted);
        assert_eq!(store.lookup(b"a@example.com", true), Lookup::Rejected);
        assert_eq!(store.lookup(b"a@mx.example.org", true), Lookup::Accepted);
        assert_eq!(store.lookup(b"a@example.net", false), Lookup::Rejected);
    }

    #[test]
    fn missing_control_files_accept_everything() {
        let home = temp_home("missing");
        let store = Store::open(&home).unwrap();
        assert_eq!(store.lookup(b"a@anywhere.example", false), Lookup::Accepted);
    }

    #[test]
    fn sqlite_hosts() {
        let store = Store::in_memory(RcptHosts::new(), &["big.example", ".many.example"]);
        assert_eq!(store.lookup(b"a@BIG.example", false), Lookup::Accepted);
        assert_eq!(store.lookup(b"a@one.many.example", false), Lookup::Accepted);
        assert_eq!(store.lookup(b"a@many.example", false), Lookup::Rejected);
        // An empty sqlite table still counts as configured
        let empty = Store::in_memory(RcptHosts::new(), &[]);
        assert_eq!(empty.lookup(b"a@big.example", false), Lookup::Rejected);
    }

    #[test]
    fn broken_sqlite_fails_lookup() {
        let store = Store::in_memory(RcptHosts::new(), &[]);
        if let Some(connection) = &store.connection {
            connection.execute("DROP TABLE rcpthosts", []).unwrap();
        }
        assert!(matches!(
            store.lookup(b"a@big.example", false),
            Lookup::LookupFailed(_)
        ));
    }

    #[test]
    fn sqlite_file() {
        let home = temp_home("sqlite");
        {
            let connection = Connection::open(home.join("control").join(MORE_RCPTHOSTS)).unwrap();
            connection
                .execute("CREATE TABLE rcpthosts (host VARCHAR(255) PRIMARY KEY)", [])
                .unwrap();
            connection
                .execute("INSERT INTO rcpthosts (host) VALUES (?1)", ["db.example"])
                .unwrap();
        }
        let store = Store::open(&home).unwrap();
        let other = store.reopen().unwrap();
        assert_eq!(other.lookup(b"a@db.example", false), Lookup::Accepted);
        assert_eq!(other.lookup(b"a@else.example", false), Lookup::Rejected);
    }
}
