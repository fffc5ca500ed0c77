use anyhow::{Context, Result};
use qmtp::{PeerInfo, SessionBuilder, DEFAULT_TIMEOUT};
use simplelog::LevelFilter;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_HOME: &str = "/var/qmail";
/// Concurrent TCP connections, as tcpserver's `-c` default
const DEFAULT_MAX_CONNECTIONS: usize = 40;

/// Where accepted messages go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueKind {
    /// Run a qmail-queue compatible program for every message
    Exec(PathBuf),
    /// Write messages into a spool directory
    Spool(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub home: PathBuf,
    pub databytes: u64,
    pub relay_client: Option<String>,
    pub no_local: bool,
    pub peer: PeerInfo,
    pub queue: QueueKind,
    pub listen: Option<String>,
    pub max_connections: usize,
    pub timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        Config::from_vars(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `var`, which looks up one variable
    pub fn from_vars<F>(var: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = PathBuf::from(var("QMTPD_HOME").unwrap_or_else(|| DEFAULT_HOME.to_owned()));

        let databytes = match var("DATABYTES") {
            Some(value) => leading_number(&value),
            None => read_control(&home, "databytes")?
                .map(|contents| leading_number(contents.lines().next().unwrap_or_default()))
                .unwrap_or(0),
        };

        let peer = PeerInfo {
            local: var("TCPLOCALHOST").or_else(|| var("TCPLOCALIP")),
            remote_ip: var("TCPREMOTEIP"),
            remote_host: var("TCPREMOTEHOST"),
            remote_info: var("TCPREMOTEINFO"),
        };

        let queue = match var("QMTPD_QUEUE").as_deref() {
            None | Some("exec") => QueueKind::Exec(
                var("QMAILQUEUE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| home.join("bin").join("qmail-queue")),
            ),
            Some(other) => match other.strip_prefix("spool:") {
                Some(dir) if !dir.is_empty() => QueueKind::Spool(PathBuf::from(dir)),
                _ => anyhow::bail!("invalid QMTPD_QUEUE: {}", other),
            },
        };

        let timeout = match var("QMTPD_TIMEOUT") {
            Some(secs) => {
                Duration::from_secs(parse_number(&secs).context("invalid QMTPD_TIMEOUT")?)
            }
            None => DEFAULT_TIMEOUT,
        };

        let max_connections = match var("QMTPD_MAX_CONNECTIONS") {
            Some(value) => {
                let max = parse_number(&value).context("invalid QMTPD_MAX_CONNECTIONS")?;
                usize::try_from(max).unwrap_or(usize::MAX)
            }
            None => DEFAULT_MAX_CONNECTIONS,
        };

        Ok(Config {
            home,
            // The body counter starts one above the limit
            databytes: databytes.min(u64::MAX - 1),
            relay_client: var("RELAYCLIENT"),
            no_local: var("NOLOCAL").is_some(),
            peer,
            queue,
            listen: var("QMTPD_LISTEN").filter(|addr| !addr.is_empty()),
            max_connections,
            timeout,
        })
    }

    /// Session settings shared by every connection
    pub fn session_builder(&self) -> SessionBuilder {
        let mut builder = SessionBuilder::new();
        builder
            .databytes(self.databytes)
            .no_local(self.no_local)
            .peer(self.peer.clone())
            .timeout(self.timeout);
        if let Some(relay) = &self.relay_client {
            builder.relay_client(relay.as_str());
        }
        builder
    }
}

/// Log level from `QMTPD_LOG`, `info` when unset
pub fn log_level(value: Option<String>) -> Result<LevelFilter> {
    match value {
        Some(level) => LevelFilter::from_str(&level)
            .map_err(|_| anyhow::anyhow!("invalid QMTPD_LOG: {}", level)),
        None => Ok(LevelFilter::Info),
    }
}

fn control_path(home: &Path, name: &str) -> PathBuf {
    home.join("control").join(name)
}

/// Contents of a control file, or `None` if it does not exist
pub fn read_control(home: &Path, name: &str) -> Result<Option<String>> {
    let path = control_path(home, name);
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("unable to read {}", path.display())),
    }
}

fn parse_number(value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("not a number: {:?}", value))
}

/// The digits at the start of `value`, 0 when there are none.
///
/// Trailing text such as a comment is ignored; values too large saturate.
fn leading_number(value: &str) -> u64 {
    value
        .trim_start()
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u64, |n, digit| {
            n.saturating_mul(10).saturating_add(u64::from(digit - b'0'))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|name| vars.get(name).cloned())
    }

    fn temp_home(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("qmtpd-config-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("control")).unwrap();
        dir
    }

    #[test]
    fn defaults() {
        let home = temp_home("defaults");
        let config = config(&[("QMTPD_HOME", home.to_str().unwrap())]).unwrap();
        assert_eq!(config.databytes, 0);
        assert_eq!(config.relay_client, None);
        assert!(!config.no_local);
        assert_eq!(config.queue, QueueKind::Exec(home.join("bin/qmail-queue")));
        assert_eq!(config.listen, None);
        assert_eq!(config.timeout, Duration::from_secs(3600));
        assert_eq!(config.max_connections, 40);
        assert_eq!(config.peer, PeerInfo::default());
    }

    #[test]
    fn environment() {
        let config = config(&[
            ("QMTPD_HOME", "/nonexistent"),
            ("DATABYTES", "1000"),
            ("RELAYCLIENT", ""),
            ("NOLOCAL", ""),
            ("TCPLOCALIP", "192.0.2.1"),
            ("TCPREMOTEIP", "198.51.100.2"),
            ("QMAILQUEUE", "/usr/bin/true"),
            ("QMTPD_LISTEN", "127.0.0.1:209"),
            ("QMTPD_TIMEOUT", "60"),
            ("QMTPD_MAX_CONNECTIONS", "5"),
        ])
        .unwrap();
        assert_eq!(config.databytes, 1000);
        assert_eq!(config.relay_client.as_deref(), Some(""));
        assert!(config.no_local);
        assert_eq!(config.peer.local.as_deref(), Some("192.0.2.1"));
        assert_eq!(config.peer.remote_ip.as_deref(), Some("198.51.100.2"));
        assert_eq!(config.queue, QueueKind::Exec("/usr/bin/true".into()));
        assert_eq!(config.listen.as_deref(), Some("127.0.0.1:209"));
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn local_host_preferred() {
        let config = config(&[
            ("QMTPD_HOME", "/nonexistent"),
            ("TCPLOCALHOST", "mx.example.com"),
            ("TCPLOCALIP", "192.0.2.1"),
        ])
        .unwrap();
        assert_eq!(config.peer.local.as_deref(), Some("mx.example.com"));
    }

    #[test]
    fn databytes_from_control_file() {
        let home = temp_home("databytes");
        fs::write(home.join("control/databytes"), "5000\n").unwrap();
        let home_str = home.to_str().unwrap();
        assert_eq!(config(&[("QMTPD_HOME", home_str)]).unwrap().databytes, 5000);
        let config = config(&[("QMTPD_HOME", home_str), ("DATABYTES", "7")]).unwrap();
        assert_eq!(config.databytes, 7);
    }

    #[test]
    fn databytes_leading_digits() {
        let home = temp_home("databytes-comment");
        fs::write(home.join("control/databytes"), "10000000 # bytes\n").unwrap();
        let home_str = home.to_str().unwrap();
        assert_eq!(config(&[("QMTPD_HOME", home_str)]).unwrap().databytes, 10_000_000);

        for (value, databytes) in [(" 42k", 42), ("lots", 0), ("", 0), ("-5", 0)] {
            let config = config(&[("QMTPD_HOME", home_str), ("DATABYTES", value)]).unwrap();
            assert_eq!(config.databytes, databytes, "{:?}", value);
        }
    }

    #[test]
    fn databytes_clamped() {
        let max = u64::MAX.to_string();
        let config =
            config(&[("QMTPD_HOME", "/nonexistent"), ("DATABYTES", max.as_str())]).unwrap();
        assert_eq!(config.databytes, u64::MAX - 1);
        let huge = "99999999999999999999999";
        let config = self::config(&[("QMTPD_HOME", "/nonexistent"), ("DATABYTES", huge)]).unwrap();
        assert_eq!(config.databytes, u64::MAX - 1);
    }

    #[test]
    fn bad_values() {
        let err = config(&[("QMTPD_HOME", "/nonexistent"), ("QMTPD_TIMEOUT", "soon")]).unwrap_err();
        expect![[r#"invalid QMTPD_TIMEOUT: not a number: "soon": invalid digit found in string"#]]
            .assert_eq(&format!("{:#}", err));
        let many = [("QMTPD_HOME", "/nonexistent"), ("QMTPD_MAX_CONNECTIONS", "many")];
        assert!(config(&many).is_err());
        assert!(config(&[("QMTPD_HOME", "/nonexistent"), ("QMTPD_QUEUE", "spool:")]).is_err());
        assert!(config(&[("QMTPD_HOME", "/nonexistent"), ("QMTPD_QUEUE", "disk")]).is_err());
    }

    #[test]
    fn spool_queue() {
        let config =
            config(&[("QMTPD_HOME", "/nonexistent"), ("QMTPD_QUEUE", "spool:/tmp/q")]).unwrap();
        assert_eq!(config.queue, QueueKind::Spool("/tmp/q".into()));
    }

    #[test]
    fn log_levels() {
        assert_eq!(log_level(None).unwrap(), LevelFilter::Info);
        assert_eq!(log_level(Some("trace".into())).unwrap(), LevelFilter::Trace);
        assert!(log_level(Some("loud".into())).is_err());
    }
}
