//! Socket-address classification.
//!
//! Addresses stay strings end to end: `unix:///path/to.sock` or
//! `<scheme>://<host>:<port>`, whatever the stream-socket layer accepts.
//! Locality is a substring heuristic over the whole address text, matched
//! against well-known wildcard/loopback markers and the host's own resolved
//! addresses. It can false-positive on an address whose path merely contains
//! a loopback-looking fragment; callers rely on that leniency to decide
//! which addresses are launchable, so it is kept as is.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

use once_cell::sync::Lazy;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, WorkerError};

const UNIX_SCHEME: &str = "unix://";

/// Markers that always count as local, before host resolution is consulted.
const LOCAL_MARKERS: [&str; 4] = ["0.0.0.0", "127.0.0.1", "[::]", "[::1]"];

static HOST_ADDRESSES: Lazy<Vec<String>> = Lazy::new(resolve_host_addresses);

fn resolve_host_addresses() -> Vec<String> {
    let Ok(name) = nix::unistd::gethostname() else {
        return Vec::new();
    };
    let Some(name) = name.to_str() else {
        return Vec::new();
    };
    let Ok(resolved) = (name, 0u16).to_socket_addrs() else {
        debug!(host = name, "could not resolve own hostname");
        return Vec::new();
    };
    resolved
        .map(|addr| match addr {
            SocketAddr::V4(v4) => v4.ip().to_string(),
            SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
        })
        .collect()
}

/// A worker socket address, unix or network, kept in its textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketAddress {
    raw: String,
}

impl SocketAddress {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True iff the address uses the unix-domain scheme prefix.
    pub fn is_unix(&self) -> bool {
        self.raw.starts_with(UNIX_SCHEME)
    }

    /// Unix addresses are always local; network addresses are local iff the
    /// text contains a local marker or one of the host's own addresses.
    pub fn is_local(&self) -> bool {
        if self.is_unix() {
            return true;
        }
        LOCAL_MARKERS
            .iter()
            .any(|marker| self.raw.contains(marker))
            || HOST_ADDRESSES
                .iter()
                .any(|address| self.raw.contains(address.as_str()))
    }

    /// False for unix addresses and loopback-looking addresses.
    pub fn is_network_exposed(&self) -> bool {
        if self.is_unix() {
            return false;
        }
        !self.raw.contains("127.0.0.1") && !self.raw.contains("[::1]")
    }

    /// The filesystem path embedded in a unix address.
    pub fn socket_file(&self) -> Option<PathBuf> {
        self.raw.strip_prefix(UNIX_SCHEME).map(PathBuf::from)
    }

    /// The address without its `<scheme>://` prefix, if any.
    pub fn strip_scheme(&self) -> &str {
        match self.raw.find("://") {
            Some(pos) => &self.raw[pos + 3..],
            None => &self.raw,
        }
    }

    /// Best-effort discovery of the process currently listening here, by
    /// shelling out to `lsof`. `None` for non-local addresses and for every
    /// lookup that simply finds nothing; a missing `lsof` binary is an error.
    pub async fn listening_process_id(&self) -> Result<Option<u32>> {
        if !self.is_local() {
            return Ok(None);
        }
        let lsof = find_lsof()?;
        let unix = self.is_unix();
        let schemeless = self.strip_scheme();
        let mut command = Command::new(lsof);
        if unix {
            command.args(["-F", "p0"]).arg(schemeless);
        } else {
            command.args(["-F", "pT0"]).arg(format!("-itcp@{schemeless}"));
        }
        let output = command.output().await?;
        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid = if unix {
            first_pid(&stdout)
        } else {
            listening_pid(&stdout)
        };
        Ok(pid)
    }
}

fn find_lsof() -> Result<PathBuf> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let mut paths = std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).collect::<Vec<_>>())
        .unwrap_or_default();
    paths.push(PathBuf::from("/sbin"));
    paths.push(PathBuf::from("/usr/sbin"));
    let joined = std::env::join_paths(paths)
        .map_err(|err| WorkerError::Runtime(format!("unusable PATH: {err}")))?;
    which::which_in("lsof", Some(joined), cwd)
        .map_err(|_| WorkerError::Runtime("unable to find the \"lsof\" executable".to_owned()))
}

/// `lsof -F` emits one field per line, each tagged by a letter and
/// NUL-terminated. The first `p` field is the owning process id.
fn first_pid(output: &str) -> Option<u32> {
    output.lines().find_map(parse_pid_field)
}

/// For network sockets, return the most recent `p` field once a record
/// flagged `TST=LISTEN` shows up.
fn listening_pid(output: &str) -> Option<u32> {
    let mut pid = None;
    for line in output.lines() {
        if let Some(parsed) = parse_pid_field(line) {
            pid = Some(parsed);
        }
        if line.split('\0').any(|field| field == "TST=LISTEN") {
            return pid;
        }
    }
    None
}

fn parse_pid_field(line: &str) -> Option<u32> {
    let digits = line.strip_prefix('p')?;
    digits.trim_end_matches('\0').parse().ok()
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for SocketAddress {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(WorkerError::Config("empty socket address".to_owned()));
        }
        Ok(Self::new(s))
    }
}

impl From<&str> for SocketAddress {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for SocketAddress {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}
