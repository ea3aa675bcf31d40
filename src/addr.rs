//! Peer address parsing and the deduping peer directory (spec §3, §6).
//!
//! `rdma://host:port/fs`, `ib://host:port/fs`, or `portals://host:pid/fs`.

use std::fmt;

use hashbrown::HashMap;

use crate::error::{BmiError, Result};

/// Opaque handle into a [`ConnectionTable`](crate::connection::ConnectionTable),
/// stashed on a [`PeerAddress`] once a connection exists. Non-owning: the
/// connection table is the sole owner of the `Connection` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ib,
    Rdma,
    Portals,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scheme::Ib => "ib",
            Scheme::Rdma => "rdma",
            Scheme::Portals => "portals",
        };
        f.write_str(s)
    }
}

/// A parsed peer address: `(protocol, host, port, fs_name?)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub fs_name: Option<String>,
    /// Connection currently serving this peer, if any. `None` means the
    /// address is known but not (yet) connected.
    pub(crate) conn: Option<ConnHandle>,
}

impl PeerAddress {
    /// Parse `scheme://host:port(/fs_name)?` per the spec §6 grammar.
    /// Trailing characters after the port (and before an optional `/fs`)
    /// are a hard error, matching "Extra trailing characters after port
    /// ... are an error."
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme_str, rest) = url
            .split_once("://")
            .ok_or_else(|| BmiError::Address(format!("missing scheme in {url:?}")))?;

        let scheme = match scheme_str {
            "ib" => Scheme::Ib,
            "rdma" => Scheme::Rdma,
            "portals" => Scheme::Portals,
            other => return Err(BmiError::Address(format!("unknown scheme {other:?}"))),
        };

        let (hostport, fs_name) = match rest.split_once('/') {
            Some((hp, fs)) => (hp, Some(fs.to_string())),
            None => (rest, None),
        };

        if hostport.is_empty() {
            return Err(BmiError::Address(format!("missing host:port in {url:?}")));
        }

        let (host, port_str) = hostport
            .rsplit_once(':')
            .ok_or_else(|| BmiError::Address(format!("missing port in {url:?}")))?;

        if host.is_empty() || host.contains('/') {
            return Err(BmiError::Address(format!("invalid host in {url:?}")));
        }
        if !port_str.chars().all(|c| c.is_ascii_digit()) || port_str.is_empty() {
            return Err(BmiError::Address(format!(
                "port must be all digits, got {port_str:?} in {url:?}"
            )));
        }

        let port: u16 = port_str
            .parse()
            .map_err(|_| BmiError::Address(format!("port out of range in {url:?}")))?;

        Ok(PeerAddress {
            scheme,
            host: host.to_string(),
            port,
            fs_name,
            conn: None,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Rebuild the canonical URL form (used for `rev_lookup`).
    pub fn to_url(&self) -> String {
        match &self.fs_name {
            Some(fs) => format!("{}://{}:{}/{}", self.scheme, self.host, self.port, fs),
            None => format!("{}://{}:{}", self.scheme, self.host, self.port),
        }
    }
}

struct AddressEntry {
    addr: PeerAddress,
    refcount: usize,
}

/// Directory of peer addresses keyed by `(host, port)`, deduped: a second
/// lookup of an already-known peer returns the existing descriptor with
/// its refcount bumped rather than allocating a duplicate.
#[derive(Default)]
pub struct AddressTable {
    by_key: HashMap<(String, u16), usize>,
    entries: Vec<Option<AddressEntry>>,
}

/// Opaque id for an address-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrId(pub(crate) usize);

impl AddressTable {
    pub fn new() -> Self {
        AddressTable::default()
    }

    /// Parse `url` and insert/lookup it, incrementing the refcount on a
    /// dedupe hit.
    pub fn lookup_or_insert(&mut self, url: &str) -> Result<AddrId> {
        let addr = PeerAddress::parse(url)?;
        let key = (addr.host.clone(), addr.port);

        if let Some(&idx) = self.by_key.get(&key) {
            let entry = self.entries[idx].as_mut().expect("dangling address slot");
            entry.refcount += 1;
            return Ok(AddrId(idx));
        }

        let idx = self.entries.len();
        self.entries.push(Some(AddressEntry { addr, refcount: 1 }));
        self.by_key.insert(key, idx);
        Ok(AddrId(idx))
    }

    pub fn get(&self, id: AddrId) -> Option<&PeerAddress> {
        self.entries.get(id.0)?.as_ref().map(|e| &e.addr)
    }

    pub fn get_mut(&mut self, id: AddrId) -> Option<&mut PeerAddress> {
        self.entries.get_mut(id.0)?.as_mut().map(|e| &mut e.addr)
    }

    /// `rev_lookup`: find the `AddrId` currently bound to `conn`, if any.
    pub fn rev_lookup(&self, conn: ConnHandle) -> Option<AddrId> {
        self.entries.iter().enumerate().find_map(|(i, e)| {
            let e = e.as_ref()?;
            (e.addr.conn == Some(conn)).then(|| AddrId(i))
        })
    }

    /// Drop one reference; frees the slot once the count reaches zero and
    /// the address carries no live connection.
    pub fn release(&mut self, id: AddrId) {
        let free = {
            let entry = match self.entries.get_mut(id.0).and_then(|e| e.as_mut()) {
                Some(e) => e,
                None => return,
            };
            entry.refcount = entry.refcount.saturating_sub(1);
            entry.refcount == 0 && entry.addr.conn.is_none()
        };
        if free {
            if let Some(entry) = self.entries[id.0].take() {
                self.by_key.remove(&(entry.addr.host, entry.addr.port));
            }
        }
    }
}
