//! Bounded connection table: id, role and optional logical name per live socket.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

pub type ConnectionId = u64;

/// Id reported for the listening socket in [`ConnectionInfo`] listings.
pub const LISTENER_ID: ConnectionId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Listening,
    /// We connected out; the connection carries a logical name.
    OutboundNamed,
    /// Accepted from the listener; no name.
    InboundUnnamed,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionRole::Listening => "listening",
            ConnectionRole::OutboundNamed => "outbound-named",
            ConnectionRole::InboundUnnamed => "inbound-unnamed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: ConnectionRole,
    pub name: Option<String>,
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
}

struct Entry<T> {
    info: ConnectionInfo,
    link: T,
}

/// Live connections, at most `capacity` of them. `T` is whatever the owner keeps per socket.
pub struct ConnectionTable<T> {
    capacity: usize,
    next_id: ConnectionId,
    entries: BTreeMap<ConnectionId, Entry<T>>,
    last_modified: SystemTime,
}

impl<T> ConnectionTable<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: LISTENER_ID + 1,
            entries: BTreeMap::new(),
            last_modified: SystemTime::now(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a connection. Gives `link` back if the table is full.
    pub fn insert(
        &mut self,
        role: ConnectionRole,
        name: Option<String>,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
        link: T,
    ) -> Result<ConnectionId, T> {
        if self.is_full() {
            return Err(link);
        }
        let id = self.next_id;
        self.next_id += 1;
        let info = ConnectionInfo {
            id,
            role,
            name,
            peer_addr,
            local_addr,
        };
        self.entries.insert(id, Entry { info, link });
        self.touch();
        Ok(id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<(ConnectionInfo, T)> {
        let entry = self.entries.remove(&id)?;
        self.touch();
        Some((entry.info, entry.link))
    }

    pub fn get(&self, id: ConnectionId) -> Option<(&ConnectionInfo, &T)> {
        self.entries.get(&id).map(|e| (&e.info, &e.link))
    }

    pub fn link_mut(&mut self, id: ConnectionId) -> Option<&mut T> {
        self.entries.get_mut(&id).map(|e| &mut e.link)
    }

    /// Most recently registered connection carrying `name`.
    pub fn find_named(&self, name: &str) -> Option<ConnectionId> {
        self.entries
            .values()
            .rev()
            .find(|e| e.info.name.as_deref() == Some(name))
            .map(|e| e.info.id)
    }

    /// Every connection carrying `name`.
    pub fn ids_named(&self, name: &str) -> Vec<ConnectionId> {
        self.entries
            .values()
            .filter(|e| e.info.name.as_deref() == Some(name))
            .map(|e| e.info.id)
            .collect()
    }

    pub fn infos(&self) -> impl Iterator<Item = &ConnectionInfo> {
        self.entries.values().map(|e| &e.info)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changes whenever a connection is added or removed.
    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    fn touch(&mut self) {
        // SystemTime is not monotonic; never move the stamp backwards.
        let now = SystemTime::now();
        self.last_modified = if now > self.last_modified {
            now
        } else {
            self.last_modified + std::time::Duration::from_nanos(1)
        };
    }
}
