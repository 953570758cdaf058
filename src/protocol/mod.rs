//! Vocabulary shared by both sides of the caching lock protocol.
//!
//! Every acquire attempt a client makes carries a per-(client, lock) version.
//! The server stamps each revoke and retry it sends with the last version it
//! saw from the target client, which lets the client tell whether the call that
//! notification answers has already completed locally.

use std::{collections::HashMap, fmt, net::SocketAddr};

use serde::{Deserialize, Serialize};

pub mod rpc;
pub mod wire;

pub type LockId = u64;
pub type Version = u64;

/// Identity of a client process on the wire: the address of its callback endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for ClientId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Non-error replies to `Acquire` and `Release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Ok,
    Retry,
}

/// A revoke or retry as seen by the client that receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub lock: LockId,
    pub version: Version,
}

impl Notification {
    /// A notification stamped `v` answers the call that carried `v`. It can only
    /// be acted upon once the reply to that call has been processed, which is
    /// exactly when the client's outgoing counter has moved past `v`.
    pub fn is_deliverable(&self, outgoing: Version) -> bool {
        self.version < outgoing
    }
}

/// A revoke or retry queued on the server for delivery to `client`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callback {
    pub client: ClientId,
    pub lock: LockId,
    pub version: Version,
}

/// Last version observed per (client, lock).
#[derive(Debug, Default)]
pub struct VersionTable {
    versions: HashMap<(ClientId, LockId), Version>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `version` for the pair. Returns `false` without recording anything
    /// when `version` is older than what is already on file, i.e. the call is a
    /// replayed delivery.
    pub fn record(&mut self, client: &ClientId, lock: LockId, version: Version) -> bool {
        let entry = self.versions.entry((client.clone(), lock)).or_insert(version);
        if version < *entry {
            return false;
        }
        *entry = version;
        true
    }

    pub fn get(&self, client: &ClientId, lock: LockId) -> Version {
        self.versions
            .get(&(client.clone(), lock))
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_waits_for_its_reply() {
        let n = Notification {
            lock: 3,
            version: 4,
        };
        assert!(!n.is_deliverable(4));
        assert!(n.is_deliverable(5));
    }

    #[test]
    fn version_table_rejects_replays() {
        let client = ClientId::new("127.0.0.1:4000");
        let mut table = VersionTable::new();
        assert_eq!(table.get(&client, 1), 0);

        assert!(table.record(&client, 1, 2));
        assert!(table.record(&client, 1, 2));
        assert!(table.record(&client, 1, 3));
        assert!(!table.record(&client, 1, 1));
        assert_eq!(table.get(&client, 1), 3);
        assert_eq!(table.get(&client, 2), 0);
    }

    #[test]
    fn client_id_from_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:1025".parse().unwrap();
        assert_eq!(ClientId::from(addr).as_str(), "127.0.0.1:1025");
    }
}
