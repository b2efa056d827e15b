//! The listener's table of live connections.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::connection::TcpConnection;
use crate::error::{NetworkError, Result};

/// Identifier of an accepted connection.
///
/// Ids are positive and unique among live connections. They are recycled
/// after wrapping past `i32::MAX`, so holding one after its connection
/// closed does not guarantee it still names the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// The largest id handed out before wrapping back to 1.
    pub const MAX: u32 = i32::MAX as u32;

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct RegistryInner {
    connections: BTreeMap<ConnectionId, Arc<TcpConnection>>,
    last_id: u32,
}

/// Ordered map from [`ConnectionId`] to connection.
///
/// Every lookup and mutation takes the lock briefly; callers receive cloned
/// `Arc`s and never hold the lock while running delegate code.
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                connections: BTreeMap::new(),
                last_id: 0,
            }),
        }
    }

    /// Allocate the next free id.
    ///
    /// Skips 0 and any id still registered.
    pub fn next_id(&self) -> ConnectionId {
        let mut inner = self.inner.lock();
        loop {
            inner.last_id = if inner.last_id >= ConnectionId::MAX {
                1
            } else {
                inner.last_id + 1
            };
            let candidate = ConnectionId(inner.last_id);
            if !inner.connections.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Register a connection under its id.
    pub fn insert(&self, conn: Arc<TcpConnection>) -> Result<()> {
        let id = conn.id();
        let mut inner = self.inner.lock();
        if inner.connections.contains_key(&id) {
            return Err(NetworkError::DuplicateConnection(id));
        }
        inner.connections.insert(id, conn);
        Ok(())
    }

    /// Remove a connection and mark it closing.
    ///
    /// Returns `None` if it was already removed, which makes close paths
    /// racing on the same id run their teardown once.
    pub fn take(&self, id: ConnectionId) -> Option<Arc<TcpConnection>> {
        let conn = self.inner.lock().connections.remove(&id)?;
        conn.mark_closing();
        Some(conn)
    }

    /// Look up a connection that is not closing.
    pub fn find(&self, id: ConnectionId) -> Option<Arc<TcpConnection>> {
        self.inner
            .lock()
            .connections
            .get(&id)
            .filter(|conn| !conn.is_closing())
            .cloned()
    }

    /// Whether `id` is registered, closing or not.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.lock().connections.contains_key(&id)
    }

    /// Number of registered connections, including closing ones.
    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().connections.is_empty()
    }

    /// Number of connections that are not closing.
    pub fn normal_count(&self) -> usize {
        self.inner
            .lock()
            .connections
            .values()
            .filter(|conn| !conn.is_closing())
            .count()
    }

    /// First connection in id order matching `pred`.
    ///
    /// `pred` runs under the registry lock and must not call back into it.
    pub fn find_first(&self, mut pred: impl FnMut(&TcpConnection) -> bool) -> Option<Arc<TcpConnection>> {
        self.inner
            .lock()
            .connections
            .values()
            .find(|conn| pred(conn))
            .cloned()
    }

    /// Every registered connection, in id order.
    pub fn snapshot(&self) -> Vec<Arc<TcpConnection>> {
        self.inner.lock().connections.values().cloned().collect()
    }

    /// Remove every connection, marking each closing.
    pub fn drain(&self) -> Vec<Arc<TcpConnection>> {
        let drained = std::mem::take(&mut self.inner.lock().connections);
        drained
            .into_values()
            .inspect(|conn| conn.mark_closing())
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionRegistry")
            .field("connections", &inner.connections.len())
            .field("last_id", &inner.last_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn conn(registry: &ConnectionRegistry) -> Arc<TcpConnection> {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let conn = Arc::new(TcpConnection::new(registry.next_id(), addr, addr, 1024));
        registry.insert(conn.clone()).unwrap();
        conn
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let registry = ConnectionRegistry::new();
        assert_eq!(conn(&registry).id(), ConnectionId::new(1));
        assert_eq!(conn(&registry).id(), ConnectionId::new(2));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_id_wraps_and_skips_live_ids() {
        let registry = ConnectionRegistry::new();
        let first = conn(&registry);
        assert_eq!(first.id().get(), 1);

        registry.inner.lock().last_id = ConnectionId::MAX - 1;
        assert_eq!(registry.next_id().get(), ConnectionId::MAX);
        // 1 is still registered, so the wrap lands on 2.
        assert_eq!(registry.next_id().get(), 2);
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let registry = ConnectionRegistry::new();
        let existing = conn(&registry);
        let addr: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let dup = Arc::new(TcpConnection::new(existing.id(), addr, addr, 1024));
        assert_eq!(
            registry.insert(dup),
            Err(NetworkError::DuplicateConnection(existing.id()))
        );
    }

    #[test]
    fn test_take_marks_closing_once() {
        let registry = ConnectionRegistry::new();
        let c = conn(&registry);
        let taken = registry.take(c.id()).unwrap();
        assert!(taken.is_closing());
        assert!(registry.take(c.id()).is_none());
        assert!(!registry.contains(c.id()));
    }

    #[test]
    fn test_find_skips_closing() {
        let registry = ConnectionRegistry::new();
        let a = conn(&registry);
        let b = conn(&registry);
        a.mark_closing();

        assert!(registry.find(a.id()).is_none());
        assert!(registry.contains(a.id()));
        assert_eq!(registry.find(b.id()).unwrap().id(), b.id());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.normal_count(), 1);
        assert_eq!(
            registry.find_first(|c| !c.is_closing()).unwrap().id(),
            b.id()
        );
    }

    #[test]
    fn test_drain_empties_and_marks() {
        let registry = ConnectionRegistry::new();
        conn(&registry);
        conn(&registry);
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|c| c.is_closing()));
        assert!(registry.is_empty());
    }
}
