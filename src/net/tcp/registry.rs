use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    error::{NetError, Result},
    param::TCP_MAX_SOCKS,
    spinlock::{SpinLock, SpinLockGuard},
};

use super::sock::TcpSock;

/// The addressing of a connection as seen from this host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Endpoints {
    pub saddr: u32,
    pub sport: u16,
    pub daddr: u32,
    pub dport: u16,
}

struct Entry {
    endpoints: Endpoints,
    listening: bool,
    sock: Arc<TcpSock>,
}

pub(crate) struct Entries {
    list: Vec<Entry>,
}

impl Entries {
    pub fn port_in_use(&self, port: u16) -> bool {
        self.list.iter().any(|e| e.endpoints.sport == port)
    }

    /// gives a registered connection its local port.
    pub fn set_local_port(&mut self, sock: &Arc<TcpSock>, port: u16) -> Result<()> {
        let entry = self
            .list
            .iter_mut()
            .find(|e| Arc::ptr_eq(&e.sock, sock))
            .ok_or(NetError::InvalidState)?;
        entry.endpoints.sport = port;
        Ok(())
    }

    fn find_established(&self, saddr: u32, sport: u16, daddr: u32, dport: u16) -> Option<&Entry> {
        self.list.iter().find(|e| {
            let ep = &e.endpoints;
            !e.listening
                && ep.dport != 0
                && ep.sport == sport
                && ep.dport == dport
                && ep.daddr == daddr
                && ep.saddr == saddr
        })
    }
}

/// Every connection object a process can reach, indexed by its endpoints.
///
/// Passively opened connections are not in here until `accept` hands them out; before that
/// they are found through their listener. The entries cache each connection's endpoints so
/// that lookups never take a connection's lock.
pub struct Registry {
    entries: SpinLock<Entries>,
    live: AtomicUsize,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: SpinLock::new(Entries { list: Vec::new() }, "tcp_registry"),
            live: AtomicUsize::new(0),
        }
    }

    pub(crate) fn entries(&self) -> SpinLockGuard<'_, Entries> {
        self.entries.lock()
    }

    /// accounts for one more connection object.
    pub(crate) fn charge(&self) -> Result<()> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < TCP_MAX_SOCKS {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .map(|_| ())
            .map_err(|_| NetError::NoSockets)
    }

    pub(crate) fn uncharge(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// number of connection objects that have not been torn down.
    #[cfg(test)]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn register(&self, sock: &Arc<TcpSock>, endpoints: Endpoints, listening: bool) {
        let mut entries = self.entries.lock();
        match entries.list.iter_mut().find(|e| Arc::ptr_eq(&e.sock, sock)) {
            Some(entry) => {
                entry.endpoints = endpoints;
                entry.listening = listening;
            }
            None => entries.list.push(Entry {
                endpoints,
                listening,
                sock: sock.clone(),
            }),
        }
    }

    /// refreshes the cached endpoints of a registered connection.
    pub(crate) fn update(&self, sock: &Arc<TcpSock>, endpoints: Endpoints, listening: bool) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.list.iter_mut().find(|e| Arc::ptr_eq(&e.sock, sock)) {
            entry.endpoints = endpoints;
            entry.listening = listening;
        }
    }

    pub(crate) fn unregister(&self, sock: &Arc<TcpSock>) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.list.len();
        entries.list.retain(|e| !Arc::ptr_eq(&e.sock, sock));
        entries.list.len() != before
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, sock: &Arc<TcpSock>) -> bool {
        let entries = self.entries.lock();
        entries.list.iter().any(|e| Arc::ptr_eq(&e.sock, sock))
    }

    pub(crate) fn lookup_established(
        &self,
        saddr: u32,
        sport: u16,
        daddr: u32,
        dport: u16,
    ) -> Option<Arc<TcpSock>> {
        let entries = self.entries.lock();
        entries
            .find_established(saddr, sport, daddr, dport)
            .map(|e| e.sock.clone())
    }

    pub(crate) fn lookup_listening(&self, sport: u16) -> Option<Arc<TcpSock>> {
        let entries = self.entries.lock();
        entries
            .list
            .iter()
            .find(|e| e.listening && e.endpoints.sport == sport)
            .map(|e| e.sock.clone())
    }

    /// the connection a segment from `daddr:dport` to `saddr:sport` belongs to.
    ///
    /// An exact match wins. Otherwise the listener on `sport` is asked for a child that is
    /// still completing its handshake or waiting to be accepted; failing that, the segment
    /// goes to the listener itself.
    pub(crate) fn lookup(
        &self,
        saddr: u32,
        sport: u16,
        daddr: u32,
        dport: u16,
    ) -> Option<Arc<TcpSock>> {
        if let Some(sock) = self.lookup_established(saddr, sport, daddr, dport) {
            return Some(sock);
        }
        let listener = self.lookup_listening(sport)?;
        match listener.find_child(daddr, dport) {
            Some(child) => Some(child),
            // accept may have moved the child in here meanwhile
            None => self
                .lookup_established(saddr, sport, daddr, dport)
                .or(Some(listener)),
        }
    }
}
