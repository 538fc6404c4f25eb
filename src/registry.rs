//! Upgraded clients and the route each one connected on.
//!
//! Entries live in a slot arena. Removing a client tombstones its slot instead
//! of shifting the rest, so live entries keep their insertion order and slot
//! indices stay valid while a broadcast walks the table.
use crate::{
    frame::Frame,
    transport::{write_all, ConnectionId, Transport},
};

const INITIAL_CAPACITY: usize = 4;

/// A live client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEntry {
    /// Transport identifier of the client.
    pub id: ConnectionId,
    /// Path requested at upgrade time. Never changes.
    pub route: String,
}

/// Result of a broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients the frame was written to.
    pub delivered: usize,
    /// Clients whose write failed.
    pub failed: usize,
}

/// Table of upgraded clients.
#[derive(Debug)]
pub struct ClientRegistry {
    slots: Vec<Option<ClientEntry>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// An empty registry with room for four clients.
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Appends a client.
    pub fn add(&mut self, id: ConnectionId, route: impl Into<String>) {
        if self.slots.len() == self.slots.capacity() {
            let grow = self.slots.capacity().max(INITIAL_CAPACITY);
            self.slots.reserve_exact(grow);
        }
        self.slots.push(Some(ClientEntry {
            id,
            route: route.into(),
        }));
    }

    /// Tombstones every entry for `id`. Returns how many were removed.
    pub fn remove(&mut self, id: ConnectionId) -> usize {
        let mut removed = 0;
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|entry| entry.id == id) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    /// Route of the first live entry for `id`.
    pub fn find_route(&self, id: ConnectionId) -> Option<&str> {
        self.iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.route.as_str())
    }

    /// Whether `id` has a live entry.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.iter().any(|entry| entry.id == id)
    }

    /// Live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ClientEntry> {
        self.slots.iter().flatten()
    }

    /// Live clients on `route`.
    pub fn members<'a>(&'a self, route: &'a str) -> impl Iterator<Item = ConnectionId> + 'a {
        self.iter()
            .filter(move |entry| entry.route == route)
            .map(|entry| entry.id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether no client is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocated slots, tombstones included.
    pub fn slot_capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Occupied slots, tombstones included.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Drops tombstones and gives back memory once three quarters of the
    /// allocation is unused. Live entries keep their order. Needs `&mut`, so it
    /// can never run under a broadcast.
    pub fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        if self.slots.len() * 4 <= self.slots.capacity() {
            let keep = (self.slots.len() * 2).max(INITIAL_CAPACITY);
            self.slots.shrink_to(keep);
        }
    }

    /// Sends `frame` to every live client on `route`.
    ///
    /// The frame is encoded once. A failed write is logged and counted, and
    /// delivery continues with the next client.
    pub fn broadcast<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        route: &str,
        frame: &Frame,
        mask: bool,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        // masked frames need a fresh key per client
        let shared = (!mask).then(|| frame.encode(false));

        for id in self.members(route) {
            let res = match &shared {
                Some(bytes) => write_all(transport, id, bytes),
                None => write_all(transport, id, &frame.encode(true)),
            };
            match res {
                Ok(()) => report.delivered += 1,
                Err(_err) => {
                    #[cfg(feature = "logging")]
                    log::warn!("broadcast to {} on {} failed: {}", id, route, _err);
                    report.failed += 1;
                }
            }
        }

        report
    }
}
