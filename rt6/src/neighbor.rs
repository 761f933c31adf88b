// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Neighbor resolution as seen by the routing table.
//!
//! The table never looks inside a neighbor beyond its address and flags. It
//! takes a reference with [`NeighborResolver::get_neigh`], drops it with
//! [`NeighborResolver::dec_neigh`] and reports use of a cached route with
//! [`NeighborResolver::event_send`] so reachability can be confirmed.

use crate::device::Device;
use bitflags::bitflags;
use rt6_common::lock;
use slog::{debug, warn, Logger};
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NeighborFlags: u32 {
        /// No address resolution is needed to reach this neighbor.
        const NOARP = 0x1;
    }
}

#[derive(Debug)]
pub struct Neighbor {
    pub addr: Ipv6Addr,
    pub dev: String,
    pub flags: NeighborFlags,
    refcnt: AtomicU32,
    events: AtomicU64,
}

impl Neighbor {
    pub fn new(addr: Ipv6Addr, dev: &str, flags: NeighborFlags) -> Self {
        Self {
            addr,
            dev: dev.to_string(),
            flags,
            refcnt: AtomicU32::new(0),
            events: AtomicU64::new(0),
        }
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::SeqCst)
    }

    /// Number of use notifications received through `event_send`.
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}

pub type NeighborHandle = Arc<Neighbor>;

pub trait NeighborResolver: Send + Sync {
    /// Take a reference on the neighbor record for `addr` on `dev`.
    fn get_neigh(&self, dev: &Device, addr: Ipv6Addr) -> Option<NeighborHandle>;

    /// Drop one reference previously returned by `get_neigh`.
    fn dec_neigh(&self, n: &NeighborHandle);

    /// The route through `n` was just used.
    fn event_send(&self, n: &NeighborHandle);
}

/// A reference counted neighbor table. Records are created on first lookup
/// and forgotten when their last reference is dropped.
pub struct NeighborCache {
    entries: Mutex<HashMap<(String, Ipv6Addr), NeighborHandle>>,
    log: Logger,
}

impl NeighborCache {
    pub fn new(log: Logger) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub fn get(&self, dev: &str, addr: Ipv6Addr) -> Option<NeighborHandle> {
        lock!(self.entries).get(&(dev.to_string(), addr)).cloned()
    }

    pub fn len(&self) -> usize {
        lock!(self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NeighborResolver for NeighborCache {
    fn get_neigh(&self, dev: &Device, addr: Ipv6Addr) -> Option<NeighborHandle> {
        let mut entries = lock!(self.entries);
        let n = entries
            .entry((dev.name.clone(), addr))
            .or_insert_with(|| {
                let flags = if dev.resolves_neighbors() {
                    NeighborFlags::empty()
                } else {
                    NeighborFlags::NOARP
                };
                debug!(self.log, "new neighbor {addr} on {}", dev.name);
                Arc::new(Neighbor::new(addr, &dev.name, flags))
            })
            .clone();
        n.refcnt.fetch_add(1, Ordering::SeqCst);
        Some(n)
    }

    fn dec_neigh(&self, n: &NeighborHandle) {
        let mut entries = lock!(self.entries);
        let prev = n.refcnt.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            n.refcnt.store(0, Ordering::SeqCst);
            warn!(self.log, "neighbor {} released with no references", n.addr);
            return;
        }
        if prev == 1 {
            entries.remove(&(n.dev.clone(), n.addr));
        }
    }

    fn event_send(&self, n: &NeighborHandle) {
        n.events.fetch_add(1, Ordering::Relaxed);
    }
}
