// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The routing table context.
//!
//! A [`RoutingTable`] owns the FIB and all of the state that surrounds it: the
//! request queue, the bottom-half mask, the reentrancy guard and client
//! counters, and the watchers that receive outgoing route messages. The FIB
//! itself sits behind a mutex. The guard counter decides when deferred work
//! may run, not who may touch the trie.

use crate::config::Tunables;
use crate::ctl::InRtMsg;
use crate::device::DeviceRegistry;
use crate::fib::Fib;
use crate::log::rt6_log;
use crate::neighbor::NeighborResolver;
use crate::request::Request;
use crate::types::*;
use crate::MOD_CTL;
use rt6_common::{lock, read_lock, write_lock};
use slog::Logger;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

#[derive(Clone)]
struct Watcher {
    tag: String,
    sender: Sender<InRtMsg>,
}

pub struct RoutingTable {
    pub(crate) fib: Mutex<Fib>,
    pub(crate) tx: Sender<Request>,
    pub(crate) rx: Mutex<Receiver<Request>>,
    pub(crate) bh_mask: AtomicU8,

    /// Table operations in progress. Deferred work runs only at zero.
    pub(crate) guard: AtomicUsize,

    /// Outstanding destination references handed to forwarding users.
    pub(crate) clients: AtomicUsize,

    watchers: RwLock<Vec<Watcher>>,
    pub(crate) neigh: Arc<dyn NeighborResolver>,
    pub(crate) devices: Arc<dyn DeviceRegistry>,
    pub(crate) tunables: Tunables,
    pub(crate) log: Logger,
}

/// Held for the duration of a table operation. Dropping the last one runs
/// the bottom half.
pub struct Rt6Guard<'a> {
    table: &'a RoutingTable,
}

impl Drop for Rt6Guard<'_> {
    fn drop(&mut self) {
        if self.table.guard.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.table.run_bh();
        }
    }
}

impl RoutingTable {
    pub fn new(
        tunables: Tunables,
        devices: Arc<dyn DeviceRegistry>,
        neigh: Arc<dyn NeighborResolver>,
        log: Logger,
    ) -> Self {
        let (tx, rx) = channel();
        Self {
            fib: Mutex::new(Fib::new(&tunables, neigh.clone(), log.clone())),
            tx,
            rx: Mutex::new(rx),
            bh_mask: AtomicU8::new(0),
            guard: AtomicUsize::new(0),
            clients: AtomicUsize::new(0),
            watchers: RwLock::new(Vec::new()),
            neigh,
            devices,
            tunables,
            log,
        }
    }

    /// Take the reentrancy guard. Bind it before locking the FIB so the lock
    /// is released first and the bottom half can take it.
    pub fn enter(&self) -> Rt6Guard<'_> {
        self.guard.fetch_add(1, Ordering::SeqCst);
        Rt6Guard { table: self }
    }

    pub(crate) fn fib(&self) -> MutexGuard<'_, Fib> {
        lock!(self.fib)
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub(crate) fn dec_clients(&self) {
        let r = self.clients.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |c| c.checked_sub(1),
        );
        if r.is_err() {
            rt6_log!(self.log, warn, MOD_CTL, "client count underflow");
        }
    }

    /// Register a receiver for outgoing route messages.
    pub fn watch(&self, tag: String, sender: Sender<InRtMsg>) {
        write_lock!(self.watchers).push(Watcher { tag, sender });
    }

    pub fn unwatch(&self, tag: &str) {
        write_lock!(self.watchers).retain(|w| w.tag != tag);
    }

    pub fn watcher_count(&self) -> usize {
        read_lock!(self.watchers).len()
    }

    /// Send `msg` to every watcher, forgetting those that hung up.
    pub(crate) fn notify(&self, msg: InRtMsg) {
        let mut gone = Vec::new();
        for Watcher { tag, sender } in read_lock!(self.watchers).iter() {
            if let Err(e) = sender.send(msg.clone()) {
                rt6_log!(self.log, error, MOD_CTL,
                    "failed to send route message to watcher '{tag}': {e}"
                );
                gone.push(tag.clone());
            }
        }
        if !gone.is_empty() {
            write_lock!(self.watchers).retain(|w| !gone.contains(&w.tag));
        }
    }

    pub fn stats(&self) -> Rt6Stats {
        self.fib().stats()
    }

    /// Snapshot of every linked route in trie walk order.
    pub fn routes(&self) -> Vec<Rt6Route> {
        let fib = self.fib();
        fib.linked_routes()
            .into_iter()
            .filter_map(|r| fib.route(r).map(Rt6Route::from))
            .collect()
    }

    /// Routes at exactly `dst/prefixlen`, in metric order.
    pub fn routes_at(&self, dst: &Ipv6Addr, prefixlen: u8) -> Vec<Rt6Route> {
        let fib = self.fib();
        fib.routes_at(dst, prefixlen)
            .into_iter()
            .filter_map(|r| fib.route(r).map(Rt6Route::from))
            .collect()
    }

    /// A read-only lookup. No cache entry is created and no reference is
    /// taken.
    pub fn lookup(
        &self,
        addr: &Ipv6Addr,
        exclude: RouteFlags,
    ) -> Option<Rt6Route> {
        let fib = self.fib();
        fib.lookup(addr, exclude, None)
            .and_then(|r| fib.route(r).map(Rt6Route::from))
    }

    pub fn route_info(&self, route: ResolvedRoute) -> Option<Rt6Route> {
        self.fib().route(route.id()).map(Rt6Route::from)
    }

    pub fn route_handle_info(&self, handle: RouteHandle) -> Option<Rt6Route> {
        self.fib().route(handle.0).map(Rt6Route::from)
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        self.fib().check_invariants()
    }

    /// Unlink every route. Entries still held by forwarding users stay
    /// allocated until released.
    pub fn flush(&self) {
        let _g = self.enter();
        self.fib().flush();
    }
}

impl Drop for RoutingTable {
    fn drop(&mut self) {
        if let Ok(fib) = self.fib.get_mut() {
            fib.teardown();
        }
    }
}
