// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An IPv6 routing table engine.
//!
//! Routes live in a compressed binary trie keyed on destination prefix. A
//! destination cache of per-address host entries is layered over the trie and
//! invalidated through serial numbers stamped on trie nodes. Mutations are
//! funneled through a FIFO request queue that is drained at safe points, and
//! idle cache entries are reclaimed by a periodic garbage collector.

pub mod addr;
pub mod arena;
pub mod config;
pub mod ctl;
pub mod dcache;
pub mod device;
pub mod dump;
pub mod error;
pub mod fib;
pub mod gc;
pub mod log;
pub mod neighbor;
pub mod request;
pub mod table;
pub mod types;

#[cfg(test)]
mod proptest;

pub use config::Tunables;
pub use table::RoutingTable;
pub use types::*;

/// Smallest path MTU accepted from a "packet too big" notification.
pub const IPV6_MIN_MTU: u32 = 576;

pub const COMPONENT_RT6: &str = "rt6";
pub const MOD_FIB: &str = "fib";
pub const MOD_DCACHE: &str = "dcache";
pub const MOD_GC: &str = "gc";
pub const MOD_CTL: &str = "ctl";
