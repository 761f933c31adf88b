// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::arena::Index;
use crate::device::Device;
use crate::fib::Node;
use crate::neighbor::NeighborHandle;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Instant;

pub type NodeId = Index<Node>;
pub type RouteId = Index<Rt6Info>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RouteFlags: u32 {
        const UP = 0x0001;
        /// Next hop is a router, not the destination itself.
        const GATEWAY = 0x0002;
        /// Host (/128) route.
        const HOST = 0x0004;
        const DYNAMIC = 0x0010;
        const MODIFIED = 0x0020;
        const REJECT = 0x0200;
        /// Learned from a router advertisement, subject to expiry.
        const ADDRCONF = 0x0400;
        /// Fallback used when no router is known: everything is on link.
        const ALLONLINK = 0x0800;
        /// Destination-cache entry rather than a configured route.
        const DCACHE = 0x1000;
        const RTI_DYNAMIC = 0x2000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DestFlags: u32 {
        /// The path MTU was learned rather than copied from the device.
        const PMTU = 0x1;
        /// Forces holders to look the destination up again.
        const INVALID = 0x2;
    }
}

/// Per-destination state carried by destination-cache entries.
#[derive(Debug, Clone)]
pub struct DestCache {
    /// The exact destination this entry resolves.
    pub addr: Ipv6Addr,
    /// In-flight holders.
    pub usecnt: u32,
    pub pmtu: u32,
    pub flags: DestFlags,
    /// When the last holder let go.
    pub tstamp: Instant,
    /// The route this entry was cloned from and its prefix length.
    pub template: Option<RouteId>,
    pub template_len: u8,
}

/// A forwarding rule, or a destination-cache entry when `dest` is set.
#[derive(Debug, Clone)]
pub struct Rt6Info {
    pub dst: Ipv6Addr,
    pub prefixlen: u8,
    pub metric: u32,
    pub flags: RouteFlags,
    pub gateway: Ipv6Addr,
    pub dev: Option<Arc<Device>>,
    pub nexthop: Option<NeighborHandle>,
    /// Trie nodes referencing this entry.
    pub refcnt: u32,
    /// Active holders.
    pub usecnt: u32,
    /// Owning trie node, `None` once unlinked.
    pub fib_node: Option<NodeId>,
    pub expires: Option<Instant>,
    pub dest: Option<DestCache>,
}

impl Rt6Info {
    pub fn new(dst: Ipv6Addr, prefixlen: u8, metric: u32) -> Self {
        Self {
            dst,
            prefixlen,
            metric,
            flags: RouteFlags::UP,
            gateway: Ipv6Addr::UNSPECIFIED,
            dev: None,
            nexthop: None,
            refcnt: 0,
            usecnt: 0,
            fib_node: None,
            expires: None,
            dest: None,
        }
    }

    pub fn is_dcache(&self) -> bool {
        self.flags.contains(RouteFlags::DCACHE)
    }

    pub fn dev_name(&self) -> &str {
        self.dev.as_ref().map(|d| d.name.as_str()).unwrap_or("")
    }

    pub fn on_loopback(&self) -> bool {
        self.dev.as_ref().map(|d| d.is_loopback()).unwrap_or(false)
    }
}

/// A FIB route handed out directly to a forwarding-path user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteHandle(pub(crate) RouteId);

/// A destination-cache entry handed out to a forwarding-path user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestHandle(pub(crate) RouteId);

/// Result of resolving a destination. A route that already has a resolved
/// next hop is shared as is; otherwise a per-destination cache entry is
/// created and handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolvedRoute {
    Shared(RouteHandle),
    Cached(DestHandle),
}

impl ResolvedRoute {
    pub(crate) fn id(&self) -> RouteId {
        match self {
            Self::Shared(h) => h.0,
            Self::Cached(h) => h.0,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

/// A resolution together with the serial number of its trie node at the time
/// it was validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DstRef {
    pub route: ResolvedRoute,
    pub sernum: u32,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Rt6Stats {
    /// Trie nodes, not counting the root.
    pub fib_nodes: usize,
    /// Trie nodes that hold routes, not counting the root.
    pub fib_route_nodes: usize,
    /// Allocated route entries.
    pub fib_rt_alloc: usize,
    /// Entries linked into the trie, cache entries included.
    pub fib_rt_entries: usize,
    /// Allocated destination-cache entries.
    pub fib_dc_alloc: usize,
}

/// A point in time copy of a route for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rt6Route {
    pub dst: Ipv6Addr,
    pub prefixlen: u8,
    pub gateway: Option<Ipv6Addr>,
    pub nexthop: Option<Ipv6Addr>,
    pub metric: u32,
    pub usecnt: u32,
    pub refcnt: u32,
    pub flags: u32,
    pub device: String,
    pub pmtu: Option<u32>,
}

impl Rt6Route {
    pub fn flags(&self) -> RouteFlags {
        RouteFlags::from_bits_truncate(self.flags)
    }

    pub fn is_cache(&self) -> bool {
        self.flags().contains(RouteFlags::DCACHE)
    }
}

impl From<&Rt6Info> for Rt6Route {
    fn from(rt: &Rt6Info) -> Self {
        Self {
            dst: rt.dst,
            prefixlen: rt.prefixlen,
            gateway: rt
                .flags
                .contains(RouteFlags::GATEWAY)
                .then_some(rt.gateway),
            nexthop: rt.nexthop.as_ref().map(|n| n.addr),
            metric: rt.metric,
            usecnt: rt.usecnt,
            refcnt: rt.refcnt,
            flags: rt.flags.bits(),
            device: rt.dev_name().to_string(),
            pmtu: rt.dest.as_ref().map(|d| d.pmtu),
        }
    }
}

impl Display for Rt6Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dst, self.prefixlen)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        write!(f, " dev {} metric {}", self.device, self.metric)
    }
}
