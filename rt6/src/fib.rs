// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The forwarding information base.
//!
//! Routes are kept in a compressed binary trie over destination addresses.
//! Every node pins the first `bit` bits of its subtree's addresses and, when
//! it has children, branches on bit number `bit`. There are three kinds of
//! node:
//!
//! - the root, which pins nothing and holds the `::/0` routes,
//! - leaves, which are real prefixes of length `bit` and hold a metric ordered
//!   route list along with zero, one or two children,
//! - splits, which exist only because their two subtrees first differ at
//!   `bit`. A split always has exactly two children.
//!
//! Lookups descend blindly by testing bits of the target and then walk back
//! up through `parent` links, confirming at each leaf whether its prefix
//! really covers the target. Every node touched by a mutation is stamped with
//! a fresh serial number, which is what destination-cache holders compare
//! against to learn that their entry may be stale.

use crate::addr::{addr_bit_set, addr_diff, addr_match, ADDR_BITS};
use crate::arena::Arena;
use crate::config::Tunables;
use crate::error::Error;
use crate::log::rt6_log;
use crate::neighbor::NeighborResolver;
use crate::types::*;
use crate::MOD_FIB;
use slog::Logger;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum NodeRole {
    /// The trie root. Its routes are the default-route list.
    Root { routes: Vec<RouteId> },
    /// A branch point. The representative is any address below it and is
    /// only used to find where a new key diverges.
    Split { representative: Ipv6Addr },
    /// A real prefix.
    Leaf { routes: Vec<RouteId> },
}

#[derive(Debug)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub left: Option<NodeId>,
    pub right: Option<NodeId>,
    pub bit: u8,
    pub sernum: u32,
    pub role: NodeRole,
}

impl Node {
    fn new(bit: u8, sernum: u32, role: NodeRole) -> Self {
        Self {
            parent: None,
            left: None,
            right: None,
            bit,
            sernum,
            role,
        }
    }

    pub fn child(&self, right: bool) -> Option<NodeId> {
        if right {
            self.right
        } else {
            self.left
        }
    }

    fn set_child(&mut self, right: bool, child: Option<NodeId>) {
        if right {
            self.right = child;
        } else {
            self.left = child;
        }
    }

    pub fn children(&self) -> usize {
        self.left.is_some() as usize + self.right.is_some() as usize
    }

    pub fn routes(&self) -> &[RouteId] {
        match &self.role {
            NodeRole::Root { routes } | NodeRole::Leaf { routes } => routes,
            NodeRole::Split { .. } => &[],
        }
    }

    fn routes_mut(&mut self) -> Option<&mut Vec<RouteId>> {
        match &mut self.role {
            NodeRole::Root { routes } | NodeRole::Leaf { routes } => {
                Some(routes)
            }
            NodeRole::Split { .. } => None,
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self.role, NodeRole::Root { .. })
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.role, NodeRole::Leaf { .. })
    }

    pub fn is_split(&self) -> bool {
        matches!(self.role, NodeRole::Split { .. })
    }
}

/// Selects the route to remove from a prefix's route list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelKey {
    /// The first configured route.
    Any,
    /// The configured route through this gateway.
    Gateway(Ipv6Addr),
    /// The configured route out of this device.
    Device(String),
    /// This exact entry.
    Route(RouteId),
}

/// What a garbage collection pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub timeout: Duration,
    pub reclaimed: usize,
    pub expired: Vec<Rt6Route>,
    pub compacted: usize,
}

pub struct Fib {
    nodes: Arena<Node>,
    routes: Arena<Rt6Info>,
    root: NodeId,
    null_entry: RouteId,
    sernum: u32,
    loopback_rt: Option<RouteId>,
    last_resort_rt: Option<RouteId>,
    stats: Rt6Stats,
    neigh: Arc<dyn NeighborResolver>,
    log: Logger,
}

impl Fib {
    pub fn new(
        tunables: &Tunables,
        neigh: Arc<dyn NeighborResolver>,
        log: Logger,
    ) -> Self {
        let mut nodes = Arena::new();
        let root = nodes.push(Node::new(
            0,
            0,
            NodeRole::Root { routes: Vec::new() },
        ));
        nodes.set_limit(tunables.max_nodes.map(|n| n + 1));

        let mut routes = Arena::new();
        let mut null = Rt6Info::new(Ipv6Addr::UNSPECIFIED, 0, u32::MAX);
        null.flags = RouteFlags::REJECT;
        null.refcnt = 1;
        let null_entry = routes.push(null);
        routes.set_limit(tunables.max_routes.map(|n| n + 1));

        Self {
            nodes,
            routes,
            root,
            null_entry,
            sernum: 0,
            loopback_rt: None,
            last_resort_rt: None,
            stats: Rt6Stats::default(),
            neigh,
            log,
        }
    }

    pub fn stats(&self) -> Rt6Stats {
        self.stats
    }

    pub fn sernum(&self) -> u32 {
        self.sernum
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn null_entry(&self) -> RouteId {
        self.null_entry
    }

    pub fn loopback_rt(&self) -> Option<RouteId> {
        self.loopback_rt
    }

    pub fn last_resort_rt(&self) -> Option<RouteId> {
        self.last_resort_rt
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn route(&self, id: RouteId) -> Option<&Rt6Info> {
        self.routes.get(id)
    }

    pub fn route_mut(&mut self, id: RouteId) -> Option<&mut Rt6Info> {
        self.routes.get_mut(id)
    }

    /// Serial number of the node `id` is linked at, if it is linked.
    pub fn route_sernum(&self, id: RouteId) -> Option<u32> {
        let node = self.routes.get(id)?.fib_node?;
        self.nodes.get(node).map(|n| n.sernum)
    }

    fn next_sernum(&mut self) -> u32 {
        self.sernum = self.sernum.wrapping_add(1);
        self.sernum
    }

    /// The address a node's subtree shares over its first `bit` bits.
    pub fn node_addr(&self, id: NodeId) -> Ipv6Addr {
        match &self.nodes[id].role {
            NodeRole::Split { representative } => *representative,
            NodeRole::Root { .. } => Ipv6Addr::UNSPECIFIED,
            NodeRole::Leaf { routes } => routes
                .first()
                .map(|r| self.routes[*r].dst)
                .unwrap_or(Ipv6Addr::UNSPECIFIED),
        }
    }

    //
    // route entry lifetime
    //

    pub fn alloc_route(&mut self, rt: Rt6Info) -> Result<RouteId, Error> {
        let dcache = rt.is_dcache();
        match self.routes.try_insert(rt) {
            Ok(id) => {
                if dcache {
                    self.stats.fib_dc_alloc += 1;
                } else {
                    self.stats.fib_rt_alloc += 1;
                }
                Ok(id)
            }
            Err(rt) => {
                if let Some(n) = &rt.nexthop {
                    self.neigh.dec_neigh(n);
                }
                Err(Error::NoMemory("route"))
            }
        }
    }

    fn free_route(&mut self, id: RouteId) {
        if id == self.null_entry {
            return;
        }
        let Some(rt) = self.routes.remove(id) else {
            return;
        };
        if rt.is_dcache() {
            self.stats.fib_dc_alloc -= 1;
        } else {
            self.stats.fib_rt_alloc -= 1;
        }
        if let Some(n) = &rt.nexthop {
            self.neigh.dec_neigh(n);
        }
    }

    /// Free `id` if it is neither linked nor held.
    pub fn maybe_free(&mut self, id: RouteId) -> bool {
        match self.routes.get(id) {
            Some(rt) if rt.refcnt == 0 && rt.usecnt == 0 => {
                self.free_route(id);
                true
            }
            _ => false,
        }
    }

    //
    // insertion
    //

    fn alloc_node(&mut self, node: Node) -> Result<NodeId, Error> {
        let leaf = node.is_leaf();
        let id = self
            .nodes
            .try_insert(node)
            .map_err(|_| Error::NoMemory("trie node"))?;
        self.stats.fib_nodes += 1;
        if leaf {
            self.stats.fib_route_nodes += 1;
        }
        Ok(id)
    }

    fn free_node(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(id) {
            self.stats.fib_nodes -= 1;
            if node.is_leaf() {
                self.stats.fib_route_nodes -= 1;
            }
        }
    }

    fn attach(&mut self, parent: NodeId, right: bool, child: NodeId) {
        self.nodes[parent].set_child(right, Some(child));
        self.nodes[child].parent = Some(parent);
    }

    /// Which side of its parent `id` hangs on.
    fn side_of(&self, id: NodeId) -> Option<(NodeId, bool)> {
        let parent = self.nodes[id].parent?;
        Some((parent, self.nodes[parent].right == Some(id)))
    }

    /// Insert `id` after every route with an equal or lower metric. Cache
    /// entries go ahead of configured routes with the same metric so that a
    /// host route used as a clone template is not cloned again.
    fn insert_sorted(&mut self, node: NodeId, id: RouteId) {
        let metric = self.routes[id].metric;
        let dcache = self.routes[id].is_dcache();
        let pos = self.nodes[node].routes().iter().position(|r| {
            let rt = &self.routes[*r];
            rt.metric > metric
                || (dcache && rt.metric == metric && !rt.is_dcache())
        });
        if let Some(list) = self.nodes[node].routes_mut() {
            match pos {
                Some(p) => list.insert(p, id),
                None => list.push(id),
            }
        }
    }

    /// Link an allocated, unlinked route into the trie.
    pub fn add(&mut self, id: RouteId) -> Result<(), Error> {
        let (dst, plen, dcache) = {
            let rt = self.routes.get(id).ok_or(Error::NotFound)?;
            if rt.fib_node.is_some() {
                return Err(Error::InvalidArgument(
                    "route is already linked".into(),
                ));
            }
            (rt.dst, rt.prefixlen, rt.is_dcache())
        };
        if plen > ADDR_BITS {
            return Err(Error::InvalidArgument(format!(
                "prefix length {plen} out of range"
            )));
        }

        let sernum = self.next_sernum();
        let root = self.root;
        let leaf = if plen == 0 {
            self.nodes[root].sernum = sernum;
            self.insert_sorted(root, id);
            root
        } else {
            self.add_1(id, dst, plen, sernum)?
        };

        let rt = &mut self.routes[id];
        rt.fib_node = Some(leaf);
        rt.refcnt += 1;
        self.stats.fib_rt_entries += 1;

        if !dcache {
            if rt.flags.contains(RouteFlags::ALLONLINK) {
                self.last_resort_rt = Some(id);
            }
            if rt.on_loopback()
                && rt.prefixlen == ADDR_BITS
                && self.loopback_rt.is_none()
            {
                self.loopback_rt = Some(id);
            }
            self.prune_clones(leaf, plen);
        }

        rt6_log!(self.log, debug, MOD_FIB, "added {dst}/{plen}";
            "sernum" => sernum,
            "dcache" => dcache
        );
        Ok(())
    }

    fn new_leaf(
        &mut self,
        plen: u8,
        id: RouteId,
        sernum: u32,
    ) -> Result<NodeId, Error> {
        self.alloc_node(Node::new(
            plen,
            sernum,
            NodeRole::Leaf { routes: vec![id] },
        ))
    }

    /// Find the node `id` belongs at, creating it and any split it needs.
    /// Nodes are allocated before anything is relinked, so a failed
    /// allocation leaves the trie untouched.
    fn add_1(
        &mut self,
        id: RouteId,
        dst: Ipv6Addr,
        plen: u8,
        sernum: u32,
    ) -> Result<NodeId, Error> {
        let mut parent = self.root;
        loop {
            self.nodes[parent].sernum = sernum;
            let dir = addr_bit_set(&dst, self.nodes[parent].bit);

            let Some(child) = self.nodes[parent].child(dir) else {
                let leaf = self.new_leaf(plen, id, sernum)?;
                self.attach(parent, dir, leaf);
                return Ok(leaf);
            };

            let cbit = self.nodes[child].bit;
            let caddr = self.node_addr(child);

            if !addr_match(&dst, &caddr, cbit.min(plen)) {
                // The new key leaves the child's subtree before either ends:
                // both hang off a new split at the first differing bit.
                let d = addr_diff(&dst, &caddr);
                let leaf = self.new_leaf(plen, id, sernum)?;
                let split = match self.alloc_node(Node::new(
                    d,
                    sernum,
                    NodeRole::Split { representative: dst },
                )) {
                    Ok(split) => split,
                    Err(e) => {
                        self.free_node(leaf);
                        return Err(e);
                    }
                };
                let new_right = addr_bit_set(&dst, d);
                self.attach(split, new_right, leaf);
                self.attach(split, !new_right, child);
                self.attach(parent, dir, split);
                return Ok(leaf);
            }

            if cbit == plen {
                let node = &mut self.nodes[child];
                if node.is_split() {
                    node.role = NodeRole::Leaf { routes: Vec::new() };
                    self.stats.fib_route_nodes += 1;
                }
                self.nodes[child].sernum = sernum;
                self.insert_sorted(child, id);
                return Ok(child);
            }

            if plen < cbit {
                // The new prefix covers the whole child subtree.
                let leaf = self.new_leaf(plen, id, sernum)?;
                let child_right = addr_bit_set(&caddr, plen);
                self.attach(leaf, child_right, child);
                self.attach(parent, dir, leaf);
                return Ok(leaf);
            }

            parent = child;
        }
    }

    //
    // lookup
    //

    fn select(
        &self,
        list: &[RouteId],
        exclude: RouteFlags,
        dev: Option<&str>,
    ) -> Option<RouteId> {
        let mut candidates = list
            .iter()
            .copied()
            .filter(|r| !self.routes[*r].flags.intersects(exclude));
        match dev {
            None => candidates.next(),
            Some(name) => {
                let first = candidates.next()?;
                if self.routes[first].dev_name() == name {
                    return Some(first);
                }
                candidates
                    .find(|r| self.routes[*r].dev_name() == name)
                    .or(Some(first))
            }
        }
    }

    /// Longest-prefix match below the root. Routes whose flags intersect
    /// `exclude` are skipped.
    pub fn lookup_1(
        &self,
        addr: &Ipv6Addr,
        exclude: RouteFlags,
        dev: Option<&str>,
    ) -> Option<RouteId> {
        let mut node = self.root;
        loop {
            let n = &self.nodes[node];
            if n.bit >= ADDR_BITS {
                break;
            }
            match n.child(addr_bit_set(addr, n.bit)) {
                Some(c) => node = c,
                None => break,
            }
        }

        loop {
            let n = &self.nodes[node];
            if n.is_root() {
                return None;
            }
            if n.is_leaf() && addr_match(addr, &self.node_addr(node), n.bit) {
                if let Some(r) = self.select(n.routes(), exclude, dev) {
                    return Some(r);
                }
            }
            node = n.parent?;
        }
    }

    /// Full lookup: longest-prefix match, then the default-route list, then
    /// the last-resort route.
    pub fn lookup(
        &self,
        addr: &Ipv6Addr,
        exclude: RouteFlags,
        dev: Option<&str>,
    ) -> Option<RouteId> {
        if let Some(r) = self.lookup_1(addr, exclude, dev) {
            return Some(r);
        }
        if let Some(r) = self.select(self.nodes[self.root].routes(), exclude, dev)
        {
            return Some(r);
        }
        self.last_resort_rt
            .filter(|r| !self.routes[*r].flags.intersects(exclude))
    }

    /// The leaf (or root for `/0`) holding exactly `dst/plen`.
    pub fn find_node(&self, dst: &Ipv6Addr, plen: u8) -> Option<NodeId> {
        if plen == 0 {
            return Some(self.root);
        }
        let mut node = self.root;
        loop {
            let n = &self.nodes[node];
            let child = n.child(addr_bit_set(dst, n.bit))?;
            let c = &self.nodes[child];
            if c.bit > plen {
                return None;
            }
            if !addr_match(dst, &self.node_addr(child), c.bit) {
                return None;
            }
            if c.bit == plen {
                return c.is_leaf().then_some(child);
            }
            node = child;
        }
    }

    /// The route `key` selects from the list at exactly `dst/plen`.
    pub fn locate(
        &self,
        dst: &Ipv6Addr,
        plen: u8,
        key: &DelKey,
    ) -> Option<RouteId> {
        let node = self.find_node(dst, plen)?;
        self.nodes[node].routes().iter().copied().find(|r| {
            let rt = &self.routes[*r];
            match key {
                DelKey::Route(id) => r == id,
                _ if rt.is_dcache() => false,
                DelKey::Any => true,
                DelKey::Gateway(gw) => {
                    rt.flags.contains(RouteFlags::GATEWAY) && rt.gateway == *gw
                }
                DelKey::Device(name) => rt.dev_name() == name,
            }
        })
    }

    /// Routes at exactly `dst/plen`, front to back.
    pub fn routes_at(&self, dst: &Ipv6Addr, plen: u8) -> Vec<RouteId> {
        self.find_node(dst, plen)
            .map(|n| self.nodes[n].routes().to_vec())
            .unwrap_or_default()
    }

    /// Stamp the node `id` is linked at, and its ancestors, with a fresh
    /// serial number after the route was modified in place.
    pub fn touch(&mut self, id: RouteId) {
        let Some(node) = self.routes.get(id).and_then(|rt| rt.fib_node) else {
            return;
        };
        self.stamp_path(node);
    }

    fn stamp_path(&mut self, node: NodeId) {
        let sernum = self.next_sernum();
        let mut n = Some(node);
        while let Some(cur) = n {
            self.nodes[cur].sernum = sernum;
            n = self.nodes[cur].parent;
        }
    }

    //
    // deletion
    //

    /// Remove the route `key` selects at `dst/plen`.
    pub fn del_2(
        &mut self,
        dst: &Ipv6Addr,
        plen: u8,
        key: &DelKey,
    ) -> Result<RouteId, Error> {
        let id = self.locate(dst, plen, key).ok_or(Error::NotFound)?;
        self.del_rt(id)?;
        Ok(id)
    }

    /// Remove a route by identity. Cache entries cloned from it go too.
    pub fn del_rt(&mut self, id: RouteId) -> Result<(), Error> {
        let rt = self.routes.get(id).ok_or(Error::NotFound)?;
        let node = rt.fib_node.ok_or(Error::NotFound)?;
        if !rt.is_dcache() {
            let clones: Vec<RouteId> = self
                .subtree_routes(node)
                .into_iter()
                .filter(|r| {
                    self.routes[*r]
                        .dest
                        .as_ref()
                        .is_some_and(|d| d.template == Some(id))
                })
                .collect();
            for c in clones {
                self.unlink(c);
            }
        }
        self.unlink(id);
        Ok(())
    }

    /// Take a route out of its node's list, collapse the node if that
    /// emptied it, and free the route if nobody holds it.
    pub fn unlink(&mut self, id: RouteId) {
        let Some(rt) = self.routes.get_mut(id) else {
            return;
        };
        let Some(node) = rt.fib_node.take() else {
            return;
        };
        rt.refcnt = rt.refcnt.saturating_sub(1);
        if rt.refcnt != 0 {
            rt6_log!(self.log, warn, MOD_FIB,
                "{}/{} unlinked with stray references", rt.dst, rt.prefixlen;
                "refcnt" => rt.refcnt
            );
        }
        if let Some(dest) = &mut rt.dest {
            dest.flags |= DestFlags::INVALID;
        }

        if let Some(list) = self.nodes[node].routes_mut() {
            list.retain(|r| *r != id);
        }
        self.stats.fib_rt_entries -= 1;
        if self.loopback_rt == Some(id) {
            self.loopback_rt = None;
        }
        if self.last_resort_rt == Some(id) {
            self.last_resort_rt = None;
        }

        self.stamp_path(node);

        if self.nodes[node].is_leaf() && self.nodes[node].routes().is_empty() {
            self.collapse(node);
        }
        self.maybe_free(id);
    }

    /// Restore the trie shape after `id` lost its last route, or after a
    /// split lost a child.
    fn collapse(&mut self, mut id: NodeId) {
        loop {
            let n = &self.nodes[id];
            match &n.role {
                NodeRole::Root { .. } => return,
                NodeRole::Leaf { routes } if !routes.is_empty() => return,
                NodeRole::Split { .. } if n.children() == 2 => return,
                _ => {}
            }

            match (n.left, n.right) {
                (Some(l), Some(r)) => {
                    // An emptied leaf that is also a branch point becomes a
                    // plain split.
                    let la = self.node_addr(l);
                    let bit = addr_diff(&la, &self.node_addr(r));
                    let n = &mut self.nodes[id];
                    if bit != n.bit {
                        rt6_log!(self.log, warn, MOD_FIB,
                            "demoted node branches at {bit}, expected {}", n.bit
                        );
                    }
                    n.bit = bit;
                    n.role = NodeRole::Split { representative: la };
                    self.stats.fib_route_nodes -= 1;
                    return;
                }
                (Some(c), None) | (None, Some(c)) => {
                    if let Some((parent, right)) = self.side_of(id) {
                        self.attach(parent, right, c);
                    }
                    self.free_node(id);
                    return;
                }
                (None, None) => {
                    let Some((parent, right)) = self.side_of(id) else {
                        return;
                    };
                    self.nodes[parent].set_child(right, None);
                    self.free_node(id);
                    id = parent;
                }
            }
        }
    }

    /// Drop cache entries below `leaf` that were cloned from a less specific
    /// route than the one just added there.
    fn prune_clones(&mut self, leaf: NodeId, plen: u8) {
        let stale: Vec<RouteId> = self
            .subtree_routes(leaf)
            .into_iter()
            .filter(|r| {
                self.routes[*r]
                    .dest
                    .as_ref()
                    .is_some_and(|d| d.template_len < plen)
            })
            .collect();
        for r in stale {
            self.unlink(r);
        }
    }

    //
    // traversal
    //

    /// Nodes holding routes (the root and every leaf), parents before
    /// children, left before right.
    pub fn route_nodes(&self) -> Vec<NodeId> {
        self.walk(self.root)
            .into_iter()
            .filter(|n| !self.nodes[*n].is_split())
            .collect()
    }

    fn walk(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            let n = &self.nodes[id];
            out.push(id);
            if let Some(r) = n.right {
                stack.push(r);
            }
            if let Some(l) = n.left {
                stack.push(l);
            }
        }
        out
    }

    fn subtree_routes(&self, from: NodeId) -> Vec<RouteId> {
        self.walk(from)
            .into_iter()
            .flat_map(|n| self.nodes[n].routes().to_vec())
            .collect()
    }

    /// Every linked route in walk order.
    pub fn linked_routes(&self) -> Vec<RouteId> {
        self.subtree_routes(self.root)
    }

    //
    // garbage collection
    //

    /// Reclaim idle destination-cache entries and expired autoconfigured
    /// routes.
    pub fn gc(&mut self, now: Instant, timeout: Duration) -> GcReport {
        let mut report = GcReport {
            timeout,
            ..Default::default()
        };

        for node in self.route_nodes() {
            let Some(n) = self.nodes.get(node) else {
                continue;
            };
            for r in n.routes().to_vec() {
                // Deleting an expired route also takes its clones, which may
                // still be ahead of us in this walk.
                let Some(rt) = self.routes.get(r) else { continue };
                if rt.fib_node.is_none() {
                    continue;
                }
                let idle = rt.dest.as_ref().is_some_and(|d| {
                    rt.usecnt == 0
                        && now
                            .checked_duration_since(d.tstamp)
                            .is_some_and(|idle| idle > timeout)
                });
                let expired = rt.flags.contains(RouteFlags::ADDRCONF)
                    && rt.expires.is_some_and(|e| e <= now);

                if idle {
                    self.unlink(r);
                    report.reclaimed += 1;
                } else if expired {
                    let snapshot = Rt6Route::from(rt);
                    match self.del_rt(r) {
                        Ok(()) => report.expired.push(snapshot),
                        Err(e) => {
                            rt6_log!(self.log, warn, MOD_FIB,
                                "failed to expire {}/{}: {e}",
                                snapshot.dst,
                                snapshot.prefixlen
                            );
                        }
                    }
                }
            }
        }

        for node in self.walk(self.root) {
            let Some(n) = self.nodes.get(node) else {
                continue;
            };
            if n.is_split() && n.children() < 2 {
                rt6_log!(self.log, warn, MOD_FIB,
                    "collapsing split at bit {} with {} children",
                    n.bit,
                    n.children()
                );
                self.collapse(node);
                report.compacted += 1;
            }
        }

        report
    }

    /// Unlink everything. Entries still held by forwarding-path users are
    /// left allocated until they are released.
    pub fn flush(&mut self) {
        for r in self.linked_routes() {
            self.unlink(r);
        }
    }

    /// Unlink and free everything, held or not.
    pub fn teardown(&mut self) {
        self.flush();
        let ids: Vec<RouteId> = self.routes.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.free_route(id);
        }
    }

    /// Check the structural invariants of the trie.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut nodes = 0;
        let mut route_nodes = 0;
        let mut entries = 0;

        for id in self.walk(self.root) {
            let n = &self.nodes[id];
            let addr = self.node_addr(id);

            for (right, child) in [(false, n.left), (true, n.right)] {
                let Some(c) = child else { continue };
                let cn = &self.nodes[c];
                if cn.parent != Some(id) {
                    return Err(format!("{c:?} has a stale parent link"));
                }
                if cn.bit <= n.bit {
                    return Err(format!(
                        "{c:?} at bit {} below {id:?} at bit {}",
                        cn.bit, n.bit
                    ));
                }
                let caddr = self.node_addr(c);
                if !addr_match(&caddr, &addr, n.bit)
                    || addr_bit_set(&caddr, n.bit) != right
                {
                    return Err(format!("{c:?} is on the wrong branch"));
                }
            }

            match &n.role {
                NodeRole::Split { .. } => {
                    nodes += 1;
                    if n.children() != 2 {
                        return Err(format!(
                            "split {id:?} has {} children",
                            n.children()
                        ));
                    }
                }
                NodeRole::Leaf { routes } if routes.is_empty() => {
                    return Err(format!("leaf {id:?} has no routes"));
                }
                NodeRole::Leaf { .. } | NodeRole::Root { .. } => {
                    if n.is_leaf() {
                        nodes += 1;
                        route_nodes += 1;
                    }
                    let mut last = 0;
                    for r in n.routes() {
                        let rt = &self.routes[*r];
                        entries += 1;
                        if rt.fib_node != Some(id) {
                            return Err(format!("{r:?} has a stale node"));
                        }
                        if rt.prefixlen != n.bit
                            || !addr_match(&rt.dst, &addr, n.bit)
                        {
                            return Err(format!(
                                "{}/{} stored at bit {}",
                                rt.dst, rt.prefixlen, n.bit
                            ));
                        }
                        if rt.metric < last {
                            return Err(format!("{id:?} is not metric ordered"));
                        }
                        last = rt.metric;
                    }
                }
            }
        }

        if nodes != self.stats.fib_nodes
            || route_nodes != self.stats.fib_route_nodes
            || entries != self.stats.fib_rt_entries
        {
            return Err(format!(
                "counted {nodes}/{route_nodes}/{entries} nodes/route nodes/\
                 entries, stats say {:?}",
                self.stats
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::neighbor::NeighborCache;
    use pretty_assertions::assert_eq;
    use rt6_common::log::init_file_logger;

    fn fib() -> Fib {
        let log = init_file_logger("fib.log");
        Fib::new(
            &Tunables::default(),
            Arc::new(NeighborCache::new(log.clone())),
            log,
        )
    }

    fn add(fib: &mut Fib, prefix: &str, metric: u32) -> RouteId {
        let (addr, len) = prefix.split_once('/').unwrap();
        let rt = Rt6Info::new(addr.parse().unwrap(), len.parse().unwrap(), metric);
        let id = fib.alloc_route(rt).unwrap();
        fib.add(id).unwrap();
        fib.check_invariants().unwrap();
        id
    }

    fn lookup(fib: &Fib, addr: &str) -> Option<RouteId> {
        fib.lookup(&addr.parse().unwrap(), RouteFlags::empty(), None)
    }

    #[test]
    fn longest_prefix_wins() {
        let mut fib = fib();
        let p32 = add(&mut fib, "2001:db8::/32", 1);
        let p64 = add(&mut fib, "2001:db8::/64", 1);
        assert_eq!(lookup(&fib, "2001:db8::1"), Some(p64));
        assert_eq!(lookup(&fib, "2001:db8:1::1"), Some(p32));
        assert_eq!(lookup(&fib, "2001:db9::1"), None);
    }

    #[test]
    fn split_then_promote() {
        let mut fib = fib();
        let a = add(&mut fib, "2001:db8:1::/48", 1);
        let b = add(&mut fib, "2001:db8:2::/48", 1);
        // The two /48s branch at bit 46, a split by construction.
        assert_eq!(fib.stats().fib_nodes, 3);
        assert_eq!(fib.stats().fib_route_nodes, 2);

        // A /46 covering both lands exactly on the split.
        let c = add(&mut fib, "2001:db8::/46", 1);
        assert_eq!(fib.stats().fib_nodes, 3);
        assert_eq!(fib.stats().fib_route_nodes, 3);

        assert_eq!(lookup(&fib, "2001:db8:1::5"), Some(a));
        assert_eq!(lookup(&fib, "2001:db8:2::5"), Some(b));
        assert_eq!(lookup(&fib, "2001:db8:3::5"), Some(c));
    }

    #[test]
    fn ancestor_insert_and_delete() {
        let mut fib = fib();
        let host = add(&mut fib, "2001:db8::1/128", 1);
        let net = add(&mut fib, "2001:db8::/64", 1);
        assert_eq!(lookup(&fib, "2001:db8::1"), Some(host));
        assert_eq!(lookup(&fib, "2001:db8::2"), Some(net));

        fib.del_rt(net).unwrap();
        fib.check_invariants().unwrap();
        assert!(fib.route(net).is_none());
        assert_eq!(lookup(&fib, "2001:db8::2"), None);
        assert_eq!(fib.stats().fib_nodes, 1);

        fib.del_rt(host).unwrap();
        fib.check_invariants().unwrap();
        assert_eq!(fib.stats(), Rt6Stats::default());
    }

    #[test]
    fn delete_demotes_branching_leaf() {
        let mut fib = fib();
        let a = add(&mut fib, "2001:db8:1::/48", 1);
        let b = add(&mut fib, "2001:db8:3::/48", 1);
        let c = add(&mut fib, "2001:db8::/46", 1);
        assert_eq!(fib.stats().fib_nodes, 3);

        fib.del_rt(c).unwrap();
        fib.check_invariants().unwrap();
        assert_eq!(fib.stats().fib_nodes, 3);
        assert_eq!(fib.stats().fib_route_nodes, 2);
        assert_eq!(lookup(&fib, "2001:db8:1::1"), Some(a));
        assert_eq!(lookup(&fib, "2001:db8:3::1"), Some(b));

        fib.del_rt(a).unwrap();
        fib.check_invariants().unwrap();
        // The split above b has nothing left to separate.
        assert_eq!(fib.stats().fib_nodes, 1);
        assert_eq!(lookup(&fib, "2001:db8:3::1"), Some(b));
    }

    #[test]
    fn metric_order_at_one_prefix() {
        let mut fib = fib();
        for m in [30, 10, 20] {
            add(&mut fib, "2001:db8::/32", m);
        }
        let metrics: Vec<u32> = fib
            .routes_at(&"2001:db8::".parse().unwrap(), 32)
            .into_iter()
            .map(|r| fib.route(r).unwrap().metric)
            .collect();
        assert_eq!(metrics, vec![10, 20, 30]);
        assert_eq!(fib.stats().fib_route_nodes, 1);
    }

    #[test]
    fn exclusion_mask_backtracks() {
        let mut fib = fib();
        let p32 = add(&mut fib, "2001:db8::/32", 1);
        let p64 = add(&mut fib, "2001:db8::/64", 1);
        fib.route_mut(p64).unwrap().flags |= RouteFlags::GATEWAY;
        let addr = "2001:db8::1".parse().unwrap();
        assert_eq!(fib.lookup(&addr, RouteFlags::GATEWAY, None), Some(p32));
        assert_eq!(fib.lookup(&addr, RouteFlags::empty(), None), Some(p64));
    }

    #[test]
    fn default_list_and_find() {
        let mut fib = fib();
        let d = add(&mut fib, "::/0", 5);
        let p = add(&mut fib, "2001:db8::/32", 1);
        assert_eq!(lookup(&fib, "3fff::1"), Some(d));
        assert_eq!(fib.find_node(&Ipv6Addr::UNSPECIFIED, 0), Some(fib.root()));
        assert!(fib.find_node(&"2001:db8::".parse().unwrap(), 31).is_none());
        assert_eq!(
            fib.locate(&"2001:db8::".parse().unwrap(), 32, &DelKey::Any),
            Some(p)
        );
    }

    #[test]
    fn allocation_failure_leaves_trie_intact() {
        let log = init_file_logger("fib_nomem.log");
        let tunables = Tunables {
            max_nodes: Some(2),
            ..Default::default()
        };
        let mut fib =
            Fib::new(&tunables, Arc::new(NeighborCache::new(log.clone())), log);
        add(&mut fib, "2001:db8:1::/48", 1);
        add(&mut fib, "2001:db8:1:1::/64", 1);

        // Needs a leaf and a split.
        let rt = Rt6Info::new("2001:db8:2::".parse().unwrap(), 48, 1);
        let id = fib.alloc_route(rt).unwrap();
        assert_eq!(fib.add(id), Err(Error::NoMemory("trie node")));
        fib.check_invariants().unwrap();
        assert_eq!(fib.stats().fib_nodes, 2);
        assert!(fib.maybe_free(id));
    }
}
