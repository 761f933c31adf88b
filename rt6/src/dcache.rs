// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The destination cache.
//!
//! Forwarding users resolve a destination once with
//! [`RoutingTable::dst_route`] and then revalidate the reference they got on
//! each use with [`RoutingTable::dst_check`], which costs one serial number
//! comparison unless the trie changed under them. A route that already has a
//! resolved next hop is shared directly. Anything else is cloned into a `/128`
//! cache entry bound to a neighbor for that one destination.

use crate::ctl::{InRtMsg, RTMSG_NEWROUTE};
use crate::device::Device;
use crate::error::Error;
use crate::fib::Fib;
use crate::log::rt6_log;
use crate::request::{Operation, Request, BH_GC};
use crate::table::RoutingTable;
use crate::types::*;
use crate::{IPV6_MIN_MTU, MOD_DCACHE};
use std::net::Ipv6Addr;
use std::sync::atomic::Ordering;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Instant;

impl RoutingTable {
    /// Resolve `daddr` for a forwarding user. The caller owns one use of the
    /// returned entry and gives it back with [`RoutingTable::dst_unlock`].
    /// Routes whose flags intersect `flags` are skipped.
    pub fn dst_route(
        &self,
        daddr: &Ipv6Addr,
        src_dev: Option<&Device>,
        flags: RouteFlags,
    ) -> Result<DstRef, Error> {
        let g = self.enter();
        let mut fib = self.fib();

        let mut id = fib
            .lookup(daddr, flags, src_dev.map(|d| d.name.as_str()))
            .unwrap_or(fib.null_entry());

        let (local, cloneable) = {
            let rt = fib.route(id).ok_or(Error::NotFound)?;
            (
                rt.on_loopback(),
                rt.nexthop.is_none()
                    && rt.dev.is_some()
                    && !rt.is_dcache()
                    && !rt.flags.contains(RouteFlags::REJECT),
            )
        };

        // Traffic to a local address goes through the loopback route.
        if let Some(lo) = fib.loopback_rt().filter(|_| local) {
            id = lo;
        }

        let (route, reply) = if local || !cloneable {
            self.hold(&mut fib, id);
            if fib.route(id).is_some_and(Rt6Info::is_dcache) {
                (ResolvedRoute::Cached(DestHandle(id)), None)
            } else {
                (ResolvedRoute::Shared(RouteHandle(id)), None)
            }
        } else {
            let clone = self.clone_route(&mut fib, id, daddr, None, 1)?;
            let (tx, rx) = channel();
            self.queue(Request::with_reply(Operation::Add, clone, tx));
            (ResolvedRoute::Cached(DestHandle(clone)), Some(rx))
        };
        self.clients.fetch_add(1, Ordering::SeqCst);
        let sernum = fib.route_sernum(route.id()).unwrap_or(0);

        drop(fib);
        drop(g);

        let Some(rx) = reply else {
            return Ok(DstRef { route, sernum });
        };

        // A fresh clone is only linked once the drain above has run. While
        // another operation holds the guard it stays queued and the caller
        // gets serial 0, which fails its first check.
        if let Ok(Err(e)) = rx.try_recv() {
            self.drop_clone(route.id());
            rt6_log!(self.log, warn, MOD_DCACHE,
                "cache entry for {daddr} not linked: {e}"
            );
            return Err(e);
        }
        let sernum = self.fib().route_sernum(route.id()).unwrap_or(0);
        Ok(DstRef { route, sernum })
    }

    /// Give back a clone whose insertion failed, along with the use and the
    /// client reference handed out for it.
    fn drop_clone(&self, id: RouteId) {
        let mut fib = self.fib();
        if let Some(rt) = fib.route_mut(id) {
            rt.usecnt = 0;
            if let Some(d) = &mut rt.dest {
                d.usecnt = 0;
            }
        }
        fib.maybe_free(id);
        drop(fib);
        self.dec_clients();
    }

    /// Revalidate `dst`. A reference that is still current is returned as is.
    /// A stale one is given back and `daddr` is resolved again.
    pub fn dst_check(
        &self,
        dst: DstRef,
        daddr: &Ipv6Addr,
        flags: RouteFlags,
    ) -> Result<DstRef, Error> {
        {
            let fib = self.fib();
            let id = dst.route.id();
            let current = fib.route(id).is_some_and(|rt| {
                rt.fib_node.is_some()
                    && !rt
                        .dest
                        .as_ref()
                        .is_some_and(|d| d.flags.contains(DestFlags::INVALID))
            }) && fib.route_sernum(id) == Some(dst.sernum);

            if current {
                if let Some(n) = fib.route(id).and_then(|rt| rt.nexthop.as_ref())
                {
                    self.neigh.event_send(n);
                }
                return Ok(dst);
            }
        }

        rt6_log!(self.log, debug, MOD_DCACHE, "stale reference for {daddr}";
            "sernum" => dst.sernum
        );
        self.dst_unlock(dst);
        self.dst_route(daddr, None, flags)
    }

    /// Give back one use of `dst`.
    pub fn dst_unlock(&self, dst: DstRef) {
        let g = self.enter();
        let mut fib = self.fib();
        let id = dst.route.id();

        if let Some(rt) = fib.route_mut(id) {
            if rt.usecnt == 0 {
                rt6_log!(self.log, warn, MOD_DCACHE,
                    "release of unused {}/{}", rt.dst, rt.prefixlen
                );
            } else {
                rt.usecnt -= 1;
            }
            let idle = rt.usecnt == 0;
            if let Some(d) = &mut rt.dest {
                d.usecnt = d.usecnt.saturating_sub(1);
                if idle {
                    d.tstamp = Instant::now();
                    self.bh_mask.fetch_or(BH_GC, Ordering::SeqCst);
                }
            }
            fib.maybe_free(id);
        }
        self.dec_clients();

        drop(fib);
        drop(g);
    }

    /// Record a path MTU learned from a "packet too big" notification.
    pub fn rt6_handle_pmtu(&self, daddr: &Ipv6Addr, pmtu: u32) {
        if pmtu < IPV6_MIN_MTU {
            rt6_log!(self.log, warn, MOD_DCACHE,
                "ignoring path mtu {pmtu} for {daddr}, below minimum"
            );
            return;
        }

        let g = self.enter();
        let mut fib = self.fib();

        let existing = fib.routes_at(daddr, 128).into_iter().find(|r| {
            fib.route(*r)
                .and_then(|rt| rt.dest.as_ref())
                .is_some_and(|d| d.addr == *daddr)
        });

        if let Some(id) = existing {
            if let Some(rt) = fib.route_mut(id) {
                let mtu = rt.dev.as_ref().map(|d| d.mtu).unwrap_or(pmtu);
                if let Some(d) = &mut rt.dest {
                    d.pmtu = pmtu.min(mtu);
                    d.flags |= DestFlags::PMTU;
                }
            }
            rt6_log!(self.log, debug, MOD_DCACHE,
                "path mtu for {daddr} now {pmtu}"
            );
            return;
        }

        let Some(template) = fib.lookup(daddr, RouteFlags::empty(), None) else {
            rt6_log!(self.log, debug, MOD_DCACHE,
                "no route to {daddr} for path mtu update"
            );
            return;
        };
        let usable = fib.route(template).is_some_and(|rt| {
            rt.dev.is_some() && !rt.flags.contains(RouteFlags::REJECT)
        });
        if !usable {
            return;
        }

        match self.clone_route(&mut fib, template, daddr, Some(pmtu), 0) {
            Ok(clone) => self.queue(Request::new(Operation::Add, clone)),
            Err(e) => {
                rt6_log!(self.log, warn, MOD_DCACHE,
                    "path mtu entry for {daddr}: {e}"
                );
            }
        }

        drop(fib);
        drop(g);
    }

    /// Handle a redirect received on `dev` telling us that `dest` is better
    /// reached through `target`, or is itself on link.
    pub fn ipv6_rt_redirect(
        &self,
        dev: &str,
        dest: &Ipv6Addr,
        target: &Ipv6Addr,
        on_link: bool,
    ) -> Result<RouteHandle, Error> {
        let device = self.devices.dev_get(dev).ok_or_else(|| {
            Error::InvalidArgument(format!("no such device {dev}"))
        })?;

        let mut flags =
            RouteFlags::UP | RouteFlags::HOST | RouteFlags::DYNAMIC | RouteFlags::MODIFIED;
        if !on_link {
            flags |= RouteFlags::GATEWAY;
        }

        let g = self.enter();
        let mut fib = self.fib();

        let id = fib
            .lookup(dest, RouteFlags::empty(), None)
            .ok_or(Error::NotFound)?;
        let (metric, host_route) = {
            let rt = fib.route(id).ok_or(Error::NotFound)?;
            if rt.dev_name() != dev {
                rt6_log!(self.log, warn, MOD_DCACHE,
                    "redirect for {dest} received on {dev}, route uses {}",
                    rt.dev_name()
                );
            }
            if rt.nexthop.as_ref().is_some_and(|n| n.addr == *target) {
                rt6_log!(self.log, warn, MOD_DCACHE,
                    "redirect for {dest} to current next hop {target}"
                );
            }
            (
                rt.metric,
                rt.prefixlen == 128 && !rt.flags.contains(RouteFlags::REJECT),
            )
        };

        let handle = if host_route {
            let nexthop = self.neigh.get_neigh(&device, *target);
            let old = fib.route_mut(id).and_then(|rt| {
                rt.flags = (rt.flags - RouteFlags::GATEWAY) | flags;
                rt.gateway = *target;
                rt.dev = Some(device.clone());
                std::mem::replace(&mut rt.nexthop, nexthop)
            });
            if let Some(old) = old {
                self.neigh.dec_neigh(&old);
            }
            fib.touch(id);
            RouteHandle(id)
        } else {
            let mut rt = Rt6Info::new(*dest, 128, metric);
            rt.flags = flags;
            rt.gateway = *target;
            rt.nexthop = self.neigh.get_neigh(&device, *target);
            rt.dev = Some(device.clone());
            let id = fib.alloc_route(rt)?;
            RouteHandle(id)
        };

        let (tx, rx) = channel();
        if !host_route {
            self.queue(Request::with_reply(Operation::Add, handle.0, tx));
        }

        drop(fib);
        drop(g);

        if let Ok(Err(e)) = rx.try_recv() {
            return Err(e);
        }

        rt6_log!(self.log, info, MOD_DCACHE,
            "redirect {dest} via {target} on {dev}";
            "on_link" => on_link
        );
        self.sndmsg(InRtMsg::new(
            RTMSG_NEWROUTE,
            *dest,
            *target,
            128,
            metric,
            dev,
            flags,
        ));
        Ok(handle)
    }

    /// Take one use of `id` on behalf of a forwarding user.
    fn hold(&self, fib: &mut Fib, id: RouteId) {
        if let Some(rt) = fib.route_mut(id) {
            rt.usecnt += 1;
            if let Some(d) = &mut rt.dest {
                d.usecnt += 1;
            }
        }
    }

    /// Allocate an unlinked `/128` cache entry for `daddr` cloned from
    /// `template`.
    fn clone_route(
        &self,
        fib: &mut Fib,
        template: RouteId,
        daddr: &Ipv6Addr,
        pmtu: Option<u32>,
        usecnt: u32,
    ) -> Result<RouteId, Error> {
        let t = fib.route(template).ok_or(Error::NotFound)?;
        let dev: Arc<Device> = t.dev.clone().ok_or_else(|| {
            Error::InvalidArgument("template route has no device".into())
        })?;

        let via = if t.flags.contains(RouteFlags::GATEWAY) {
            t.gateway
        } else {
            *daddr
        };

        let mut rt = Rt6Info::new(*daddr, 128, t.metric);
        rt.flags = (t.flags | RouteFlags::HOST | RouteFlags::DCACHE)
            - RouteFlags::ADDRCONF
            - RouteFlags::ALLONLINK;
        rt.gateway = t.gateway;
        rt.usecnt = usecnt;
        rt.dest = Some(DestCache {
            addr: *daddr,
            usecnt,
            pmtu: pmtu.map(|p| p.min(dev.mtu)).unwrap_or(dev.mtu),
            flags: if pmtu.is_some() {
                DestFlags::PMTU
            } else {
                DestFlags::empty()
            },
            tstamp: Instant::now(),
            template: Some(template),
            template_len: t.prefixlen,
        });
        rt.nexthop = self.neigh.get_neigh(&dev, via);
        rt.dev = Some(dev);

        let id = fib.alloc_route(rt)?;
        rt6_log!(self.log, debug, MOD_DCACHE, "cloned entry for {daddr}";
            "via" => via.to_string()
        );
        Ok(id)
    }
}
