// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Text dumps of the table in the classic fixed-width format.

use crate::fib::Fib;
use crate::table::RoutingTable;
use crate::types::*;
use std::fmt::Write;
use std::net::Ipv6Addr;

/// Length of one route record, newline included.
pub const RT6_INFO_LEN: usize = 92;

fn hex_addr(addr: &Ipv6Addr) -> String {
    format!("{:032x}", u128::from(*addr))
}

fn record(fib: &Fib, id: RouteId, out: &mut String) {
    let Some(rt) = fib.route(id) else {
        return;
    };
    let nexthop = rt
        .nexthop
        .as_ref()
        .map(|n| n.addr)
        .unwrap_or(Ipv6Addr::UNSPECIFIED);
    let dev: String = rt.dev_name().chars().take(8).collect();
    let _ = writeln!(
        out,
        "{} {:02x} {} {:02x} {:02x} {:02x} {:04x} {:>8}",
        hex_addr(&rt.dst),
        rt.prefixlen,
        hex_addr(&nexthop),
        rt.metric.min(0xff),
        rt.usecnt.min(0xff),
        rt.refcnt.min(0xff),
        rt.flags.bits() & 0xffff,
        dev,
    );
}

impl RoutingTable {
    /// The window `[offset, offset + length)` of the route dump.
    pub fn rt6_get_info(&self, offset: usize, length: usize) -> String {
        let fib = self.fib();
        let routes = fib.linked_routes();

        // Records are fixed width, so whole records before the window are
        // skipped without formatting them.
        let first = offset / RT6_INFO_LEN;
        let stop = offset.saturating_add(length);
        let mut out = String::new();
        for id in routes.into_iter().skip(first) {
            if out.len().saturating_add(first * RT6_INFO_LEN) >= stop {
                break;
            }
            record(&fib, id, &mut out);
        }

        let start = offset - first * RT6_INFO_LEN;
        let end = start.saturating_add(length).min(out.len());
        out.get(start.min(end)..end).unwrap_or_default().to_string()
    }

    pub fn rt6_get_stats(&self) -> String {
        let s = self.stats();
        format!(
            "{:04x} {:04x} {:04x} {:04x} {:04x}\n",
            s.fib_nodes,
            s.fib_route_nodes,
            s.fib_rt_alloc,
            s.fib_rt_entries,
            s.fib_dc_alloc,
        )
    }
}
