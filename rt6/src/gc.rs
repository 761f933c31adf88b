// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reclaiming idle destination-cache entries and expiring autoconfigured
//! routes.

use crate::ctl::{InRtMsg, RTMSG_DELROUTE};
use crate::fib::GcReport;
use crate::log::rt6_log;
use crate::table::RoutingTable;
use crate::MOD_GC;
use rt6_common::thread::ManagedThread;
use std::net::Ipv6Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

/// How often the timer thread checks for shutdown between ticks.
const GC_RESOLUTION: Duration = Duration::from_millis(50);

impl RoutingTable {
    /// One collection pass. The idle threshold shrinks once the number of
    /// cache entries reaches the watermark.
    pub fn collect_garbage(&self, now: Instant) -> GcReport {
        let report = {
            let mut fib = self.fib();
            let timeout = self.tunables.idle_timeout(fib.stats().fib_dc_alloc);
            fib.gc(now, timeout)
        };

        for rt in &report.expired {
            rt6_log!(self.log, info, MOD_GC,
                "autoconfigured route {}/{} expired", rt.dst, rt.prefixlen
            );
            self.sndmsg(InRtMsg::new(
                RTMSG_DELROUTE,
                rt.dst,
                rt.gateway.unwrap_or(Ipv6Addr::UNSPECIFIED),
                rt.prefixlen,
                rt.metric,
                &rt.device,
                rt.flags(),
            ));
        }

        if report.reclaimed > 0 || report.compacted > 0 {
            rt6_log!(self.log, debug, MOD_GC, "collection pass";
                "reclaimed" => report.reclaimed,
                "compacted" => report.compacted,
                "timeout_ms" => report.timeout.as_millis() as u64
            );
        }
        report
    }

    /// Periodic work. Nothing happens while a table operation is in progress,
    /// or while forwarding users hold references and no request is waiting.
    pub fn timer_tick(&self, now: Instant) -> Option<GcReport> {
        if self.guard.load(Ordering::SeqCst) != 0 {
            return None;
        }
        if self.clients() != 0 && !self.requests_pending() {
            return None;
        }
        self.run_bh();
        Some(self.collect_garbage(now))
    }
}

/// Drives [`RoutingTable::timer_tick`] from a background thread. The thread
/// is stopped when the timer is dropped.
pub struct GcTimer {
    thread: ManagedThread,
}

impl GcTimer {
    pub fn start(table: Arc<RoutingTable>) -> std::io::Result<Self> {
        let interval = table.tunables().gc_interval();
        let thread = ManagedThread::spawn("rt6-gc", move |shutdown| {
            let mut next = Instant::now() + interval;
            while !shutdown.load(Ordering::Relaxed) {
                let now = Instant::now();
                if now >= next {
                    table.timer_tick(now);
                    next = now + interval;
                }
                sleep(GC_RESOLUTION.min(interval));
            }
        })?;
        Ok(Self { thread })
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_running()
    }

    pub fn stop(&self) {
        self.thread.stop();
    }
}

#[cfg(test)]
mod test {
    use super::GcTimer;
    use crate::config::Tunables;
    use crate::ctl::RTMSG_DELROUTE;
    use crate::test::{add_route, table, table_with};
    use crate::types::*;
    use pretty_assertions::assert_eq;
    use rt6_common::wait_for_eq;
    use std::net::Ipv6Addr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn idle_entry(t: &crate::RoutingTable, daddr: &str) -> DstRef {
        let daddr: Ipv6Addr = daddr.parse().unwrap();
        let dst = t.dst_route(&daddr, None, RouteFlags::empty()).unwrap();
        t.dst_unlock(dst);
        dst
    }

    #[test]
    fn idle_entry_kept_until_timeout() {
        let t = table("gc_timeout.log");
        add_route(&t, "2001:db8::/64", "eth0", 1);
        let dst = idle_entry(&t, "2001:db8::1");
        let start = Instant::now();

        let r = t.collect_garbage(start + Duration::from_secs(10));
        assert_eq!(r.timeout, Duration::from_secs(15));
        assert_eq!(r.reclaimed, 0);
        assert!(t.route_info(dst.route).is_some());

        let r = t.collect_garbage(start + Duration::from_secs(16));
        assert_eq!(r.reclaimed, 1);
        assert!(t.route_info(dst.route).is_none());
        assert_eq!(t.stats().fib_dc_alloc, 0);
        assert_eq!(t.stats().fib_rt_entries, 1);
        t.check_invariants().unwrap();
    }

    #[test]
    fn held_entry_is_never_reclaimed() {
        let t = table("gc_held.log");
        add_route(&t, "2001:db8::/64", "eth0", 1);
        let daddr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst = t.dst_route(&daddr, None, RouteFlags::empty()).unwrap();

        let r = t.collect_garbage(Instant::now() + Duration::from_secs(3600));
        assert_eq!(r.reclaimed, 0);
        assert_eq!(t.route_info(dst.route).unwrap().usecnt, 1);
        t.dst_unlock(dst);
    }

    #[test]
    fn watermark_shortens_timeout() {
        let t = table_with(
            "gc_watermark.log",
            Tunables {
                dc_watermark: 2,
                ..Default::default()
            },
        );
        add_route(&t, "2001:db8::/64", "eth0", 1);
        idle_entry(&t, "2001:db8::1");
        let start = Instant::now();

        let r = t.collect_garbage(start + Duration::from_secs(6));
        assert_eq!(r.timeout, Duration::from_secs(15));
        assert_eq!(r.reclaimed, 0);

        idle_entry(&t, "2001:db8::2");
        let r = t.collect_garbage(start + Duration::from_secs(6));
        assert_eq!(r.timeout, Duration::from_secs(5));
        assert_eq!(r.reclaimed, 2);
    }

    #[test]
    fn addrconf_route_expires() {
        let t = table("gc_addrconf.log");
        let (tx, rx) = std::sync::mpsc::channel();
        t.watch("test".into(), tx);
        let mut msg = crate::test::msg("2001:db8:5::/64", "eth0", 1);
        msg.flags |= RouteFlags::ADDRCONF.bits();
        msg.info = 30;
        t.route_add(&msg).unwrap();

        let r = t.collect_garbage(Instant::now() + Duration::from_secs(10));
        assert!(r.expired.is_empty());

        let r = t.collect_garbage(Instant::now() + Duration::from_secs(31));
        assert_eq!(r.expired.len(), 1);
        assert_eq!(t.stats().fib_rt_entries, 0);
        let note = rx.try_recv().unwrap();
        assert_eq!(note.typ, RTMSG_DELROUTE);
        assert_eq!(note.prefixlen, 64);
    }

    #[test]
    fn tick_defers_while_clients_active() {
        let t = table("gc_tick.log");
        add_route(&t, "2001:db8::/64", "eth0", 1);
        let daddr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst = t.dst_route(&daddr, None, RouteFlags::empty()).unwrap();
        assert!(t.timer_tick(Instant::now()).is_none());

        {
            let _g = t.enter();
            assert!(t.timer_tick(Instant::now()).is_none());
        }

        t.dst_unlock(dst);
        assert!(t.timer_tick(Instant::now()).is_some());
    }

    #[test]
    fn timer_thread_reclaims() {
        let t = Arc::new(table_with(
            "gc_timer.log",
            Tunables {
                dc_short_timeout_ms: 10,
                dc_long_timeout_ms: 10,
                gc_interval_ms: Some(10),
                ..Default::default()
            },
        ));
        add_route(&t, "2001:db8::/64", "eth0", 1);
        idle_entry(&t, "2001:db8::1");
        assert_eq!(t.stats().fib_dc_alloc, 1);

        let timer = GcTimer::start(t.clone()).unwrap();
        wait_for_eq!(t.stats().fib_dc_alloc, 0);
        assert!(timer.is_running());
        timer.stop();
        assert!(!timer.is_running());
    }
}
