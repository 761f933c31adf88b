// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests for the FIB trie.
//!
//! Prefixes are drawn from a narrow address range so that generated sets
//! overlap, nest and share branch points often.

#[cfg(test)]
mod proptest {
    use crate::addr::{addr_match, prefix_mask};
    use crate::config::Tunables;
    use crate::fib::Fib;
    use crate::neighbor::NeighborCache;
    use crate::types::*;
    use proptest::prelude::*;
    use rt6_common::log::null_logger;
    use std::net::Ipv6Addr;
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy)]
    struct Pfx {
        dst: Ipv6Addr,
        len: u8,
        metric: u32,
    }

    fn fib() -> Fib {
        let log = null_logger();
        Fib::new(
            &Tunables::default(),
            Arc::new(NeighborCache::new(log.clone())),
            log,
        )
    }

    // Addresses that differ only in their top 16 bits and their low 16 bits.
    fn addr_strategy() -> impl Strategy<Value = Ipv6Addr> {
        (any::<u16>(), any::<u16>()).prop_map(|(hi, lo)| {
            Ipv6Addr::from((u128::from(hi) << 112) | u128::from(lo))
        })
    }

    fn len_strategy() -> impl Strategy<Value = u8> {
        prop_oneof![
            4 => 0u8..=20u8,
            1 => 112u8..=128u8,
        ]
    }

    fn prefix_strategy() -> impl Strategy<Value = Pfx> {
        (addr_strategy(), len_strategy(), 0u32..4u32).prop_map(
            |(addr, len, metric)| Pfx {
                dst: prefix_mask(&addr, len),
                len,
                metric,
            },
        )
    }

    fn insert(fib: &mut Fib, p: &Pfx) -> RouteId {
        let id = fib
            .alloc_route(Rt6Info::new(p.dst, p.len, p.metric))
            .expect("alloc");
        fib.add(id).expect("add");
        id
    }

    /// Longest matching prefix, lowest metric among equals.
    fn oracle(set: &[Pfx], addr: &Ipv6Addr) -> Option<(u8, u32)> {
        set.iter()
            .filter(|p| addr_match(&p.dst, addr, p.len))
            .map(|p| (p.len, p.metric))
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
    }

    fn found(fib: &Fib, addr: &Ipv6Addr) -> Option<(u8, u32)> {
        fib.lookup(addr, RouteFlags::empty(), None)
            .and_then(|r| fib.route(r))
            .map(|rt| (rt.prefixlen, rt.metric))
    }

    proptest! {
        /// Property: lookup returns the longest matching prefix, preferring
        /// the lowest metric
        #[test]
        fn prop_longest_prefix_match(
            set in prop::collection::vec(prefix_strategy(), 0..32),
            probes in prop::collection::vec(addr_strategy(), 1..16),
        ) {
            let mut fib = fib();
            for p in &set {
                insert(&mut fib, p);
            }
            prop_assert_eq!(fib.check_invariants(), Ok(()));

            let probes = probes
                .into_iter()
                .chain(set.iter().map(|p| p.dst));
            for addr in probes {
                prop_assert_eq!(
                    found(&fib, &addr),
                    oracle(&set, &addr),
                    "lookup of {}", addr
                );
            }
        }

        /// Property: the trie keeps its shape through any mix of inserts and
        /// deletes, and every split keeps two children
        #[test]
        fn prop_no_orphaned_splits(
            set in prop::collection::vec(prefix_strategy(), 1..32),
            order in prop::collection::vec(any::<prop::sample::Index>(), 1..32),
        ) {
            let mut fib = fib();
            let mut live: Vec<(RouteId, Pfx)> = Vec::new();
            for p in &set {
                live.push((insert(&mut fib, p), *p));
            }

            for idx in order {
                if live.is_empty() {
                    break;
                }
                let (id, _) = live.remove(idx.index(live.len()));
                prop_assert_eq!(fib.del_rt(id), Ok(()));
                prop_assert_eq!(fib.check_invariants(), Ok(()));

                let remaining: Vec<Pfx> = live.iter().map(|(_, p)| *p).collect();
                for p in &set {
                    prop_assert_eq!(found(&fib, &p.dst), oracle(&remaining, &p.dst));
                }
            }

            for (id, _) in live {
                prop_assert_eq!(fib.del_rt(id), Ok(()));
            }
            prop_assert_eq!(fib.check_invariants(), Ok(()));
            prop_assert_eq!(fib.stats(), Rt6Stats::default());
        }

        /// Property: inserting a route and deleting it again leaves lookups
        /// and statistics as they were
        #[test]
        fn prop_insert_delete_round_trip(
            set in prop::collection::vec(prefix_strategy(), 0..24),
            extra in prefix_strategy(),
            probes in prop::collection::vec(addr_strategy(), 1..16),
        ) {
            let mut fib = fib();
            for p in &set {
                insert(&mut fib, p);
            }
            let stats = fib.stats();
            let before: Vec<_> = probes.iter().map(|a| found(&fib, a)).collect();

            let id = insert(&mut fib, &extra);
            prop_assert!(found(&fib, &extra.dst).is_some());
            prop_assert_eq!(fib.del_rt(id), Ok(()));

            let after: Vec<_> = probes.iter().map(|a| found(&fib, a)).collect();
            prop_assert_eq!(before, after);
            prop_assert_eq!(fib.stats(), stats);
            prop_assert_eq!(fib.check_invariants(), Ok(()));
        }

        /// Property: routes at one prefix are kept in ascending metric order
        #[test]
        fn prop_metric_order(
            base in addr_strategy(),
            len in len_strategy(),
            metrics in prop::collection::vec(any::<u32>(), 1..16),
        ) {
            let mut fib = fib();
            let dst = prefix_mask(&base, len);
            for metric in &metrics {
                insert(&mut fib, &Pfx { dst, len, metric: *metric });
            }
            let got: Vec<u32> = fib
                .routes_at(&dst, len)
                .into_iter()
                .filter_map(|r| fib.route(r).map(|rt| rt.metric))
                .collect();
            let mut want = metrics.clone();
            want.sort();
            prop_assert_eq!(got, want);
            prop_assert_eq!(fib.stats().fib_rt_entries, metrics.len());
        }
    }
}
