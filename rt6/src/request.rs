// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deferred trie mutation.
//!
//! Callers that must not mutate the trie directly queue a [`Request`]. The
//! queue is drained in FIFO order by the bottom half, which only runs once no
//! table operation holds the guard.

use crate::error::Error;
use crate::log::rt6_log;
use crate::table::RoutingTable;
use crate::types::RouteId;
use crate::MOD_FIB;
use rt6_common::lock;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::time::Instant;

/// Requests are waiting in the queue.
pub const BH_REQUEST: u8 = 0x1;

/// A cache entry went idle and a collection pass may reclaim something.
pub const BH_GC: u8 = 0x2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Del,
}

#[derive(Debug)]
pub struct Request {
    pub op: Operation,
    pub route: RouteId,
    /// Receives the outcome once the request has been applied.
    pub reply: Option<Sender<Result<(), Error>>>,
}

impl Request {
    pub fn new(op: Operation, route: RouteId) -> Self {
        Self {
            op,
            route,
            reply: None,
        }
    }

    pub fn with_reply(
        op: Operation,
        route: RouteId,
        reply: Sender<Result<(), Error>>,
    ) -> Self {
        Self {
            op,
            route,
            reply: Some(reply),
        }
    }
}

impl RoutingTable {
    /// Queue a mutation for the bottom half.
    pub fn queue(&self, req: Request) {
        // The receiver lives as long as the table, so this cannot fail.
        let _ = self.tx.send(req);
        self.bh_mask.fetch_or(BH_REQUEST, Ordering::SeqCst);
    }

    pub fn requests_pending(&self) -> bool {
        self.bh_mask.load(Ordering::SeqCst) & BH_REQUEST != 0
    }

    /// Run deferred work if nothing holds the guard.
    pub fn run_bh(&self) {
        if self.guard.load(Ordering::SeqCst) != 0 {
            return;
        }
        let mask = self.bh_mask.swap(0, Ordering::SeqCst);

        if mask & BH_REQUEST != 0 {
            self.drain_requests();
        }

        if mask & BH_GC != 0 {
            if self.clients.load(Ordering::SeqCst) == 0 {
                self.collect_garbage(Instant::now());
            } else {
                self.bh_mask.fetch_or(BH_GC, Ordering::SeqCst);
            }
        }
    }

    fn drain_requests(&self) {
        let rx = lock!(self.rx);
        let mut fib = lock!(self.fib);
        while let Ok(req) = rx.try_recv() {
            let result = match req.op {
                Operation::Add => {
                    let r = fib.add(req.route);
                    if r.is_err() {
                        fib.maybe_free(req.route);
                    }
                    r
                }
                Operation::Del => fib.del_rt(req.route),
            };
            if let Err(e) = &result {
                rt6_log!(self.log, warn, MOD_FIB,
                    "{:?} request for {:?} failed: {e}", req.op, req.route
                );
            }
            if let Some(reply) = req.reply {
                let _ = reply.send(result);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::request::{Operation, Request};
    use crate::test::{route, table};
    use crate::types::RouteFlags;
    use std::sync::mpsc::channel;

    #[test]
    fn requests_apply_in_order() {
        let t = table("request_order.log");
        let (tx, rx) = channel();
        let id = {
            let mut fib = t.fib();
            fib.alloc_route(route("2001:db8::/32", 1)).unwrap()
        };

        {
            // Held guard defers both requests.
            let _g = t.enter();
            t.queue(Request::with_reply(Operation::Add, id, tx.clone()));
            t.queue(Request::with_reply(Operation::Del, id, tx));
            assert!(t.requests_pending());
            assert_eq!(t.stats().fib_rt_entries, 0);
        }

        assert!(!t.requests_pending());
        assert_eq!(rx.recv().unwrap(), Ok(()));
        assert_eq!(rx.recv().unwrap(), Ok(()));
        assert_eq!(t.stats().fib_rt_entries, 0);
        assert_eq!(t.stats().fib_rt_alloc, 0);
        assert!(t
            .lookup(&"2001:db8::1".parse().unwrap(), RouteFlags::empty())
            .is_none());
    }
}
