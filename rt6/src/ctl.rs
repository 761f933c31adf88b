// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Administrative control: the ioctl style add/delete surface and the route
//! message bus.
//!
//! Route messages are fixed size records in network byte order.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +                  Destination (16 octets)                      +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +                    Gateway (16 octets)                        +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             Type                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Prefix Length         |            Metric             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             Info                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             Flags                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +             Device name (16 octets, NUL padded)               +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::addr::{prefix_mask, ADDR_BITS};
use crate::error::Error;
use crate::fib::DelKey;
use crate::log::rt6_log;
use crate::request::{Operation, Request};
use crate::table::RoutingTable;
use crate::types::*;
use crate::MOD_CTL;
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, be_u32},
    IResult,
};
use num_enum::TryFromPrimitive;
use std::net::Ipv6Addr;
use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};

/// Size of one route message on the wire.
pub const IN6_RTMSG_LEN: usize = 64;

/// Longest device name carried by a route message, leaving room for a NUL.
pub const DEVICE_NAME_MAX: usize = 15;

pub const RTMSG_NEWROUTE: u32 = 0x21;
pub const RTMSG_DELROUTE: u32 = 0x22;

pub const SIOCADDRT: u32 = 0x890B;
pub const SIOCDELRT: u32 = 0x890C;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum RtMsgType {
    NewRoute = 0x21,
    DelRoute = 0x22,
}

/// The privileges of an administrative caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credentials {
    pub net_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InRtMsg {
    pub dst: Ipv6Addr,
    pub gateway: Ipv6Addr,
    pub typ: u32,
    pub prefixlen: u16,
    pub metric: u16,
    /// Lifetime in seconds for autoconfigured routes.
    pub info: u32,
    pub flags: u32,
    pub device: String,
}

impl InRtMsg {
    pub fn new(
        typ: u32,
        dst: Ipv6Addr,
        gateway: Ipv6Addr,
        prefixlen: u8,
        metric: u32,
        device: &str,
        flags: RouteFlags,
    ) -> Self {
        Self {
            dst,
            gateway,
            typ,
            prefixlen: prefixlen.into(),
            metric: metric.min(u16::MAX.into()) as u16,
            info: 0,
            flags: flags.bits(),
            device: device.to_string(),
        }
    }

    pub fn flags(&self) -> RouteFlags {
        RouteFlags::from_bits_truncate(self.flags)
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(IN6_RTMSG_LEN);
        buf.extend_from_slice(&self.dst.octets());
        buf.extend_from_slice(&self.gateway.octets());
        buf.extend_from_slice(&self.typ.to_be_bytes());
        buf.extend_from_slice(&self.prefixlen.to_be_bytes());
        buf.extend_from_slice(&self.metric.to_be_bytes());
        buf.extend_from_slice(&self.info.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        let mut name = [0u8; DEVICE_NAME_MAX + 1];
        let n = self.device.len().min(DEVICE_NAME_MAX);
        name[..n].copy_from_slice(&self.device.as_bytes()[..n]);
        buf.extend_from_slice(&name);
        buf
    }

    pub fn from_wire(input: &[u8]) -> Result<InRtMsg, Error> {
        if input.len() < IN6_RTMSG_LEN {
            return Err(Error::Decode {
                consumed: 0,
                reason: format!(
                    "truncated route message: {} of {IN6_RTMSG_LEN} bytes",
                    input.len()
                ),
            });
        }
        let (_, msg) = parse_msg(input).map_err(|e| Error::Decode {
            consumed: 0,
            reason: e.to_string(),
        })?;
        Ok(msg)
    }
}

fn addr16(b: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(b);
    Ipv6Addr::from(octets)
}

fn parse_msg(input: &[u8]) -> IResult<&[u8], InRtMsg> {
    let (input, dst) = take(16usize)(input)?;
    let (input, gateway) = take(16usize)(input)?;
    let (input, typ) = be_u32(input)?;
    let (input, prefixlen) = be_u16(input)?;
    let (input, metric) = be_u16(input)?;
    let (input, info) = be_u32(input)?;
    let (input, flags) = be_u32(input)?;
    let (input, name) = take(DEVICE_NAME_MAX + 1)(input)?;
    let end = name.iter().position(|b| *b == 0).unwrap_or(name.len());
    Ok((
        input,
        InRtMsg {
            dst: addr16(dst),
            gateway: addr16(gateway),
            typ,
            prefixlen,
            metric,
            info,
            flags,
            device: String::from_utf8_lossy(&name[..end]).into_owned(),
        },
    ))
}

impl RoutingTable {
    /// The ioctl entry point.
    pub fn route_ioctl(
        &self,
        cred: &Credentials,
        cmd: u32,
        payload: &[u8],
    ) -> Result<(), Error> {
        if cmd != SIOCADDRT && cmd != SIOCDELRT {
            return Err(Error::NotSupported(cmd));
        }
        if !cred.net_admin {
            return Err(Error::PermissionDenied);
        }
        let msg = InRtMsg::from_wire(payload)?;
        if cmd == SIOCADDRT {
            self.route_add(&msg).map(|_| ())
        } else {
            self.route_del(&msg)
        }
    }

    /// Add a configured route.
    pub fn route_add(&self, msg: &InRtMsg) -> Result<RouteHandle, Error> {
        if msg.prefixlen > u16::from(ADDR_BITS) {
            return Err(Error::InvalidArgument(format!(
                "prefix length {} out of range",
                msg.prefixlen
            )));
        }
        let plen = msg.prefixlen as u8;
        let mut flags = (msg.flags() | RouteFlags::UP) - RouteFlags::DCACHE;
        if plen == ADDR_BITS {
            flags |= RouteFlags::HOST;
        }

        let mut dev = match msg.device.as_str() {
            "" => None,
            name => Some(self.devices.dev_get(name).ok_or_else(|| {
                Error::InvalidArgument(format!("no such device {name}"))
            })?),
        };

        let mut rt =
            Rt6Info::new(prefix_mask(&msg.dst, plen), plen, msg.metric.into());

        let g = self.enter();
        let mut fib = self.fib();

        if flags.contains(RouteFlags::GATEWAY) {
            let gw = msg.gateway;
            let via = fib
                .lookup(&gw, RouteFlags::GATEWAY | RouteFlags::REJECT, None)
                .and_then(|r| fib.route(r))
                .ok_or(Error::HostUnreachable(gw))?;
            if let Some(d) = &dev {
                if via.dev_name() != d.name {
                    rt6_log!(self.log, warn, MOD_CTL,
                        "gateway {gw} is reached through {}, not {}",
                        via.dev_name(),
                        d.name
                    );
                }
            }
            dev = via.dev.clone();
            let d = dev.as_ref().ok_or_else(|| {
                Error::InvalidArgument(format!("gateway {gw} has no device"))
            })?;
            rt.gateway = gw;
            rt.nexthop = self.neigh.get_neigh(d, gw);
        }
        let Some(dev) = dev else {
            return Err(Error::InvalidArgument("no device for route".into()));
        };

        if flags.contains(RouteFlags::ADDRCONF) {
            rt.expires =
                Some(Instant::now() + Duration::from_secs(msg.info.into()));
        }
        rt.flags = flags;
        rt.dev = Some(dev);

        let id = fib.alloc_route(rt)?;
        let (tx, rx) = channel();
        self.queue(Request::with_reply(Operation::Add, id, tx));

        drop(fib);
        drop(g);

        applied(rx)?;
        rt6_log!(self.log, info, MOD_CTL,
            "added {}/{plen} dev {}", msg.dst, msg.device;
            "metric" => msg.metric
        );
        Ok(RouteHandle(id))
    }

    /// Delete the configured route at exactly `msg.dst/msg.prefixlen`,
    /// narrowed by gateway or device when the message names one.
    pub fn route_del(&self, msg: &InRtMsg) -> Result<(), Error> {
        if msg.prefixlen > u16::from(ADDR_BITS) {
            return Err(Error::NotFound);
        }
        let plen = msg.prefixlen as u8;
        let key = if msg.flags().contains(RouteFlags::GATEWAY) {
            DelKey::Gateway(msg.gateway)
        } else if !msg.device.is_empty() {
            DelKey::Device(msg.device.clone())
        } else {
            DelKey::Any
        };

        let g = self.enter();
        let fib = self.fib();
        let id = fib
            .locate(&prefix_mask(&msg.dst, plen), plen, &key)
            .ok_or(Error::NotFound)?;
        let (tx, rx) = channel();
        self.queue(Request::with_reply(Operation::Del, id, tx));

        drop(fib);
        drop(g);

        applied(rx)?;
        rt6_log!(self.log, info, MOD_CTL, "deleted {}/{plen}", msg.dst);
        Ok(())
    }

    /// Delete a route by identity.
    pub fn route_remove(&self, handle: RouteHandle) -> Result<(), Error> {
        let g = self.enter();
        let fib = self.fib();
        if fib.route(handle.0).and_then(|rt| rt.fib_node).is_none() {
            return Err(Error::NotFound);
        }
        let (tx, rx) = channel();
        self.queue(Request::with_reply(Operation::Del, handle.0, tx));

        drop(fib);
        drop(g);
        applied(rx)
    }

    /// Apply a buffer of back to back route messages and return the number of
    /// bytes consumed. A record that fails to apply is logged and skipped. A
    /// truncated record or an unknown type stops processing; records before
    /// it stay applied.
    pub fn msgrcv(&self, buf: &[u8]) -> Result<usize, Error> {
        let mut consumed = 0;
        while consumed < buf.len() {
            let msg = InRtMsg::from_wire(&buf[consumed..]).map_err(|e| {
                let reason = match e {
                    Error::Decode { reason, .. } => reason,
                    e => e.to_string(),
                };
                Error::Decode { consumed, reason }
            })?;

            let result = match RtMsgType::try_from(msg.typ) {
                Ok(RtMsgType::NewRoute) => self.route_add(&msg).map(|_| ()),
                Ok(RtMsgType::DelRoute) => self.route_del(&msg),
                Err(_) => {
                    return Err(Error::Decode {
                        consumed,
                        reason: format!("unknown message type {:#x}", msg.typ),
                    })
                }
            };
            if let Err(e) = result {
                rt6_log!(self.log, warn, MOD_CTL,
                    "route message for {}/{} failed: {e}",
                    msg.dst,
                    msg.prefixlen;
                    "consumed" => consumed
                );
            }
            consumed += IN6_RTMSG_LEN;
        }
        Ok(consumed)
    }

    /// Post a route message to every watcher.
    pub fn sndmsg(&self, msg: InRtMsg) {
        self.notify(msg);
    }
}

/// The outcome of a request queued with a reply channel. A request that is
/// still queued because another operation holds the guard counts as
/// accepted.
fn applied(rx: Receiver<Result<(), Error>>) -> Result<(), Error> {
    rx.try_recv().unwrap_or(Ok(()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::{add_gateway_route, add_route, msg, table};
    use pretty_assertions::assert_eq;

    #[test]
    fn wire_layout() {
        let mut m = msg("2001:db8::/48", "eth0", 7);
        m.gateway = "fe80::1".parse().unwrap();
        m.info = 0x01020304;
        let buf = m.to_wire();
        assert_eq!(buf.len(), IN6_RTMSG_LEN);
        assert_eq!(&buf[0..4], &[0x20, 0x01, 0x0d, 0xb8]);
        assert_eq!(&buf[16..18], &[0xfe, 0x80]);
        assert_eq!(&buf[32..36], &RTMSG_NEWROUTE.to_be_bytes());
        assert_eq!(&buf[36..38], &[0, 48]);
        assert_eq!(&buf[38..40], &[0, 7]);
        assert_eq!(&buf[40..44], &[1, 2, 3, 4]);
        assert_eq!(&buf[48..53], b"eth0\0");
        assert_eq!(InRtMsg::from_wire(&buf).unwrap(), m);
    }

    #[test]
    fn ioctl_requires_privilege() {
        let t = table("ctl_ioctl.log");
        let payload = msg("2001:db8::/32", "eth0", 1).to_wire();
        let user = Credentials { net_admin: false };
        let admin = Credentials { net_admin: true };

        assert_eq!(
            t.route_ioctl(&user, SIOCADDRT, &payload),
            Err(Error::PermissionDenied)
        );
        assert_eq!(
            t.route_ioctl(&admin, 0x8912, &payload),
            Err(Error::NotSupported(0x8912))
        );
        assert_eq!(t.stats().fib_rt_entries, 0);
        assert_eq!(Error::PermissionDenied.errno(), 1);
        assert_eq!(Error::NotSupported(0x8912).errno(), 95);

        t.route_ioctl(&admin, SIOCADDRT, &payload).unwrap();
        assert_eq!(t.stats().fib_rt_entries, 1);
        t.route_ioctl(&admin, SIOCDELRT, &payload).unwrap();
        assert_eq!(t.stats().fib_rt_entries, 0);
    }

    #[test]
    fn add_validation() {
        let t = table("ctl_add.log");

        let mut m = msg("2001:db8::/32", "", 1);
        assert!(matches!(t.route_add(&m), Err(Error::InvalidArgument(_))));

        m.device = "nope0".into();
        assert!(matches!(t.route_add(&m), Err(Error::InvalidArgument(_))));

        m.device = "eth0".into();
        m.prefixlen = 129;
        assert!(matches!(t.route_add(&m), Err(Error::InvalidArgument(_))));

        let gw: Ipv6Addr = "fe80::1".parse().unwrap();
        let mut m = msg("::/0", "", 1);
        m.flags |= RouteFlags::GATEWAY.bits();
        m.gateway = gw;
        assert_eq!(t.route_add(&m), Err(Error::HostUnreachable(gw)));
        assert_eq!(t.stats().fib_rt_alloc, 0);
    }

    #[test]
    fn add_masks_host_bits() {
        let t = table("ctl_mask.log");
        t.route_add(&msg("2001:db8:ffff::1/32", "eth0", 1)).unwrap();
        let routes = t.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dst, "2001:db8::".parse::<Ipv6Addr>().unwrap());

        t.route_add(&msg("2001:db8::1/128", "eth0", 1)).unwrap();
        let host = t.routes_at(&"2001:db8::1".parse().unwrap(), 128);
        assert!(host[0].flags().contains(RouteFlags::HOST));
    }

    #[test]
    fn gateway_default_route() {
        let t = table("ctl_default.log");
        add_route(&t, "fe80::/64", "eth0", 256);
        add_gateway_route(&t, "::/0", "fe80::1", 1);

        let rt = t
            .lookup(&"3fff::1".parse().unwrap(), RouteFlags::empty())
            .unwrap();
        assert_eq!(rt.prefixlen, 0);
        assert_eq!(rt.device, "eth0");
        assert_eq!(rt.gateway, Some("fe80::1".parse().unwrap()));
        assert_eq!(rt.nexthop, Some("fe80::1".parse().unwrap()));
    }

    #[test]
    fn delete_of_missing_route_changes_nothing() {
        let t = table("ctl_del_missing.log");
        add_route(&t, "2001:db8::/32", "eth0", 1);
        let before = t.stats();

        let m = msg("2001:db8::/48", "", 1);
        assert_eq!(t.route_del(&m), Err(Error::NotFound));
        assert_eq!(t.stats(), before);

        // Wrong device.
        let m = msg("2001:db8::/32", "eth1", 1);
        assert_eq!(t.route_del(&m), Err(Error::NotFound));
        assert_eq!(t.stats(), before);
    }

    #[test]
    fn delete_by_gateway_picks_matching_route() {
        let t = table("ctl_del_gw.log");
        add_route(&t, "fe80::/64", "eth0", 256);
        add_gateway_route(&t, "2001:db8::/32", "fe80::1", 1);
        add_gateway_route(&t, "2001:db8::/32", "fe80::2", 2);

        let mut m = msg("2001:db8::/32", "", 0);
        m.flags |= RouteFlags::GATEWAY.bits();
        m.gateway = "fe80::2".parse().unwrap();
        t.route_del(&m).unwrap();

        let left = t.routes_at(&"2001:db8::".parse().unwrap(), 32);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].gateway, Some("fe80::1".parse().unwrap()));
    }

    #[test]
    fn msgrcv_applies_until_bad_record() {
        let t = table("ctl_msgrcv.log");
        let mut buf = Vec::new();
        buf.extend(msg("2001:db8:1::/48", "eth0", 1).to_wire());
        // Fails to apply and is skipped.
        buf.extend(msg("2001:db8:2::/48", "nope0", 1).to_wire());
        buf.extend(msg("2001:db8:3::/48", "eth0", 1).to_wire());
        let mut bad = msg("2001:db8:4::/48", "eth0", 1);
        bad.typ = 0x99;
        buf.extend(bad.to_wire());
        buf.extend(msg("2001:db8:5::/48", "eth0", 1).to_wire());

        match t.msgrcv(&buf) {
            Err(Error::Decode { consumed, .. }) => {
                assert_eq!(consumed, 3 * IN6_RTMSG_LEN)
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(t.stats().fib_rt_entries, 2);
        assert!(t
            .lookup(&"2001:db8:5::1".parse().unwrap(), RouteFlags::empty())
            .is_none());
    }

    #[test]
    fn msgrcv_truncated_tail() {
        let t = table("ctl_truncated.log");
        let mut buf = msg("2001:db8:1::/48", "eth0", 1).to_wire();
        let mut del = msg("2001:db8:1::/48", "", 1);
        del.typ = RTMSG_DELROUTE;
        buf.extend(del.to_wire());
        buf.extend([0u8; 10]);

        assert!(matches!(
            t.msgrcv(&buf),
            Err(Error::Decode { consumed: 128, .. })
        ));
        assert_eq!(t.stats().fib_rt_entries, 0);
        assert_eq!(t.msgrcv(&[]), Ok(0));
    }

    #[test]
    fn add_under_held_guard_is_accepted_then_applied() {
        let t = table("ctl_deferred.log");
        let handle = {
            let _g = t.enter();
            let h = add_route(&t, "2001:db8::/48", "eth0", 1);
            assert!(t.requests_pending());
            assert_eq!(t.stats().fib_rt_entries, 0);
            assert!(t.route_handle_info(h).is_some());
            h
        };
        assert!(!t.requests_pending());
        assert_eq!(t.stats().fib_rt_entries, 1);
        let r = t.lookup(&"2001:db8::1".parse().unwrap(), RouteFlags::empty());
        assert_eq!(r.map(|r| r.prefixlen), Some(48));
        t.route_remove(handle).unwrap();
        assert_eq!(t.stats().fib_rt_alloc, 0);
    }
}
