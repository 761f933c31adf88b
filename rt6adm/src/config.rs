// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON description of a routing table: tunables, devices and the routes to
//! install at startup.

use anyhow::{anyhow, Context, Result};
use rt6::ctl::{InRtMsg, RTMSG_NEWROUTE};
use rt6::device::{Device, DeviceFlags, Devices};
use rt6::neighbor::NeighborCache;
use rt6::{RouteFlags, RoutingTable, Tunables};
use serde::Deserialize;
use slog::{info, Logger};
use std::net::Ipv6Addr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Prefix {
    pub addr: Ipv6Addr,
    pub len: u8,
}

impl FromStr for Prefix {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("prefix {s} has no length"))?;
        let addr = addr.parse().with_context(|| format!("prefix {s}"))?;
        let len: u8 = len.parse().with_context(|| format!("prefix {s}"))?;
        if len > 128 {
            return Err(anyhow!("prefix {s}: length above 128"));
        }
        Ok(Self { addr, len })
    }
}

impl TryFrom<String> for Prefix {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub loopback: bool,
}

fn default_mtu() -> u32 {
    1500
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub prefix: Prefix,
    pub gateway: Option<Ipv6Addr>,
    #[serde(default)]
    pub device: String,
    #[serde(default = "default_metric")]
    pub metric: u32,
    /// Seconds until an autoconfigured route expires.
    pub lifetime: Option<u32>,
    #[serde(default)]
    pub all_on_link: bool,
}

fn default_metric() -> u32 {
    1
}

impl RouteConfig {
    pub fn to_msg(&self) -> InRtMsg {
        let mut flags = RouteFlags::UP;
        if self.gateway.is_some() {
            flags |= RouteFlags::GATEWAY;
        }
        if self.lifetime.is_some() {
            flags |= RouteFlags::ADDRCONF;
        }
        if self.all_on_link {
            flags |= RouteFlags::ALLONLINK;
        }
        let mut msg = InRtMsg::new(
            RTMSG_NEWROUTE,
            self.prefix.addr,
            self.gateway.unwrap_or(Ipv6Addr::UNSPECIFIED),
            self.prefix.len,
            self.metric,
            &self.device,
            flags,
        );
        msg.info = self.lifetime.unwrap_or(0);
        msg
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tunables: Tunables,
    pub devices: Vec<DeviceConfig>,
    pub routes: Vec<RouteConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunables: Tunables::default(),
            devices: vec![DeviceConfig {
                name: "lo".into(),
                mtu: 16384,
                loopback: true,
            }],
            routes: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parse {}", path.display()))
    }

    /// Build a table with the configured devices and install the configured
    /// routes in order, so gateway routes can follow the on-link routes that
    /// reach their gateways.
    pub fn build(&self, log: Logger) -> Result<RoutingTable> {
        let devices = Arc::new(Devices::new());
        for d in &self.devices {
            let mut flags = DeviceFlags::UP;
            if d.loopback {
                flags |= DeviceFlags::LOOPBACK;
            }
            devices.add(Device::new(&d.name, d.mtu, flags));
        }
        let neigh = Arc::new(NeighborCache::new(log.clone()));
        let table =
            RoutingTable::new(self.tunables.clone(), devices, neigh, log.clone());

        for r in &self.routes {
            table.route_add(&r.to_msg()).with_context(|| {
                format!("install {}/{}", r.prefix.addr, r.prefix.len)
            })?;
        }
        info!(log, "table built";
            "devices" => self.devices.len(),
            "routes" => self.routes.len(),
        );
        Ok(table)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use rt6_common::log::null_logger;

    const CONFIG: &str = r#"{
        "tunables": { "dc_watermark": 16 },
        "devices": [
            { "name": "lo", "mtu": 16384, "loopback": true },
            { "name": "eth0" }
        ],
        "routes": [
            { "prefix": "fe80::/64", "device": "eth0", "metric": 256 },
            { "prefix": "::/0", "gateway": "fe80::1" },
            { "prefix": "2001:db8:5::/64", "device": "eth0", "lifetime": 30 }
        ]
    }"#;

    #[test]
    fn prefix_parsing() {
        let p: Prefix = "2001:db8::/32".parse().unwrap();
        assert_eq!(p.len, 32);
        assert!("2001:db8::".parse::<Prefix>().is_err());
        assert!("2001:db8::/129".parse::<Prefix>().is_err());
    }

    #[test]
    fn config_builds_table() {
        let cfg: Config = serde_json::from_str(CONFIG).unwrap();
        assert_eq!(cfg.tunables.dc_watermark, 16);
        assert_eq!(cfg.devices[1].mtu, 1500);

        let table = cfg.build(null_logger()).unwrap();
        let routes = table.routes();
        assert_eq!(routes.len(), 3);
        let default = routes.iter().find(|r| r.prefixlen == 0).unwrap();
        assert_eq!(default.gateway, Some("fe80::1".parse().unwrap()));
        assert_eq!(default.device, "eth0");
        let expiring = routes.iter().find(|r| r.prefixlen == 64 && r.metric == 1);
        assert!(expiring.unwrap().flags().contains(RouteFlags::ADDRCONF));
    }

    #[test]
    fn unreachable_gateway_fails_build() {
        let cfg: Config = serde_json::from_str(
            r#"{ "routes": [ { "prefix": "::/0", "gateway": "fe80::1" } ] }"#,
        )
        .unwrap();
        assert!(cfg.build(null_logger()).is_err());
    }
}
