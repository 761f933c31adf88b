// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The slice of the device layer the routing table consumes.

use bitflags::bitflags;
use rt6_common::{read_lock, write_lock};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceFlags: u32 {
        const UP = 0x1;
        const LOOPBACK = 0x8;
        const NOARP = 0x80;
    }
}

/// A network interface. Routes hold non-owning references to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub mtu: u32,
    pub flags: DeviceFlags,
}

impl Device {
    pub fn new(name: &str, mtu: u32, flags: DeviceFlags) -> Self {
        Self {
            name: name.to_string(),
            mtu,
            flags,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.flags.contains(DeviceFlags::LOOPBACK)
    }

    /// Whether next hops on this device need link-layer address resolution.
    pub fn resolves_neighbors(&self) -> bool {
        !self.flags.intersects(DeviceFlags::LOOPBACK | DeviceFlags::NOARP)
    }
}

/// Device lookup by name.
pub trait DeviceRegistry: Send + Sync {
    fn dev_get(&self, name: &str) -> Option<Arc<Device>>;
}

/// An in-memory device registry.
#[derive(Debug, Default)]
pub struct Devices {
    devs: RwLock<BTreeMap<String, Arc<Device>>>,
}

impl Devices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, dev: Device) -> Arc<Device> {
        let dev = Arc::new(dev);
        write_lock!(self.devs).insert(dev.name.clone(), dev.clone());
        dev
    }

}

impl DeviceRegistry for Devices {
    fn dev_get(&self, name: &str) -> Option<Arc<Device>> {
        read_lock!(self.devs).get(name).cloned()
    }
}
