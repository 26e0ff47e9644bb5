use std::ops::{Index, IndexMut};

use rustc_hash::FxHashMap;
use slab::Slab;

use crate::device::Device;
use crate::wire::DeviceId;

/// Opaque, stable identifier for a device in the registry
///
/// Decouples logical identity from transient network addresses, so references
/// survive a device moving across reconnects. Dead after `DeviceRemoved`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceHandle(#[doc(hidden)] pub usize);

impl From<DeviceHandle> for usize {
    fn from(x: DeviceHandle) -> Self {
        x.0
    }
}

/// Canonical set of known devices
///
/// Confined to the driving thread; logical operations interleave only at the
/// endpoint's single-callback-at-a-time granularity, so no locking is involved.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    devices: Slab<Device>,
    by_serial: FxHashMap<DeviceId, DeviceHandle>,
}

impl Registry {
    pub(crate) fn insert(&mut self, device: Device) -> DeviceHandle {
        debug_assert!(!self.by_serial.contains_key(&device.serial()));
        let serial = device.serial();
        let handle = DeviceHandle(self.devices.insert(device));
        self.by_serial.insert(serial, handle);
        handle
    }

    /// Drop a device. The handle must be live.
    pub(crate) fn remove(&mut self, handle: DeviceHandle) -> Device {
        let device = self.devices.remove(handle.0);
        self.by_serial.remove(&device.serial());
        device
    }

    pub(crate) fn get(&self, handle: DeviceHandle) -> Option<&Device> {
        self.devices.get(handle.0)
    }

    pub(crate) fn get_mut(&mut self, handle: DeviceHandle) -> Option<&mut Device> {
        self.devices.get_mut(handle.0)
    }

    pub(crate) fn handle_of(&self, serial: &DeviceId) -> Option<DeviceHandle> {
        self.by_serial.get(serial).copied()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (DeviceHandle, &Device)> {
        self.devices.iter().map(|(i, d)| (DeviceHandle(i), d))
    }

    /// Snapshot of live handles, safe to hold across mutation
    pub(crate) fn handles(&self) -> Vec<DeviceHandle> {
        self.devices.iter().map(|(i, _)| DeviceHandle(i)).collect()
    }
}

impl Index<DeviceHandle> for Registry {
    type Output = Device;
    fn index(&self, handle: DeviceHandle) -> &Device {
        &self.devices[handle.0]
    }
}

impl IndexMut<DeviceHandle> for Registry {
    fn index_mut(&mut self, handle: DeviceHandle) -> &mut Device {
        &mut self.devices[handle.0]
    }
}
