//! Chipset framework: device registration and I/O dispatch
//!
//! Two-phase construction: devices are registered by name into a
//! [`ChipsetBuilder`], which records their port/MMIO claims and rejects
//! overlaps; `build()` returns an immutable [`Chipset`] with O(1) port
//! lookup, binary-search MMIO lookup, and a poll list. The hypervisor exit
//! dispatcher calls `handle_pio`/`handle_mmio`; the poll thread calls
//! `poll`.

pub mod device;
pub mod irq;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::debug;
use vm_memory::GuestMemoryMmap;

use crate::error::{DeviceError, DeviceResult};
use crate::{Error, Result};

pub use device::{Device, DtNode, MmioRange, PortRange};
pub use irq::{IrqLine, IrqRouter, LineSet, Trigger, VectorInjector};

/// A device registered into the chipset, shared with IRQ threads and the
/// poll thread. The mutex is held for the duration of a single access.
pub type SharedDevice = Arc<Mutex<dyn Device>>;

struct Registered {
    name: String,
    device: SharedDevice,
    ports: Vec<PortRange>,
    mmio: Vec<MmioRange>,
    polls: bool,
    kind: &'static str,
}

/// Builder half of the two-phase chipset lifecycle.
pub struct ChipsetBuilder {
    devices: Vec<Registered>,
    lines: Arc<LineSet>,
}

impl Default for ChipsetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChipsetBuilder {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            lines: Arc::new(LineSet::new()),
        }
    }

    /// The interrupt fabric shared by this chipset. Allocate lines from it
    /// before constructing devices that raise IRQs.
    pub fn lines(&self) -> Arc<LineSet> {
        self.lines.clone()
    }

    /// Register a device under a unique name. Capabilities (port ranges,
    /// MMIO regions, poll ticks) are inspected here, once.
    pub fn register_device(&mut self, name: &str, device: SharedDevice) -> Result<()> {
        if self.devices.iter().any(|d| d.name == name) {
            return Err(Error::InvalidConfig(format!(
                "duplicate device name {:?}",
                name
            )));
        }
        let (ports, mmio, polls, kind) = {
            let dev = device.lock().unwrap();
            (
                dev.port_ranges(),
                dev.mmio_ranges(),
                dev.wants_poll(),
                dev.kind(),
            )
        };
        debug!(
            name,
            kind,
            ports = ports.len(),
            mmio = mmio.len(),
            polls,
            "registered device"
        );
        self.devices.push(Registered {
            name: name.to_string(),
            device,
            ports,
            mmio,
            polls,
            kind,
        });
        Ok(())
    }

    /// Freeze registration and produce the immutable dispatch tables.
    pub fn build(mut self) -> Result<Chipset> {
        // Lifecycle broadcasts are deterministic: name-sorted.
        self.devices.sort_by(|a, b| a.name.cmp(&b.name));

        let mut port_map: HashMap<u16, usize> = HashMap::new();
        let mut mmio_table: Vec<(MmioRange, usize)> = Vec::new();
        let mut poll_list = Vec::new();

        for (idx, reg) in self.devices.iter().enumerate() {
            for range in &reg.ports {
                for offset in 0..range.len {
                    let port = range.base + offset;
                    if let Some(prev) = port_map.insert(port, idx) {
                        return Err(Error::InvalidConfig(format!(
                            "port {:#x} claimed by both {:?} and {:?}",
                            port, self.devices[prev].name, reg.name
                        )));
                    }
                }
            }
            for range in &reg.mmio {
                if let Some((other, prev)) = mmio_table
                    .iter()
                    .find(|(existing, _)| existing.overlaps(range))
                {
                    return Err(Error::InvalidConfig(format!(
                        "MMIO region {:#x}+{:#x} of {:?} overlaps {:#x}+{:#x} of {:?}",
                        range.base,
                        range.len,
                        reg.name,
                        other.base,
                        other.len,
                        self.devices[*prev].name
                    )));
                }
                mmio_table.push((*range, idx));
            }
            if reg.polls {
                poll_list.push(idx);
            }
        }

        mmio_table.sort_by_key(|(range, _)| range.base);

        debug!(
            devices = self.devices.len(),
            ports = port_map.len(),
            mmio_regions = mmio_table.len(),
            "chipset built"
        );

        Ok(Chipset {
            devices: self.devices,
            port_map,
            mmio_table,
            poll_list,
            lines: self.lines,
        })
    }
}

/// Immutable, built chipset.
pub struct Chipset {
    devices: Vec<Registered>,
    port_map: HashMap<u16, usize>,
    mmio_table: Vec<(MmioRange, usize)>,
    poll_list: Vec<usize>,
    lines: Arc<LineSet>,
}

impl Chipset {
    pub fn lines(&self) -> &Arc<LineSet> {
        &self.lines
    }

    /// Dispatch a port I/O exit. An unmatched port is a guest fault.
    pub fn handle_pio(&self, port: u16, data: &mut [u8], is_write: bool) -> DeviceResult {
        let Some(&idx) = self.port_map.get(&port) else {
            return Err(DeviceError::Failed(Error::GuestFault {
                exit_reason: "pio".into(),
                context: format!("no device at port {:#x}", port),
            }));
        };
        let mut dev = self.devices[idx].device.lock().unwrap();
        if is_write {
            dev.pio_write(port, data)
        } else {
            dev.pio_read(port, data)
        }
    }

    /// Dispatch an MMIO exit. Accesses straddling a region boundary are
    /// rejected; every byte of a valid access routes to one device.
    pub fn handle_mmio(
        &self,
        addr: u64,
        data: &mut [u8],
        is_write: bool,
        mem: &GuestMemoryMmap,
    ) -> DeviceResult {
        let idx = match self.lookup_mmio(addr) {
            Some(i) => i,
            None => {
                return Err(DeviceError::Failed(Error::GuestFault {
                    exit_reason: "mmio".into(),
                    context: format!("no device at {:#x}", addr),
                }))
            }
        };
        let (range, dev_idx) = self.mmio_table[idx];
        if !range.covers(addr, data.len() as u64) {
            return Err(DeviceError::Failed(Error::InvalidConfig(format!(
                "MMIO access {:#x}+{} straddles region boundary at {:#x}",
                addr,
                data.len(),
                range.base + range.len
            ))));
        }
        let mut dev = self.devices[dev_idx].device.lock().unwrap();
        if is_write {
            dev.mmio_write(addr, data, mem)
        } else {
            dev.mmio_read(addr, data, mem)
        }
    }

    fn lookup_mmio(&self, addr: u64) -> Option<usize> {
        let idx = self
            .mmio_table
            .partition_point(|(range, _)| range.base <= addr);
        if idx == 0 {
            return None;
        }
        let candidate = idx - 1;
        self.mmio_table[candidate].0.contains(addr).then_some(candidate)
    }

    /// Walk every poll-capable device once.
    pub fn poll(&self, now: Instant, mem: &GuestMemoryMmap) {
        for &idx in &self.poll_list {
            self.devices[idx].device.lock().unwrap().poll(now, mem);
        }
    }

    /// Broadcast `start` in name-sorted order.
    pub fn start(&self) {
        for reg in &self.devices {
            reg.device.lock().unwrap().start();
        }
    }

    /// Broadcast `stop` in name-sorted order.
    pub fn stop(&self) {
        for reg in &self.devices {
            reg.device.lock().unwrap().stop();
        }
    }

    /// Broadcast `reset` in name-sorted order.
    pub fn reset(&self) {
        for reg in &self.devices {
            reg.device.lock().unwrap().reset();
        }
    }

    /// `(name, kind)` pairs in broadcast order; part of the VM config hash.
    pub fn device_signatures(&self) -> Vec<(String, String)> {
        self.devices
            .iter()
            .map(|r| (r.name.clone(), r.kind.to_string()))
            .collect()
    }

    /// Serialize every device's state, keyed by registered name.
    pub fn save_device_states(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.devices
            .iter()
            .map(|r| Ok((r.name.clone(), r.device.lock().unwrap().save_state()?)))
            .collect()
    }

    /// Reinstate device blobs captured by [`Chipset::save_device_states`].
    /// The blob set must name exactly the registered devices.
    pub fn restore_device_states(&self, blobs: &[(String, Vec<u8>)]) -> Result<()> {
        if blobs.len() != self.devices.len() {
            return Err(Error::SnapshotMismatch);
        }
        for (name, blob) in blobs {
            let reg = self
                .devices
                .iter()
                .find(|r| &r.name == name)
                .ok_or(Error::SnapshotMismatch)?;
            reg.device.lock().unwrap().restore_state(blob)?;
        }
        Ok(())
    }

    /// Collect device tree fragments from every contributor.
    pub fn device_tree_nodes(&self) -> Vec<DtNode> {
        self.devices
            .iter()
            .filter_map(|r| r.device.lock().unwrap().device_tree_node())
            .collect()
    }

    /// Look up a registered device by name (used by the instance layer to
    /// reach virtio devices after build).
    pub fn device(&self, name: &str) -> Option<SharedDevice> {
        self.devices
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.device.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubDevice {
        ports: Vec<PortRange>,
        mmio: Vec<MmioRange>,
        last_write: Option<(u64, Vec<u8>)>,
    }

    impl StubDevice {
        fn new(ports: Vec<PortRange>, mmio: Vec<MmioRange>) -> SharedDevice {
            Arc::new(Mutex::new(Self {
                ports,
                mmio,
                last_write: None,
            }))
        }
    }

    impl Device for StubDevice {
        fn kind(&self) -> &'static str {
            "stub"
        }
        fn port_ranges(&self) -> Vec<PortRange> {
            self.ports.clone()
        }
        fn mmio_ranges(&self) -> Vec<MmioRange> {
            self.mmio.clone()
        }
        fn pio_read(&mut self, _port: u16, data: &mut [u8]) -> DeviceResult {
            data.fill(0x42);
            Ok(())
        }
        fn pio_write(&mut self, _port: u16, _data: &[u8]) -> DeviceResult {
            Ok(())
        }
        fn mmio_read(
            &mut self,
            _addr: u64,
            data: &mut [u8],
            _mem: &GuestMemoryMmap,
        ) -> DeviceResult {
            data.fill(0x24);
            Ok(())
        }
        fn mmio_write(&mut self, addr: u64, data: &[u8], _mem: &GuestMemoryMmap) -> DeviceResult {
            self.last_write = Some((addr, data.to_vec()));
            Ok(())
        }
        fn save_state(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn restore_state(&mut self, _blob: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn mem() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(vm_memory::GuestAddress(0), 0x1000)]).unwrap()
    }

    #[test]
    fn port_overlap_is_build_error() {
        let mut builder = ChipsetBuilder::new();
        builder
            .register_device("a", StubDevice::new(vec![PortRange::new(0x60, 2)], vec![]))
            .unwrap();
        builder
            .register_device("b", StubDevice::new(vec![PortRange::new(0x61, 1)], vec![]))
            .unwrap();
        assert!(matches!(builder.build(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn mmio_overlap_is_build_error() {
        let mut builder = ChipsetBuilder::new();
        builder
            .register_device(
                "a",
                StubDevice::new(vec![], vec![MmioRange::new(0x1000, 0x100)]),
            )
            .unwrap();
        builder
            .register_device(
                "b",
                StubDevice::new(vec![], vec![MmioRange::new(0x10f0, 0x100)]),
            )
            .unwrap();
        assert!(matches!(builder.build(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut builder = ChipsetBuilder::new();
        builder
            .register_device("serial", StubDevice::new(vec![], vec![]))
            .unwrap();
        assert!(builder
            .register_device("serial", StubDevice::new(vec![], vec![]))
            .is_err());
    }

    #[test]
    fn mmio_dispatch_routes_inside_region() {
        let mut builder = ChipsetBuilder::new();
        let dev = StubDevice::new(vec![], vec![MmioRange::new(0xd000_0000, 0x200)]);
        builder.register_device("virtio0", dev.clone()).unwrap();
        let chipset = builder.build().unwrap();

        let memory = mem();
        let mut data = [0u8; 4];
        chipset
            .handle_mmio(0xd000_0010, &mut data, false, &memory)
            .unwrap();
        assert_eq!(data, [0x24; 4]);

        chipset
            .handle_mmio(0xd000_0050, &mut [1, 2, 3, 4], true, &memory)
            .unwrap();
    }

    #[test]
    fn mmio_straddle_rejected() {
        let mut builder = ChipsetBuilder::new();
        builder
            .register_device(
                "virtio0",
                StubDevice::new(vec![], vec![MmioRange::new(0x1000, 0x100)]),
            )
            .unwrap();
        let chipset = builder.build().unwrap();

        let memory = mem();
        let mut data = [0u8; 8];
        let err = chipset
            .handle_mmio(0x10fc, &mut data, false, &memory)
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Failed(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn unmatched_access_is_fault() {
        let chipset = ChipsetBuilder::new().build().unwrap();
        let memory = mem();
        let mut data = [0u8; 1];
        assert!(matches!(
            chipset.handle_pio(0x80, &mut data, true),
            Err(DeviceError::Failed(Error::GuestFault { .. }))
        ));
        assert!(matches!(
            chipset.handle_mmio(0xfff0_0000, &mut data, false, &memory),
            Err(DeviceError::Failed(Error::GuestFault { .. }))
        ));
    }

    #[test]
    fn signatures_are_name_sorted() {
        let mut builder = ChipsetBuilder::new();
        builder
            .register_device("zeta", StubDevice::new(vec![], vec![]))
            .unwrap();
        builder
            .register_device("alpha", StubDevice::new(vec![], vec![]))
            .unwrap();
        let chipset = builder.build().unwrap();
        let sigs = chipset.device_signatures();
        assert_eq!(sigs[0].0, "alpha");
        assert_eq!(sigs[1].0, "zeta");
    }

    #[test]
    fn restore_rejects_wrong_device_set() {
        let mut builder = ChipsetBuilder::new();
        builder
            .register_device("a", StubDevice::new(vec![], vec![]))
            .unwrap();
        let chipset = builder.build().unwrap();
        let blobs = vec![("b".to_string(), Vec::new())];
        assert!(matches!(
            chipset.restore_device_states(&blobs),
            Err(Error::SnapshotMismatch)
        ));
    }
}
