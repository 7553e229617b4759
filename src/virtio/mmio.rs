//! Virtio MMIO transport (revision 2)
//!
//! Wraps a [`VirtioDevice`] into a chipset device: register block at fixed
//! offsets, feature negotiation (VIRTIO_F_VERSION_1 enforced), split-ring
//! queue programming, notify, interrupt status/ack, and config space at
//! offset 0x100. Tolerates repeated reset/enable cycles from the guest
//! driver.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use vm_memory::GuestMemoryMmap;

use crate::chipset::{Device, DtNode, IrqLine, MmioRange};
use crate::error::{DeviceError, DeviceResult};
use crate::virtio::{features, NotifyOutcome, Virtqueue, VirtioDevice};
use crate::Result;

/// Register offsets (virtio 1.2 §4.2.2).
pub mod reg {
    pub const MAGIC_VALUE: u64 = 0x000;
    pub const VERSION: u64 = 0x004;
    pub const DEVICE_ID: u64 = 0x008;
    pub const VENDOR_ID: u64 = 0x00c;
    pub const DEVICE_FEATURES: u64 = 0x010;
    pub const DEVICE_FEATURES_SEL: u64 = 0x014;
    pub const DRIVER_FEATURES: u64 = 0x020;
    pub const DRIVER_FEATURES_SEL: u64 = 0x024;
    pub const QUEUE_SEL: u64 = 0x030;
    pub const QUEUE_NUM_MAX: u64 = 0x034;
    pub const QUEUE_NUM: u64 = 0x038;
    pub const QUEUE_READY: u64 = 0x044;
    pub const QUEUE_NOTIFY: u64 = 0x050;
    pub const INTERRUPT_STATUS: u64 = 0x060;
    pub const INTERRUPT_ACK: u64 = 0x064;
    pub const STATUS: u64 = 0x070;
    pub const QUEUE_DESC_LOW: u64 = 0x080;
    pub const QUEUE_DESC_HIGH: u64 = 0x084;
    pub const QUEUE_DRIVER_LOW: u64 = 0x090;
    pub const QUEUE_DRIVER_HIGH: u64 = 0x094;
    pub const QUEUE_DEVICE_LOW: u64 = 0x0a0;
    pub const QUEUE_DEVICE_HIGH: u64 = 0x0a4;
    pub const CONFIG_GENERATION: u64 = 0x0fc;
    pub const CONFIG: u64 = 0x100;

    /// "virt" magic.
    pub const MAGIC: u32 = 0x7472_6976;
    pub const VERSION_2: u32 = 2;
    pub const VENDOR: u32 = 0x554d_4551; // "QEMU"
}

/// Device status bits.
pub mod status {
    pub const ACKNOWLEDGE: u32 = 1;
    pub const DRIVER: u32 = 2;
    pub const DRIVER_OK: u32 = 4;
    pub const FEATURES_OK: u32 = 8;
    pub const FAILED: u32 = 128;
}

/// Interrupt status bits.
const INT_USED_BUFFER: u32 = 1 << 0;
const INT_CONFIG_CHANGE: u32 = 1 << 1;

/// MMIO window size per device slot.
pub const MMIO_SLOT_SIZE: u64 = 0x200;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransportState {
    device_features_sel: u32,
    driver_features_sel: u32,
    driver_features: u64,
    queue_sel: u32,
    interrupt_status: u32,
    status: u32,
    config_generation: u32,
}

impl TransportState {
    fn new() -> Self {
        Self {
            device_features_sel: 0,
            driver_features_sel: 0,
            driver_features: 0,
            queue_sel: 0,
            interrupt_status: 0,
            status: 0,
            config_generation: 0,
        }
    }
}

/// A [`VirtioDevice`] attached to the MMIO bus.
pub struct VirtioMmio {
    device: Box<dyn VirtioDevice>,
    queues: Vec<Virtqueue>,
    state: TransportState,
    base: u64,
    irq: IrqLine,
    activated: bool,
}

impl VirtioMmio {
    pub fn new(device: Box<dyn VirtioDevice>, base: u64, irq: IrqLine) -> Self {
        let queues = device
            .queue_max_sizes()
            .into_iter()
            .map(Virtqueue::new)
            .collect();
        Self {
            device,
            queues,
            state: TransportState::new(),
            base,
            irq,
            activated: false,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// The `virtio_mmio.device=` kernel parameter stanza for this slot.
    pub fn cmdline_stanza(&self) -> String {
        format!(
            "virtio_mmio.device={}@{:#x}:{}",
            MMIO_SLOT_SIZE,
            self.base,
            self.irq.pin()
        )
    }

    /// Access the wrapped device (instance layer hooks: console input,
    /// display resize, vsock switch).
    pub fn device_mut(&mut self) -> &mut dyn VirtioDevice {
        self.device.as_mut()
    }

    /// Features offered to the driver: the device's own bits plus the
    /// transport-level EVENT_IDX.
    fn offered_features(&self) -> u64 {
        self.device.device_features() | features::EVENT_IDX
    }

    /// The feature set both sides agreed on.
    pub fn negotiated_features(&self) -> u64 {
        self.offered_features() & self.state.driver_features
    }

    fn current_queue(&self) -> Option<&Virtqueue> {
        self.queues.get(self.state.queue_sel as usize)
    }

    fn current_queue_mut(&mut self) -> Option<&mut Virtqueue> {
        self.queues.get_mut(self.state.queue_sel as usize)
    }

    fn sync_irq(&self) {
        if self.state.interrupt_status != 0 {
            self.irq.assert();
        } else {
            self.irq.deassert();
        }
    }

    fn apply_outcome(&mut self, outcome: NotifyOutcome, mem: &GuestMemoryMmap) {
        let mut raise = false;
        for q in outcome.used_queues {
            if let Some(queue) = self.queues.get_mut(q) {
                if queue.should_signal(mem) {
                    raise = true;
                }
            }
        }
        if raise {
            self.state.interrupt_status |= INT_USED_BUFFER;
        }
        if outcome.config_changed {
            self.state.config_generation = self.state.config_generation.wrapping_add(1);
            self.state.interrupt_status |= INT_CONFIG_CHANGE;
        }
        self.sync_irq();
    }

    fn transport_reset(&mut self) {
        debug!(base = format_args!("{:#x}", self.base), "virtio device reset");
        self.state = TransportState::new();
        for q in &mut self.queues {
            q.reset();
        }
        self.device.on_reset();
        self.activated = false;
        self.sync_irq();
    }

    fn read_reg(&self, offset: u64) -> u32 {
        match offset {
            reg::MAGIC_VALUE => reg::MAGIC,
            reg::VERSION => reg::VERSION_2,
            reg::DEVICE_ID => self.device.device_id(),
            reg::VENDOR_ID => reg::VENDOR,
            reg::DEVICE_FEATURES => {
                let feats = self.offered_features();
                if self.state.device_features_sel == 0 {
                    feats as u32
                } else {
                    (feats >> 32) as u32
                }
            }
            reg::QUEUE_NUM_MAX => self
                .current_queue()
                .map(|q| q.max_size as u32)
                .unwrap_or(0),
            reg::QUEUE_READY => self.current_queue().map(|q| q.ready as u32).unwrap_or(0),
            reg::INTERRUPT_STATUS => self.state.interrupt_status,
            reg::STATUS => self.state.status,
            reg::CONFIG_GENERATION => self.state.config_generation,
            other => {
                trace!(offset = other, "virtio-mmio unhandled register read");
                0
            }
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32, mem: &GuestMemoryMmap) -> DeviceResult {
        match offset {
            reg::DEVICE_FEATURES_SEL => self.state.device_features_sel = value,
            reg::DRIVER_FEATURES => {
                if self.state.driver_features_sel == 0 {
                    self.state.driver_features =
                        (self.state.driver_features & !0xFFFF_FFFF) | value as u64;
                } else {
                    self.state.driver_features = (self.state.driver_features & 0xFFFF_FFFF)
                        | ((value as u64) << 32);
                }
            }
            reg::DRIVER_FEATURES_SEL => self.state.driver_features_sel = value,
            reg::QUEUE_SEL => self.state.queue_sel = value,
            reg::QUEUE_NUM => {
                if let Some(q) = self.current_queue_mut() {
                    if value.is_power_of_two() && value as u16 <= q.max_size {
                        q.size = value as u16;
                    } else {
                        warn!(size = value, "driver programmed bad queue size");
                    }
                }
            }
            reg::QUEUE_READY => {
                let event_idx = self.negotiated_features() & features::EVENT_IDX != 0;
                if let Some(q) = self.current_queue_mut() {
                    q.ready = value != 0;
                    q.event_idx = event_idx;
                    if q.ready {
                        q.restore_progress(0, 0);
                    }
                }
            }
            reg::QUEUE_NOTIFY => {
                let queue = value as usize;
                if queue >= self.queues.len() {
                    return Err(DeviceError::Failed(crate::Error::Device(format!(
                        "notify for nonexistent queue {}",
                        queue
                    ))));
                }
                let outcome = self
                    .device
                    .handle_notify(queue, &mut self.queues, mem)
                    .map_err(DeviceError::Failed)?;
                self.apply_outcome(outcome, mem);
            }
            reg::INTERRUPT_ACK => {
                self.state.interrupt_status &= !value;
                self.sync_irq();
            }
            reg::STATUS => {
                if value == 0 {
                    self.transport_reset();
                    return Ok(());
                }
                // Refuse FEATURES_OK unless VERSION_1 was accepted.
                if value & status::FEATURES_OK != 0
                    && self.state.driver_features & features::VERSION_1 == 0
                {
                    warn!("driver rejected VIRTIO_F_VERSION_1; failing negotiation");
                    self.state.status = value & !status::FEATURES_OK;
                    return Ok(());
                }
                let newly_ok =
                    value & status::DRIVER_OK != 0 && self.state.status & status::DRIVER_OK == 0;
                self.state.status = value;
                if newly_ok && !self.activated {
                    self.activated = true;
                    let negotiated = self.negotiated_features();
                    debug!(
                        device = self.device.device_id(),
                        features = format_args!("{:#x}", negotiated),
                        "virtio device activated"
                    );
                    self.device.on_activate(negotiated);
                }
            }
            reg::QUEUE_DESC_LOW => {
                if let Some(q) = self.current_queue_mut() {
                    q.desc_addr = (q.desc_addr & !0xFFFF_FFFF) | value as u64;
                }
            }
            reg::QUEUE_DESC_HIGH => {
                if let Some(q) = self.current_queue_mut() {
                    q.desc_addr = (q.desc_addr & 0xFFFF_FFFF) | ((value as u64) << 32);
                }
            }
            reg::QUEUE_DRIVER_LOW => {
                if let Some(q) = self.current_queue_mut() {
                    q.avail_addr = (q.avail_addr & !0xFFFF_FFFF) | value as u64;
                }
            }
            reg::QUEUE_DRIVER_HIGH => {
                if let Some(q) = self.current_queue_mut() {
                    q.avail_addr = (q.avail_addr & 0xFFFF_FFFF) | ((value as u64) << 32);
                }
            }
            reg::QUEUE_DEVICE_LOW => {
                if let Some(q) = self.current_queue_mut() {
                    q.used_addr = (q.used_addr & !0xFFFF_FFFF) | value as u64;
                }
            }
            reg::QUEUE_DEVICE_HIGH => {
                if let Some(q) = self.current_queue_mut() {
                    q.used_addr = (q.used_addr & 0xFFFF_FFFF) | ((value as u64) << 32);
                }
            }
            other => {
                trace!(offset = other, value, "virtio-mmio unhandled register write");
            }
        }
        Ok(())
    }
}

impl Device for VirtioMmio {
    fn kind(&self) -> &'static str {
        "virtio-mmio"
    }

    fn mmio_ranges(&self) -> Vec<MmioRange> {
        vec![MmioRange::new(self.base, MMIO_SLOT_SIZE)]
    }

    fn wants_poll(&self) -> bool {
        self.device.wants_poll()
    }

    fn mmio_read(&mut self, addr: u64, data: &mut [u8], _mem: &GuestMemoryMmap) -> DeviceResult {
        let offset = addr - self.base;
        if offset >= reg::CONFIG {
            self.device.config_read(offset - reg::CONFIG, data);
            return Ok(());
        }
        let value = self.read_reg(offset);
        let bytes = value.to_le_bytes();
        let len = data.len().min(4);
        data[..len].copy_from_slice(&bytes[..len]);
        Ok(())
    }

    fn mmio_write(&mut self, addr: u64, data: &[u8], mem: &GuestMemoryMmap) -> DeviceResult {
        let offset = addr - self.base;
        if offset >= reg::CONFIG {
            self.device.config_write(offset - reg::CONFIG, data);
            return Ok(());
        }
        let mut bytes = [0u8; 4];
        let len = data.len().min(4);
        bytes[..len].copy_from_slice(&data[..len]);
        self.write_reg(offset, u32::from_le_bytes(bytes), mem)
    }

    fn poll(&mut self, _now: std::time::Instant, mem: &GuestMemoryMmap) {
        if !self.activated {
            return;
        }
        match self.device.poll(&mut self.queues, mem) {
            Ok(outcome) => self.apply_outcome(outcome, mem),
            Err(e) => warn!("virtio poll error: {}", e),
        }
    }

    fn reset(&mut self) {
        self.transport_reset();
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        let blob = (
            self.state.clone(),
            self.queues.clone(),
            self.activated,
            self.device.save_state()?,
        );
        Ok(postcard::to_stdvec(&blob)?)
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<()> {
        let (state, queues, activated, device_blob): (
            TransportState,
            Vec<Virtqueue>,
            bool,
            Vec<u8>,
        ) = postcard::from_bytes(blob)?;
        if queues.len() != self.queues.len() {
            return Err(crate::Error::SnapshotMismatch);
        }
        self.state = state;
        self.queues = queues;
        self.activated = activated;
        self.device.restore_state(&device_blob)?;
        self.sync_irq();
        Ok(())
    }

    fn device_tree_node(&self) -> Option<DtNode> {
        Some(DtNode {
            name: "virtio_mmio".into(),
            compatible: "virtio,mmio".into(),
            reg: vec![(self.base, MMIO_SLOT_SIZE)],
            interrupts: vec![self.irq.pin()],
            props: Vec::new(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chipset::LineSet;
    use crate::virtio::{device_id, queue};
    use vm_memory::{Bytes, GuestAddress};

    /// Minimal echo device: one queue; on notify it copies the readable
    /// prefix into the writable suffix of each chain.
    pub(crate) struct EchoDevice {
        pub notifies: usize,
    }

    impl VirtioDevice for EchoDevice {
        fn device_id(&self) -> u32 {
            device_id::CONSOLE
        }
        fn device_features(&self) -> u64 {
            features::VERSION_1
        }
        fn queue_max_sizes(&self) -> Vec<u16> {
            vec![64]
        }
        fn config_read(&self, _offset: u64, data: &mut [u8]) {
            data.fill(0);
        }
        fn handle_notify(
            &mut self,
            queue: usize,
            queues: &mut [Virtqueue],
            mem: &GuestMemoryMmap,
        ) -> Result<NotifyOutcome> {
            self.notifies += 1;
            let q = &mut queues[queue];
            let mut any = false;
            while let Some(chain) = q.pop_chain(mem)? {
                let data = chain.read_all(mem)?;
                let n = chain.write_at(mem, 0, &data)?;
                q.add_used(mem, chain.head, n as u32)?;
                any = true;
            }
            Ok(if any {
                NotifyOutcome::used(queue)
            } else {
                NotifyOutcome::default()
            })
        }
        fn save_state(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn restore_state(&mut self, _blob: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    pub(crate) fn mmio_device() -> (VirtioMmio, GuestMemoryMmap, IrqLine) {
        let lines = LineSet::new();
        let irq = lines.allocate("virtio0", 5);
        let dev = VirtioMmio::new(Box::new(EchoDevice { notifies: 0 }), 0xd000_0000, irq.clone());
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x100000)]).unwrap();
        (dev, mem, irq)
    }

    pub(crate) fn read32(dev: &mut VirtioMmio, mem: &GuestMemoryMmap, offset: u64) -> u32 {
        let mut buf = [0u8; 4];
        dev.mmio_read(dev.base + offset, &mut buf, mem).unwrap();
        u32::from_le_bytes(buf)
    }

    pub(crate) fn write32(dev: &mut VirtioMmio, mem: &GuestMemoryMmap, offset: u64, value: u32) {
        dev.mmio_write(dev.base + offset, &value.to_le_bytes(), mem)
            .unwrap();
    }

    /// Drive the standard negotiation dance and program queue 0 at the
    /// testing ring addresses.
    pub(crate) fn negotiate(dev: &mut VirtioMmio, mem: &GuestMemoryMmap) {
        use crate::virtio::queue::testing::{AVAIL_BASE, DESC_BASE, USED_BASE};

        write32(dev, mem, reg::STATUS, status::ACKNOWLEDGE);
        write32(dev, mem, reg::STATUS, status::ACKNOWLEDGE | status::DRIVER);
        // Accept VERSION_1 (high word bit 0).
        write32(dev, mem, reg::DRIVER_FEATURES_SEL, 1);
        write32(dev, mem, reg::DRIVER_FEATURES, 1);
        write32(dev, mem, reg::DRIVER_FEATURES_SEL, 0);
        write32(dev, mem, reg::DRIVER_FEATURES, 0);
        write32(
            dev,
            mem,
            reg::STATUS,
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK,
        );
        assert_ne!(read32(dev, mem, reg::STATUS) & status::FEATURES_OK, 0);

        write32(dev, mem, reg::QUEUE_SEL, 0);
        write32(dev, mem, reg::QUEUE_NUM, 8);
        write32(dev, mem, reg::QUEUE_DESC_LOW, DESC_BASE as u32);
        write32(dev, mem, reg::QUEUE_DRIVER_LOW, AVAIL_BASE as u32);
        write32(dev, mem, reg::QUEUE_DEVICE_LOW, USED_BASE as u32);
        write32(dev, mem, reg::QUEUE_READY, 1);
        write32(
            dev,
            mem,
            reg::STATUS,
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK,
        );
    }

    #[test]
    fn identity_registers() {
        let (mut dev, mem, _) = mmio_device();
        assert_eq!(read32(&mut dev, &mem, reg::MAGIC_VALUE), reg::MAGIC);
        assert_eq!(read32(&mut dev, &mem, reg::VERSION), 2);
        assert_eq!(read32(&mut dev, &mem, reg::DEVICE_ID), device_id::CONSOLE);
    }

    #[test]
    fn features_ok_requires_version_1() {
        let (mut dev, mem, _) = mmio_device();
        write32(&mut dev, &mem, reg::STATUS, status::ACKNOWLEDGE);
        // Driver accepts nothing, then asks FEATURES_OK.
        write32(
            &mut dev,
            &mem,
            reg::STATUS,
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK,
        );
        assert_eq!(read32(&mut dev, &mem, reg::STATUS) & status::FEATURES_OK, 0);
    }

    #[test]
    fn negotiated_is_subset_of_offered_and_accepted() {
        let (mut dev, mem, _) = mmio_device();
        negotiate(&mut dev, &mem);
        let negotiated = dev.negotiated_features();
        assert_eq!(negotiated & !dev.device.device_features(), 0);
        assert_eq!(negotiated & !dev.state.driver_features, 0);
        assert_ne!(negotiated & features::VERSION_1, 0);
    }

    #[test]
    fn notify_processes_chain_and_raises_interrupt() {
        use crate::virtio::queue::testing::{push_avail, write_desc};
        let (mut dev, mem, irq) = mmio_device();
        negotiate(&mut dev, &mem);

        mem.write_slice(b"hi", GuestAddress(0x8000)).unwrap();
        write_desc(&mem, 0, 0x8000, 2, queue::VIRTQ_DESC_F_NEXT, 1);
        write_desc(&mem, 1, 0x9000, 2, queue::VIRTQ_DESC_F_WRITE, 0);
        push_avail(&mem, 8, 0);

        write32(&mut dev, &mem, reg::QUEUE_NOTIFY, 0);

        let mut echoed = [0u8; 2];
        mem.read_slice(&mut echoed, GuestAddress(0x9000)).unwrap();
        assert_eq!(&echoed, b"hi");

        assert_eq!(read32(&mut dev, &mem, reg::INTERRUPT_STATUS) & 1, 1);
        assert!(irq.is_high());

        // Ack drops the line.
        write32(&mut dev, &mem, reg::INTERRUPT_ACK, 1);
        assert!(!irq.is_high());
    }

    #[test]
    fn reset_cycle_reprograms_cleanly() {
        let (mut dev, mem, _) = mmio_device();
        negotiate(&mut dev, &mem);
        assert!(dev.activated);

        write32(&mut dev, &mem, reg::STATUS, 0);
        assert!(!dev.activated);
        assert!(!dev.queues[0].ready);

        negotiate(&mut dev, &mem);
        assert!(dev.activated);
        assert!(dev.queues[0].ready);
    }

    #[test]
    fn bad_notify_queue_is_error() {
        let (mut dev, mem, _) = mmio_device();
        negotiate(&mut dev, &mem);
        let err = dev.mmio_write(
            dev.base + reg::QUEUE_NOTIFY,
            &9u32.to_le_bytes(),
            &mem,
        );
        assert!(err.is_err());
    }

    #[test]
    fn transport_state_round_trip() {
        let (mut dev, mem, _) = mmio_device();
        negotiate(&mut dev, &mem);
        let blob = dev.save_state().unwrap();

        let (mut fresh, mem2, _) = mmio_device();
        fresh.restore_state(&blob).unwrap();
        assert!(fresh.activated);
        assert_eq!(
            read32(&mut fresh, &mem2, reg::STATUS),
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK
        );
        assert!(fresh.queues[0].ready);
    }
}
