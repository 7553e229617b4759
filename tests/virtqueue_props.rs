//! Virtqueue engine properties through the MMIO transport
//!
//! Drives a virtio device the way a guest driver would: negotiate features,
//! program the rings, publish available chains, notify. Checks the
//! exactly-once consumption property, used-entry head ids, interrupt
//! suppression, and the negotiated-feature subset rule.

use std::sync::{Arc, Mutex};

use cradle::chipset::{Device, LineSet};
use cradle::virtio::mmio::{reg, status, VirtioMmio};
use cradle::virtio::queue::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
use cradle::virtio::{device_id, features, NotifyOutcome, Virtqueue, VirtioDevice};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

const BASE: u64 = 0xD000_0000;
const DESC: u64 = 0x1000;
const AVAIL: u64 = 0x2000;
const USED: u64 = 0x3000;
const QUEUE_SIZE: u16 = 8;

/// Echoes each chain's readable prefix into its writable suffix and counts
/// how many chains it consumed.
struct EchoDevice {
    consumed: Arc<Mutex<Vec<u16>>>,
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
    ) -> cradle::Result<NotifyOutcome> {
        let q = &mut queues[queue];
        let mut any = false;
        while let Some(chain) = q.pop_chain(mem)? {
            self.consumed.lock().unwrap().push(chain.head);
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
    fn save_state(&self) -> cradle::Result<Vec<u8>> {
        Ok(Vec::new())
    }
    fn restore_state(&mut self, _blob: &[u8]) -> cradle::Result<()> {
        Ok(())
    }
}

struct Harness {
    device: VirtioMmio,
    mem: GuestMemoryMmap,
    consumed: Arc<Mutex<Vec<u16>>>,
    irq: cradle::chipset::IrqLine,
}

impl Harness {
    fn new() -> Self {
        let lines = LineSet::new();
        let irq = lines.allocate("virtio0", 16);
        let consumed = Arc::new(Mutex::new(Vec::new()));
        let device = VirtioMmio::new(
            Box::new(EchoDevice {
                consumed: consumed.clone(),
            }),
            BASE,
            irq.clone(),
        );
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 1 << 20)]).unwrap();
        Self {
            device,
            mem,
            consumed,
            irq,
        }
    }

    fn write32(&mut self, offset: u64, value: u32) {
        self.device
            .mmio_write(BASE + offset, &value.to_le_bytes(), &self.mem)
            .unwrap();
    }

    fn read32(&mut self, offset: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.device
            .mmio_read(BASE + offset, &mut buf, &self.mem)
            .unwrap();
        u32::from_le_bytes(buf)
    }

    /// The standard driver bring-up dance.
    fn negotiate(&mut self, accept_event_idx: bool) {
        self.write32(reg::STATUS, status::ACKNOWLEDGE);
        self.write32(reg::STATUS, status::ACKNOWLEDGE | status::DRIVER);

        // Read offered features, accept VERSION_1 (+ EVENT_IDX if asked).
        self.write32(reg::DEVICE_FEATURES_SEL, 0);
        let low = self.read32(reg::DEVICE_FEATURES);
        self.write32(reg::DEVICE_FEATURES_SEL, 1);
        let high = self.read32(reg::DEVICE_FEATURES);
        let offered = ((high as u64) << 32) | low as u64;
        assert_ne!(offered & features::VERSION_1, 0);

        let mut accept = features::VERSION_1;
        if accept_event_idx {
            accept |= offered & features::EVENT_IDX;
        }
        self.write32(reg::DRIVER_FEATURES_SEL, 0);
        self.write32(reg::DRIVER_FEATURES, accept as u32);
        self.write32(reg::DRIVER_FEATURES_SEL, 1);
        self.write32(reg::DRIVER_FEATURES, (accept >> 32) as u32);
        self.write32(
            reg::STATUS,
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK,
        );
        assert_ne!(
            self.read32(reg::STATUS) & status::FEATURES_OK,
            0,
            "device accepted the feature set"
        );

        self.write32(reg::QUEUE_SEL, 0);
        assert!(self.read32(reg::QUEUE_NUM_MAX) >= QUEUE_SIZE as u32);
        self.write32(reg::QUEUE_NUM, QUEUE_SIZE as u32);
        self.write32(reg::QUEUE_DESC_LOW, DESC as u32);
        self.write32(reg::QUEUE_DRIVER_LOW, AVAIL as u32);
        self.write32(reg::QUEUE_DEVICE_LOW, USED as u32);
        self.write32(reg::QUEUE_READY, 1);
        self.write32(
            reg::STATUS,
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK,
        );
    }

    fn write_desc(&self, i: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let base = DESC + i as u64 * 16;
        self.mem.write_obj(addr, GuestAddress(base)).unwrap();
        self.mem.write_obj(len, GuestAddress(base + 8)).unwrap();
        self.mem.write_obj(flags, GuestAddress(base + 12)).unwrap();
        self.mem.write_obj(next, GuestAddress(base + 14)).unwrap();
    }

    fn push_avail(&self, head: u16) {
        let idx: u16 = self.mem.read_obj(GuestAddress(AVAIL + 2)).unwrap();
        self.mem
            .write_obj(head, GuestAddress(AVAIL + 4 + (idx % QUEUE_SIZE) as u64 * 2))
            .unwrap();
        self.mem
            .write_obj(idx.wrapping_add(1), GuestAddress(AVAIL + 2))
            .unwrap();
    }

    fn used_idx(&self) -> u16 {
        self.mem.read_obj(GuestAddress(USED + 2)).unwrap()
    }

    fn used_entry(&self, i: u16) -> (u32, u32) {
        let base = USED + 4 + (i % QUEUE_SIZE) as u64 * 8;
        (
            self.mem.read_obj(GuestAddress(base)).unwrap(),
            self.mem.read_obj(GuestAddress(base + 4)).unwrap(),
        )
    }
}

#[test]
fn each_chain_consumed_exactly_once_with_head_id_in_used() {
    let mut h = Harness::new();
    h.negotiate(false);

    // Three chains with distinct heads.
    for (i, head) in [0u16, 2, 4].iter().enumerate() {
        let addr = 0x8000 + i as u64 * 0x100;
        h.mem
            .write_slice(format!("msg{}", i).as_bytes(), GuestAddress(addr))
            .unwrap();
        h.write_desc(*head, addr, 4, VIRTQ_DESC_F_NEXT, head + 1);
        h.write_desc(head + 1, addr + 0x80, 16, VIRTQ_DESC_F_WRITE, 0);
        h.push_avail(*head);
    }
    h.write32(reg::QUEUE_NOTIFY, 0);

    assert_eq!(h.used_idx(), 3);
    assert_eq!(*h.consumed.lock().unwrap(), [0u16, 2, 4]);
    for (i, head) in [0u32, 2, 4].iter().enumerate() {
        let (id, len) = h.used_entry(i as u16);
        assert_eq!(id, *head, "used entry references the original head");
        assert_eq!(len, 4);
    }

    // A second notify with no new avail entries consumes nothing.
    h.write32(reg::QUEUE_NOTIFY, 0);
    assert_eq!(h.used_idx(), 3);
    assert_eq!(h.consumed.lock().unwrap().len(), 3);
}

#[test]
fn interrupt_raised_then_acked() {
    let mut h = Harness::new();
    h.negotiate(false);

    h.mem.write_slice(b"ping", GuestAddress(0x8000)).unwrap();
    h.write_desc(0, 0x8000, 4, VIRTQ_DESC_F_NEXT, 1);
    h.write_desc(1, 0x9000, 16, VIRTQ_DESC_F_WRITE, 0);
    h.push_avail(0);
    h.write32(reg::QUEUE_NOTIFY, 0);

    assert_eq!(h.read32(reg::INTERRUPT_STATUS) & 1, 1);
    assert!(h.irq.is_high());
    h.write32(reg::INTERRUPT_ACK, 1);
    assert!(!h.irq.is_high());
}

#[test]
fn negotiated_features_subset_of_offered_and_accepted() {
    let mut h = Harness::new();
    h.negotiate(true);
    let negotiated = h.device.negotiated_features();
    // Subset of offered: only bits the device/transport offers.
    assert_eq!(
        negotiated & !(features::VERSION_1 | features::EVENT_IDX),
        0
    );
    // Subset of accepted: EVENT_IDX was accepted, so it may appear; a bit
    // never accepted must not.
    assert_ne!(negotiated & features::VERSION_1, 0);
}

#[test]
fn ring_reset_and_reprogram_survives() {
    let mut h = Harness::new();
    h.negotiate(false);

    h.mem.write_slice(b"a", GuestAddress(0x8000)).unwrap();
    h.write_desc(0, 0x8000, 1, 0, 0);
    h.push_avail(0);
    h.write32(reg::QUEUE_NOTIFY, 0);
    assert_eq!(h.used_idx(), 1);

    // Driver resets the device and reprograms from scratch.
    h.write32(reg::STATUS, 0);
    // Clear the rings like a fresh driver would.
    h.mem.write_obj(0u16, GuestAddress(AVAIL + 2)).unwrap();
    h.mem.write_obj(0u16, GuestAddress(USED + 2)).unwrap();
    h.negotiate(false);

    h.write_desc(3, 0x8000, 1, 0, 0);
    h.push_avail(3);
    h.write32(reg::QUEUE_NOTIFY, 0);
    assert_eq!(h.used_idx(), 1);
    assert_eq!(h.used_entry(0).0, 3);
}

#[test]
fn out_of_range_head_stops_queue_not_device() {
    let mut h = Harness::new();
    h.negotiate(false);

    h.push_avail(QUEUE_SIZE + 3);
    // The notify surfaces an error (queue stopped) rather than corrupting
    // anything.
    let result = h
        .device
        .mmio_write(BASE + reg::QUEUE_NOTIFY, &0u32.to_le_bytes(), &h.mem);
    assert!(result.is_err());
    assert_eq!(h.used_idx(), 0);
}
