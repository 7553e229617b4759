//! Virtio transport and devices
//!
//! A [`VirtioDevice`] supplies device id, feature bits, config space, and
//! queue handlers; the MMIO transport ([`mmio::VirtioMmio`]) wraps it into a
//! chipset [`crate::chipset::Device`], handling register access, feature
//! negotiation, queue programming, and interrupt status. A PCI transport
//! would wrap the same trait.

pub mod block;
pub mod console;
pub mod fs;
pub mod gpu;
pub mod input;
pub mod mmio;
pub mod net;
pub mod queue;
pub mod vsock;

use vm_memory::GuestMemoryMmap;

use crate::Result;
pub use queue::{DescChain, Segment, Virtqueue};

/// Device type ids (virtio 1.2 §5).
pub mod device_id {
    pub const NET: u32 = 1;
    pub const BLOCK: u32 = 2;
    pub const CONSOLE: u32 = 3;
    pub const GPU: u32 = 16;
    pub const INPUT: u32 = 18;
    pub const VSOCK: u32 = 19;
    pub const FS: u32 = 26;
}

/// Transport-level feature bits.
pub mod features {
    /// VIRTIO_F_VERSION_1: modern device; negotiation is refused without it.
    pub const VERSION_1: u64 = 1 << 32;
    /// VIRTIO_F_RING_EVENT_IDX.
    pub const EVENT_IDX: u64 = 1 << 29;
}

/// What a queue handler accomplished; drives interrupt status updates.
#[derive(Debug, Default, Clone)]
pub struct NotifyOutcome {
    /// Queues for which new used entries were published.
    pub used_queues: Vec<usize>,
    /// Device config changed; the transport bumps the generation and raises
    /// the config-change interrupt.
    pub config_changed: bool,
}

impl NotifyOutcome {
    pub fn used(queue: usize) -> Self {
        Self {
            used_queues: vec![queue],
            config_changed: false,
        }
    }

    pub fn merge(&mut self, other: NotifyOutcome) {
        for q in other.used_queues {
            if !self.used_queues.contains(&q) {
                self.used_queues.push(q);
            }
        }
        self.config_changed |= other.config_changed;
    }
}

/// A virtio device behind a transport.
///
/// Handlers run on the vCPU thread that wrote QUEUE_NOTIFY and must not
/// block on host I/O; long work belongs in `poll`, which the transport
/// forwards from the chipset poll thread.
pub trait VirtioDevice: Send {
    /// Virtio device type ([`device_id`]).
    fn device_id(&self) -> u32;

    /// Feature bits offered to the driver; must include
    /// [`features::VERSION_1`].
    fn device_features(&self) -> u64;

    /// Maximum size for each queue, in queue order.
    fn queue_max_sizes(&self) -> Vec<u16>;

    fn config_read(&self, offset: u64, data: &mut [u8]);

    fn config_write(&mut self, _offset: u64, _data: &[u8]) {}

    /// The driver notified `queue`. Drain available chains, publish used
    /// entries, report which queues progressed.
    fn handle_notify(
        &mut self,
        queue: usize,
        queues: &mut [Virtqueue],
        mem: &GuestMemoryMmap,
    ) -> Result<NotifyOutcome>;

    /// Feature negotiation finished (DRIVER_OK written).
    fn on_activate(&mut self, _negotiated: u64) {}

    /// Driver reset the device (status 0).
    fn on_reset(&mut self) {}

    /// Whether the transport should forward poll ticks.
    fn wants_poll(&self) -> bool {
        false
    }

    /// Time-driven bottom half (RX injection, flush completion).
    fn poll(
        &mut self,
        _queues: &mut [Virtqueue],
        _mem: &GuestMemoryMmap,
    ) -> Result<NotifyOutcome> {
        Ok(NotifyOutcome::default())
    }

    /// Device-private snapshot state (queue state is captured by the
    /// transport).
    fn save_state(&self) -> Result<Vec<u8>>;

    fn restore_state(&mut self, blob: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_merge_deduplicates() {
        let mut a = NotifyOutcome::used(0);
        a.merge(NotifyOutcome::used(1));
        a.merge(NotifyOutcome::used(0));
        assert_eq!(a.used_queues, vec![0, 1]);
        assert!(!a.config_changed);
    }
}
