//! Split virtqueue engine
//!
//! The rings live in guest memory and follow the virtio 1.2 split layout:
//! a guest-writable descriptor table and available ring the host only reads,
//! and a used ring only the host writes. The host walks descriptor chains
//! (read-only prefix, write-only suffix), tracks a private
//! `next_avail` index, and publishes one used entry per completed chain with
//! release ordering before raising the interrupt.
//!
//! Malformed rings stop the queue (`broken`) rather than corrupting state:
//! an out-of-range descriptor id is an error, a zero-length chain is skipped.

use std::sync::atomic::{fence, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::{Error, Result};

/// Upper bound on virtqueue sizes (virtio 1.2).
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Descriptor flags.
pub const VIRTQ_DESC_F_NEXT: u16 = 1 << 0;
pub const VIRTQ_DESC_F_WRITE: u16 = 1 << 1;

/// Used/avail ring flags.
const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1 << 0;

/// One guest-physical extent of a descriptor chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: u32,
}

/// A popped descriptor chain: scatter-gather split into the device-readable
/// prefix and the device-writable suffix.
#[derive(Debug, Clone)]
pub struct DescChain {
    pub head: u16,
    pub readable: Vec<Segment>,
    pub writable: Vec<Segment>,
}

impl DescChain {
    pub fn readable_len(&self) -> usize {
        self.readable.iter().map(|s| s.len as usize).sum()
    }

    pub fn writable_len(&self) -> usize {
        self.writable.iter().map(|s| s.len as usize).sum()
    }

    /// Gather the whole readable prefix into one buffer.
    pub fn read_all(&self, mem: &GuestMemoryMmap) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.readable_len());
        for seg in &self.readable {
            let start = out.len();
            out.resize(start + seg.len as usize, 0);
            mem.read_slice(&mut out[start..], GuestAddress(seg.addr))
                .map_err(|e| Error::Memory(format!("chain read at {:#x}: {}", seg.addr, e)))?;
        }
        Ok(out)
    }

    /// Scatter `data` into the writable suffix starting at `offset` bytes.
    /// Returns the number of bytes actually written.
    pub fn write_at(&self, mem: &GuestMemoryMmap, offset: usize, data: &[u8]) -> Result<usize> {
        let mut skip = offset;
        let mut src = data;
        let mut written = 0usize;
        for seg in &self.writable {
            let seg_len = seg.len as usize;
            if skip >= seg_len {
                skip -= seg_len;
                continue;
            }
            let avail = seg_len - skip;
            let n = avail.min(src.len());
            if n == 0 {
                break;
            }
            mem.write_slice(&src[..n], GuestAddress(seg.addr + skip as u64))
                .map_err(|e| Error::Memory(format!("chain write at {:#x}: {}", seg.addr, e)))?;
            written += n;
            src = &src[n..];
            skip = 0;
            if src.is_empty() {
                break;
            }
        }
        Ok(written)
    }
}

/// Host-side view of one virtqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Virtqueue {
    pub size: u16,
    pub max_size: u16,
    pub ready: bool,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    /// Private consumer index into the available ring.
    next_avail: u16,
    /// Next used ring slot the host will publish.
    next_used: u16,
    /// VIRTIO_F_EVENT_IDX negotiated.
    pub event_idx: bool,
    /// Queue stopped after a fatal ring error.
    broken: bool,
}

impl Virtqueue {
    pub fn new(max_size: u16) -> Self {
        Self {
            size: max_size,
            max_size,
            ready: false,
            desc_addr: 0,
            avail_addr: 0,
            used_addr: 0,
            next_avail: 0,
            next_used: 0,
            event_idx: false,
            broken: false,
        }
    }

    /// Reset driver-programmed state; survives device reset cycles.
    pub fn reset(&mut self) {
        let max = self.max_size;
        *self = Self::new(max);
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Used-ring progress, captured into VM snapshots.
    pub fn progress(&self) -> (u16, u16) {
        (self.next_avail, self.next_used)
    }

    pub fn restore_progress(&mut self, next_avail: u16, next_used: u16) {
        self.next_avail = next_avail;
        self.next_used = next_used;
    }

    fn avail_idx(&self, mem: &GuestMemoryMmap) -> Result<u16> {
        let idx: u16 = mem
            .read_obj(GuestAddress(self.avail_addr + 2))
            .map_err(|e| Error::Memory(format!("avail.idx: {}", e)))?;
        // Pair with the guest's release store of avail.idx.
        fence(Ordering::Acquire);
        Ok(idx)
    }

    /// Whether the driver has unconsumed available entries.
    pub fn has_available(&self, mem: &GuestMemoryMmap) -> bool {
        if !self.ready || self.broken {
            return false;
        }
        matches!(self.avail_idx(mem), Ok(idx) if idx != self.next_avail)
    }

    /// Pop the next available chain, if any.
    pub fn pop_chain(&mut self, mem: &GuestMemoryMmap) -> Result<Option<DescChain>> {
        if !self.ready || self.broken {
            return Ok(None);
        }
        let avail_idx = self.avail_idx(mem)?;
        if avail_idx == self.next_avail {
            return Ok(None);
        }

        let slot = self.next_avail % self.size;
        let head: u16 = mem
            .read_obj(GuestAddress(self.avail_addr + 4 + slot as u64 * 2))
            .map_err(|e| Error::Memory(format!("avail.ring[{}]: {}", slot, e)))?;

        let chain = match self.walk_chain(mem, head) {
            Ok(chain) => chain,
            Err(e) => {
                // Ring is corrupt; stop the queue, surface the error.
                warn!("virtqueue stopped: {}", e);
                self.broken = true;
                return Err(e);
            }
        };

        self.next_avail = self.next_avail.wrapping_add(1);
        Ok(Some(chain))
    }

    fn walk_chain(&self, mem: &GuestMemoryMmap, head: u16) -> Result<DescChain> {
        let mut readable = Vec::new();
        let mut writable = Vec::new();
        let mut index = head;
        let mut seen = 0u32;

        loop {
            if index >= self.size {
                return Err(Error::Device(format!(
                    "descriptor id {} out of range (queue size {})",
                    index, self.size
                )));
            }
            if seen > self.size as u32 {
                return Err(Error::Device("descriptor chain loops".into()));
            }
            seen += 1;

            let base = self.desc_addr + index as u64 * 16;
            let addr: u64 = mem
                .read_obj(GuestAddress(base))
                .map_err(|e| Error::Memory(format!("desc[{}].addr: {}", index, e)))?;
            let len: u32 = mem
                .read_obj(GuestAddress(base + 8))
                .map_err(|e| Error::Memory(format!("desc[{}].len: {}", index, e)))?;
            let flags: u16 = mem
                .read_obj(GuestAddress(base + 12))
                .map_err(|e| Error::Memory(format!("desc[{}].flags: {}", index, e)))?;
            let next: u16 = mem
                .read_obj(GuestAddress(base + 14))
                .map_err(|e| Error::Memory(format!("desc[{}].next: {}", index, e)))?;

            // Zero-length descriptors are tolerated and skipped.
            if len > 0 {
                let seg = Segment { addr, len };
                if flags & VIRTQ_DESC_F_WRITE != 0 {
                    writable.push(seg);
                } else {
                    if !writable.is_empty() {
                        return Err(Error::Device(
                            "read-only descriptor follows write-only in chain".into(),
                        ));
                    }
                    readable.push(seg);
                }
            }

            if flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            index = next;
        }

        Ok(DescChain {
            head,
            readable,
            writable,
        })
    }

    /// Publish one used entry for `head` with `len` bytes written, then
    /// advance `used.idx` with release ordering.
    pub fn add_used(&mut self, mem: &GuestMemoryMmap, head: u16, len: u32) -> Result<()> {
        if self.broken {
            return Ok(());
        }
        let slot = self.next_used % self.size;
        let entry_addr = self.used_addr + 4 + slot as u64 * 8;
        mem.write_obj(head as u32, GuestAddress(entry_addr))
            .map_err(|e| Error::Memory(format!("used.ring[{}].id: {}", slot, e)))?;
        mem.write_obj(len, GuestAddress(entry_addr + 4))
            .map_err(|e| Error::Memory(format!("used.ring[{}].len: {}", slot, e)))?;

        // The entry must be visible before the index moves.
        fence(Ordering::Release);
        self.next_used = self.next_used.wrapping_add(1);
        mem.write_obj(self.next_used, GuestAddress(self.used_addr + 2))
            .map_err(|e| Error::Memory(format!("used.idx: {}", e)))?;
        Ok(())
    }

    /// Whether the driver wants an interrupt for the entries just published.
    pub fn should_signal(&mut self, mem: &GuestMemoryMmap) -> bool {
        if self.broken {
            return false;
        }
        if self.event_idx {
            // used_event lives after the avail ring.
            let used_event_addr = self.avail_addr + 4 + self.size as u64 * 2;
            match mem.read_obj::<u16>(GuestAddress(used_event_addr)) {
                Ok(used_event) => {
                    // vring_need_event: signal if used_event is in
                    // (old_used, new_used].
                    let new = self.next_used;
                    let old = new.wrapping_sub(1);
                    new.wrapping_sub(used_event.wrapping_add(1)) < new.wrapping_sub(old)
                }
                Err(_) => true,
            }
        } else {
            match mem.read_obj::<u16>(GuestAddress(self.avail_addr)) {
                Ok(flags) => flags & VIRTQ_AVAIL_F_NO_INTERRUPT == 0,
                Err(_) => true,
            }
        }
    }
}
