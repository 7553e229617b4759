//! Guest physical memory: slot table and access helpers
//!
//! Slots never overlap and never move; the table may grow (ballooning) but
//! established regions keep their host mappings for the VM's lifetime.
//! `read_at`/`write_at` fail when the range straddles an unmapped gap.

use std::sync::RwLock;

use vm_memory::{
    Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion, GuestRegionMmap,
    MmapRegion,
};

use crate::{Error, Result};

/// One contiguous region of guest physical address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySlot {
    pub gpa: u64,
    pub size: u64,
}

/// The VM's guest RAM: an mmap-backed region set plus the slot table.
pub struct GuestRam {
    mmap: RwLock<GuestMemoryMmap>,
    slots: RwLock<Vec<MemorySlot>>,
}

impl GuestRam {
    /// Create RAM with one initial slot at `gpa`.
    pub fn new(gpa: u64, size: u64) -> Result<Self> {
        let mmap = GuestMemoryMmap::from_ranges(&[(GuestAddress(gpa), size as usize)])
            .map_err(|e| Error::Memory(format!("mmap guest ram: {}", e)))?;
        Ok(Self {
            mmap: RwLock::new(mmap),
            slots: RwLock::new(vec![MemorySlot { gpa, size }]),
        })
    }

    /// Map an additional slot. Overlap with an existing slot is an
    /// `InvalidConfig` error; existing regions are untouched.
    pub fn allocate(&self, gpa: u64, size: u64) -> Result<MemorySlot> {
        let mut slots = self.slots.write().unwrap();
        for slot in slots.iter() {
            if gpa < slot.gpa + slot.size && slot.gpa < gpa + size {
                return Err(Error::InvalidConfig(format!(
                    "memory slot {:#x}+{:#x} overlaps existing {:#x}+{:#x}",
                    gpa, size, slot.gpa, slot.size
                )));
            }
        }
        let region = GuestRegionMmap::new(
            MmapRegion::new(size as usize)
                .map_err(|e| Error::Memory(format!("mmap slot: {}", e)))?,
            GuestAddress(gpa),
        )
        .ok_or_else(|| Error::Memory("slot region: guest address overflow".to_string()))?;

        let mut mmap = self.mmap.write().unwrap();
        *mmap = mmap
            .insert_region(std::sync::Arc::new(region))
            .map_err(|e| Error::Memory(format!("insert slot: {}", e)))?;
        let slot = MemorySlot { gpa, size };
        slots.push(slot);
        Ok(slot)
    }

    /// Snapshot of the current region set. Cheap: regions are Arc-shared,
    /// and existing mappings never move.
    pub fn view(&self) -> GuestMemoryMmap {
        self.mmap.read().unwrap().clone()
    }

    pub fn slots(&self) -> Vec<MemorySlot> {
        self.slots.read().unwrap().clone()
    }

    pub fn total_size(&self) -> u64 {
        self.slots.read().unwrap().iter().map(|s| s.size).sum()
    }

    /// Read guest physical memory. Fails if `[gpa, gpa+buf.len())` is not
    /// fully mapped.
    pub fn read_at(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
        self.mmap
            .read()
            .unwrap()
            .read_slice(buf, GuestAddress(gpa))
            .map_err(|e| Error::Memory(format!("read {:#x}+{:#x}: {}", gpa, buf.len(), e)))
    }

    /// Write guest physical memory. Fails if the range straddles a gap.
    pub fn write_at(&self, gpa: u64, data: &[u8]) -> Result<()> {
        self.mmap
            .read()
            .unwrap()
            .write_slice(data, GuestAddress(gpa))
            .map_err(|e| Error::Memory(format!("write {:#x}+{:#x}: {}", gpa, data.len(), e)))
    }

    /// Host virtual address backing `gpa` (for KVM slot registration).
    pub fn host_address(&self, gpa: u64) -> Result<u64> {
        self.mmap
            .read()
            .unwrap()
            .get_host_address(GuestAddress(gpa))
            .map(|p| p as u64)
            .map_err(|e| Error::Memory(format!("host address of {:#x}: {}", gpa, e)))
    }

    /// Dump every slot's contents (snapshot capture).
    pub fn capture(&self) -> Result<Vec<(MemorySlot, Vec<u8>)>> {
        let slots = self.slots();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            let mut data = vec![0u8; slot.size as usize];
            self.read_at(slot.gpa, &mut data)?;
            out.push((slot, data));
        }
        Ok(out)
    }

    /// Reinstate contents captured by [`GuestRam::capture`]. The slot set
    /// must match exactly.
    pub fn restore(&self, regions: &[(MemorySlot, Vec<u8>)]) -> Result<()> {
        let current = self.slots();
        if current.len() != regions.len()
            || !regions.iter().all(|(s, _)| current.contains(s))
        {
            return Err(Error::SnapshotMismatch);
        }
        for (slot, data) in regions {
            self.write_at(slot.gpa, data)?;
        }
        Ok(())
    }

    /// Iterate (gpa, host_addr, size) triples for KVM registration.
    pub fn kvm_regions(&self) -> Vec<(u64, u64, u64)> {
        let mmap = self.mmap.read().unwrap();
        mmap.iter()
            .map(|region| {
                let gpa = region.start_addr().raw_value();
                let host = mmap.get_host_address(region.start_addr()).unwrap() as u64;
                (gpa, host, region.len())
            })
            .collect()
    }
}
