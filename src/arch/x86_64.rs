//! x86_64 boot setup: long-mode register files, GDT, early page tables

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::{Error, Result};

/// Memory layout agreed on by the loader and the chipset.
pub mod layout {
    /// Boot parameters (zero page) address
    pub const BOOT_PARAMS_ADDR: u64 = 0x0000_7000;
    /// Kernel command line address
    pub const CMDLINE_ADDR: u64 = 0x0002_0000;
    /// Maximum kernel command line size
    pub const CMDLINE_MAX_SIZE: usize = 4096;
    /// PML4 base; PDPT and PDs follow page by page
    pub const PAGE_TABLE_BASE: u64 = 0x9000;
    /// Start of the MMIO gap below 4 GiB
    pub const MMIO_GAP_START: u64 = 0xD000_0000;
    /// End of the MMIO gap
    pub const MMIO_GAP_END: u64 = 0x1_0000_0000;
    /// IOAPIC MMIO window
    pub const IOAPIC_BASE: u64 = 0xFEC0_0000;
    /// LAPIC MMIO window
    pub const APIC_BASE: u64 = 0xFEE0_0000;
    /// Virtio MMIO device slots start here, one per 0x1000
    pub const VIRTIO_MMIO_BASE: u64 = 0xD000_0000;
    /// Size of one virtio MMIO slot
    pub const VIRTIO_MMIO_SIZE: u64 = 0x1000;
    /// First IOAPIC pin handed to virtio devices; 16..23 stay clear of the
    /// legacy ISA pins (PIT 0, kbd 1, serial 4, RTC 8, mouse 12).
    pub const VIRTIO_IRQ_BASE: u32 = 16;
}

/// Segment selectors and descriptor type fields for the boot GDT.
pub mod segment {
    /// Code segment selector
    pub const CODE_SELECTOR: u16 = 0x10;
    /// Data segment selector
    pub const DATA_SELECTOR: u16 = 0x18;
    /// Code segment type (execute/read, accessed)
    pub const CODE_TYPE: u8 = 0x0b;
    /// Data segment type (read/write, accessed)
    pub const DATA_TYPE: u8 = 0x03;
}

/// Control register bits needed for the real→long transition.
pub mod cr {
    /// CR0: Protected mode enable
    pub const CR0_PE: u64 = 1 << 0;
    /// CR0: Paging enable
    pub const CR0_PG: u64 = 1 << 31;
    /// CR4: Physical Address Extension
    pub const CR4_PAE: u64 = 1 << 5;
    /// EFER: Long Mode Enable
    pub const EFER_LME: u64 = 1 << 8;
    /// EFER: Long Mode Active
    pub const EFER_LMA: u64 = 1 << 10;
}

/// Page table entry flags.
const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_HUGE: u64 = 1 << 7;

/// General-purpose register file a vCPU starts from.
#[derive(Debug, Clone, Copy)]
pub struct BootRegs {
    pub rip: u64,
    pub rsi: u64,
    pub rsp: u64,
    pub rflags: u64,
}

/// Register file for entering a bzImage at its 64-bit entry point:
/// RSI points at the zero page, interrupts off, reserved flag bit set.
pub fn boot_regs(entry_point: u64) -> BootRegs {
    BootRegs {
        rip: entry_point,
        rsi: layout::BOOT_PARAMS_ADDR,
        rsp: 0,
        rflags: 0x2,
    }
}

/// Identity-map the first `map_size` bytes of guest physical space with
/// 2 MiB pages, writing PML4/PDPT/PDs at [`layout::PAGE_TABLE_BASE`].
/// Returns the CR3 value.
///
/// `map_size` is rounded up to 1 GiB; at most 512 GiB can be mapped with a
/// single PDPT.
pub fn write_identity_page_tables(memory: &GuestMemoryMmap, map_size: u64) -> Result<u64> {
    let gib = 1u64 << 30;
    let gib_count = map_size.div_ceil(gib).max(1);
    if gib_count > 512 {
        return Err(Error::InvalidConfig(format!(
            "cannot identity-map {} GiB with one PDPT",
            gib_count
        )));
    }

    let pml4_addr = layout::PAGE_TABLE_BASE;
    let pdpt_addr = pml4_addr + 0x1000;
    let pd_base = pdpt_addr + 0x1000;

    let zero_page = [0u8; 0x1000];
    memory
        .write_slice(&zero_page, GuestAddress(pml4_addr))
        .map_err(|e| Error::Memory(format!("zero pml4: {}", e)))?;
    memory
        .write_slice(&zero_page, GuestAddress(pdpt_addr))
        .map_err(|e| Error::Memory(format!("zero pdpt: {}", e)))?;

    // PML4[0] -> PDPT
    let pml4_entry = pdpt_addr | PTE_PRESENT | PTE_WRITABLE;
    memory
        .write_slice(&pml4_entry.to_le_bytes(), GuestAddress(pml4_addr))
        .map_err(|e| Error::Memory(format!("write pml4: {}", e)))?;

    for g in 0..gib_count {
        let pd_addr = pd_base + g * 0x1000;
        // PDPT[g] -> PD
        let pdpt_entry = pd_addr | PTE_PRESENT | PTE_WRITABLE;
        memory
            .write_slice(
                &pdpt_entry.to_le_bytes(),
                GuestAddress(pdpt_addr + g * 8),
            )
            .map_err(|e| Error::Memory(format!("write pdpt[{}]: {}", g, e)))?;

        // 512 x 2 MiB entries per PD
        let mut pd = [0u8; 0x1000];
        for i in 0..512u64 {
            let phys = g * gib + i * 0x20_0000;
            let entry = phys | PTE_PRESENT | PTE_WRITABLE | PTE_HUGE;
            pd[(i as usize) * 8..(i as usize) * 8 + 8].copy_from_slice(&entry.to_le_bytes());
        }
        memory
            .write_slice(&pd, GuestAddress(pd_addr))
            .map_err(|e| Error::Memory(format!("write pd[{}]: {}", g, e)))?;
    }

    Ok(pml4_addr)
}

/// Size of the identity-map window the early page tables cover for a VM with
/// `ram_size` bytes of memory. The window never shrinks below 1 GiB so the
/// initramfs placement logic has room to work with.
pub fn identity_map_limit(ram_size: u64) -> u64 {
    ram_size.max(1 << 30)
}

/// The GPA of the MMIO slot for the `index`-th virtio device.
pub fn virtio_mmio_slot(index: usize) -> u64 {
    layout::VIRTIO_MMIO_BASE + (index as u64) * layout::VIRTIO_MMIO_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_memory() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 8 << 20)]).unwrap()
    }

    #[test]
    fn boot_regs_point_at_zero_page() {
        let regs = boot_regs(0x100_0200);
        assert_eq!(regs.rip, 0x100_0200);
        assert_eq!(regs.rsi, layout::BOOT_PARAMS_ADDR);
        assert_eq!(regs.rflags, 0x2);
    }

    #[test]
    fn page_tables_identity_map_first_gib() {
        let memory = test_memory();
        let cr3 = write_identity_page_tables(&memory, 128 << 20).unwrap();
        assert_eq!(cr3, layout::PAGE_TABLE_BASE);

        // PML4[0] points at the PDPT with P|W
        let mut buf = [0u8; 8];
        memory.read_slice(&mut buf, GuestAddress(cr3)).unwrap();
        assert_eq!(u64::from_le_bytes(buf), (cr3 + 0x1000) | 0x3);

        // PD entry 1 maps the second 2 MiB page as a huge page
        memory
            .read_slice(&mut buf, GuestAddress(cr3 + 0x2000 + 8))
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0x20_0000 | 0x83);
    }

    #[test]
    fn page_tables_grow_with_ram() {
        let memory = test_memory();
        write_identity_page_tables(&memory, 3 << 30).unwrap();

        // Three PDPT entries populated, fourth empty
        let mut buf = [0u8; 8];
        let pdpt = layout::PAGE_TABLE_BASE + 0x1000;
        for g in 0..3u64 {
            memory
                .read_slice(&mut buf, GuestAddress(pdpt + g * 8))
                .unwrap();
            assert_ne!(u64::from_le_bytes(buf), 0, "pdpt[{}] unset", g);
        }
        memory.read_slice(&mut buf, GuestAddress(pdpt + 3 * 8)).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0);
    }

    #[test]
    fn virtio_slots_do_not_overlap() {
        assert_eq!(virtio_mmio_slot(0), 0xD000_0000);
        assert_eq!(virtio_mmio_slot(1), 0xD000_1000);
    }
}
