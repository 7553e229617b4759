//! aarch64 boot setup: EL1 entry state, PSCI and GIC constants

/// Memory layout for arm64 guests.
pub mod layout {
    /// Guest RAM begins at 1 GiB, leaving the low window for MMIO.
    pub const RAM_BASE: u64 = 0x4000_0000;
    /// Kernel Image load offset from RAM base (`text_offset` default).
    pub const KERNEL_OFFSET: u64 = 0x8_0000;
    /// Device tree blob placed at the top of the first 128 MiB of RAM.
    pub const FDT_OFFSET: u64 = 0x7F0_0000;
    /// Maximum size we allow the generated FDT to occupy.
    pub const FDT_MAX_SIZE: usize = 0x1_0000;
    /// GIC-v3 distributor
    pub const GICD_BASE: u64 = 0x0800_0000;
    pub const GICD_SIZE: u64 = 0x1_0000;
    /// GIC-v3 redistributor (one 128 KiB frame per vCPU)
    pub const GICR_BASE: u64 = 0x080A_0000;
    pub const GICR_STRIDE: u64 = 0x2_0000;
    /// Virtio MMIO device slots
    pub const VIRTIO_MMIO_BASE: u64 = 0x0A00_0000;
    pub const VIRTIO_MMIO_SIZE: u64 = 0x1000;
    /// First SPI handed to virtio devices (SPIs start at interrupt 32).
    pub const VIRTIO_IRQ_BASE: u32 = 32 + 16;
    /// UART (PL011-compatible window, served by the 16550 shim)
    pub const UART_BASE: u64 = 0x0900_0000;
    /// Architected timer PPI numbers (virt, phys)
    pub const TIMER_PPI_VIRT: u32 = 27;
    pub const TIMER_PPI_PHYS: u32 = 30;
}

/// PSCI v0.2 function IDs, conduit HVC.
pub mod psci {
    pub const VERSION: u32 = 0x8400_0000;
    pub const SYSTEM_OFF: u32 = 0x8400_0008;
    pub const SYSTEM_RESET: u32 = 0x8400_0009;
    pub const CPU_ON_64: u32 = 0xC400_0003;
}

/// PSTATE for entering the kernel: EL1h with all interrupts masked
/// (D, A, I, F set).
pub const PSTATE_EL1H_MASKED: u64 = 0x3C5;

/// Register file an arm64 vCPU starts from: PC at the kernel entry, x0
/// holding the DTB address, everything else zero per the Linux boot protocol.
#[derive(Debug, Clone, Copy)]
pub struct BootRegs {
    pub pc: u64,
    pub x0_dtb: u64,
    pub pstate: u64,
}

pub fn boot_regs(kernel_entry: u64, dtb_addr: u64) -> BootRegs {
    BootRegs {
        pc: kernel_entry,
        x0_dtb: dtb_addr,
        pstate: PSTATE_EL1H_MASKED,
    }
}

/// The GPA of the MMIO slot for the `index`-th virtio device.
pub fn virtio_mmio_slot(index: usize) -> u64 {
    layout::VIRTIO_MMIO_BASE + (index as u64) * layout::VIRTIO_MMIO_SIZE
}

/// Where the generated device tree lands in guest memory.
pub fn fdt_address() -> u64 {
    layout::RAM_BASE + layout::FDT_OFFSET
}

/// Where the kernel Image is placed (RAM base + text_offset).
pub fn kernel_address(text_offset: u64) -> u64 {
    layout::RAM_BASE + if text_offset != 0 { text_offset } else { layout::KERNEL_OFFSET }
}
