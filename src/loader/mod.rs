//! Kernel loading and boot artifact construction
//!
//! Parses the supplied kernel blob (bzImage/ELF for x86_64, Image for
//! arm64, raw for riscv64), lays out guest memory, and builds the
//! per-architecture hand-off: zero page + e820 on x86, a generated flat
//! device tree elsewhere. Devices contribute tree fragments through
//! [`crate::chipset::DtNode`]; the loader merges them under the root.

pub mod aarch64;
pub mod riscv64;
pub mod x86_64;

use vm_memory::GuestMemoryMmap;

use crate::arch::Architecture;
use crate::chipset::DtNode;
use crate::Result;

/// Where the loaded kernel wants execution to start.
#[derive(Debug, Clone, Copy)]
pub struct LoadedKernel {
    pub entry_point: u64,
    pub kernel_base: u64,
    /// (base, size) of the loaded initramfs, when one was supplied.
    pub initramfs: Option<(u64, u64)>,
    /// DTB address for FDT-booted architectures.
    pub dtb: Option<u64>,
}

/// Everything the per-arch loaders need in one bag.
pub struct BootSetup<'a> {
    pub memory: &'a GuestMemoryMmap,
    pub ram_base: u64,
    pub ram_size: u64,
    pub vcpu_count: usize,
    pub kernel: &'a [u8],
    pub initramfs: Option<&'a [u8]>,
    pub cmdline: &'a str,
    /// Device tree fragments collected from the chipset.
    pub device_nodes: &'a [DtNode],
}

/// Load the kernel and build boot artifacts for `arch`.
pub fn load(arch: Architecture, setup: &BootSetup<'_>) -> Result<LoadedKernel> {
    match arch {
        Architecture::X86_64 => x86_64::load(setup),
        Architecture::Aarch64 => aarch64::load(setup),
        Architecture::Riscv64 => riscv64::load(setup),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_memory::GuestAddress;

    #[test]
    fn dispatches_to_arch_loader() {
        // A garbage blob must fail cleanly on every architecture.
        let memory =
            GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 16 << 20)]).unwrap();
        let setup = BootSetup {
            memory: &memory,
            ram_base: 0,
            ram_size: 16 << 20,
            vcpu_count: 1,
            kernel: b"not a kernel",
            initramfs: None,
            cmdline: "console=ttyS0",
            device_nodes: &[],
        };
        assert!(load(Architecture::X86_64, &setup).is_err());
    }
}
