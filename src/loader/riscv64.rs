//! riscv64 boot: raw image + DTB for direct S-mode entry
//!
//! The kernel blob is copied verbatim to RAM base + 2 MiB; the DTB sits in
//! low memory below it. Entry is S-mode with a0 = hartid, a1 = DTB.

use tracing::info;
use vm_fdt::FdtWriter;
use vm_memory::{Bytes, GuestAddress};

use crate::arch::riscv64::{self, layout};
use crate::loader::{BootSetup, LoadedKernel};
use crate::{Error, Result};

pub fn load(setup: &BootSetup<'_>) -> Result<LoadedKernel> {
    if setup.kernel.is_empty() {
        return Err(Error::Boot("empty riscv64 kernel image".into()));
    }
    let kernel_base = riscv64::kernel_address();
    setup
        .memory
        .write_slice(setup.kernel, GuestAddress(kernel_base))
        .map_err(|e| Error::Boot(format!("kernel write: {}", e)))?;
    info!(base = format_args!("{:#x}", kernel_base), "riscv64 kernel loaded");

    let initramfs = match setup.initramfs {
        Some(blob) if !blob.is_empty() => {
            let addr = (kernel_base + setup.kernel.len() as u64 + 0x1F_FFFF) & !0x1F_FFFF;
            setup
                .memory
                .write_slice(blob, GuestAddress(addr))
                .map_err(|e| Error::Boot(format!("initramfs write: {}", e)))?;
            Some((addr, blob.len() as u64))
        }
        _ => None,
    };

    let dtb = build_fdt(setup, initramfs)?;
    if dtb.len() > layout::FDT_MAX_SIZE {
        return Err(Error::Boot(format!("FDT too large: {} bytes", dtb.len())));
    }
    let dtb_addr = riscv64::fdt_address();
    setup
        .memory
        .write_slice(&dtb, GuestAddress(dtb_addr))
        .map_err(|e| Error::Boot(format!("dtb write: {}", e)))?;

    Ok(LoadedKernel {
        entry_point: kernel_base,
        kernel_base,
        initramfs,
        dtb: Some(dtb_addr),
    })
}

fn fdt_err(e: vm_fdt::Error) -> Error {
    Error::Boot(format!("fdt: {}", e))
}

fn build_fdt(setup: &BootSetup<'_>, initramfs: Option<(u64, u64)>) -> Result<Vec<u8>> {
    let mut fdt = FdtWriter::new().map_err(fdt_err)?;
    let root = fdt.begin_node("").map_err(fdt_err)?;
    fdt.property_string("compatible", "riscv-virtio").map_err(fdt_err)?;
    fdt.property_u32("#address-cells", 2).map_err(fdt_err)?;
    fdt.property_u32("#size-cells", 2).map_err(fdt_err)?;

    let chosen = fdt.begin_node("chosen").map_err(fdt_err)?;
    fdt.property_string("bootargs", setup.cmdline).map_err(fdt_err)?;
    if let Some((base, size)) = initramfs {
        fdt.property_u64("linux,initrd-start", base).map_err(fdt_err)?;
        fdt.property_u64("linux,initrd-end", base + size)
            .map_err(fdt_err)?;
    }
    fdt.end_node(chosen).map_err(fdt_err)?;

    let memory = fdt.begin_node("memory@80000000").map_err(fdt_err)?;
    fdt.property_string("device_type", "memory").map_err(fdt_err)?;
    fdt.property_array_u64("reg", &[setup.ram_base, setup.ram_size])
        .map_err(fdt_err)?;
    fdt.end_node(memory).map_err(fdt_err)?;

    let cpus = fdt.begin_node("cpus").map_err(fdt_err)?;
    fdt.property_u32("#address-cells", 1).map_err(fdt_err)?;
    fdt.property_u32("#size-cells", 0).map_err(fdt_err)?;
    fdt.property_u32("timebase-frequency", 10_000_000)
        .map_err(fdt_err)?;
    for cpu in 0..setup.vcpu_count {
        let node = fdt.begin_node(&format!("cpu@{}", cpu)).map_err(fdt_err)?;
        fdt.property_string("device_type", "cpu").map_err(fdt_err)?;
        fdt.property_string("compatible", "riscv").map_err(fdt_err)?;
        fdt.property_string("riscv,isa", "rv64imafdc").map_err(fdt_err)?;
        fdt.property_string("mmu-type", "riscv,sv48").map_err(fdt_err)?;
        fdt.property_u32("reg", cpu as u32).map_err(fdt_err)?;
        let intc = fdt.begin_node("interrupt-controller").map_err(fdt_err)?;
        fdt.property_string("compatible", "riscv,cpu-intc").map_err(fdt_err)?;
        fdt.property_u32("#interrupt-cells", 1).map_err(fdt_err)?;
        fdt.property_null("interrupt-controller").map_err(fdt_err)?;
        fdt.end_node(intc).map_err(fdt_err)?;
        fdt.end_node(node).map_err(fdt_err)?;
    }
    fdt.end_node(cpus).map_err(fdt_err)?;

    for node in setup.device_nodes {
        let (base, size) = node.reg.first().copied().unwrap_or((0, 0));
        let name = format!("{}@{:x}", node.name, base);
        let handle = fdt.begin_node(&name).map_err(fdt_err)?;
        fdt.property_string("compatible", &node.compatible)
            .map_err(fdt_err)?;
        if size > 0 {
            let mut reg = Vec::new();
            for (b, s) in &node.reg {
                reg.push(*b);
                reg.push(*s);
            }
            fdt.property_array_u64("reg", &reg).map_err(fdt_err)?;
        }
        if !node.interrupts.is_empty() {
            fdt.property_array_u32("interrupts", &node.interrupts)
                .map_err(fdt_err)?;
        }
        for (key, value) in &node.props {
            fdt.property_string(key, value).map_err(fdt_err)?;
        }
        fdt.end_node(handle).map_err(fdt_err)?;
    }

    fdt.end_node(root).map_err(fdt_err)?;
    fdt.finish().map_err(fdt_err)
}
