//! arm64 boot: Image header parsing and flat device tree generation
//!
//! The Image header carries magic `ARM\x64` at offset 0x38 and `text_offset`
//! at 0x08; the kernel lands at RAM base + text_offset. The generated FDT
//! describes memory, cpus (PSCI via HVC), the GIC-v3
//! distributor/redistributor pair, the architected timer, and every device
//! node the chipset contributed.

use tracing::{debug, info};
use vm_fdt::FdtWriter;
use vm_memory::{Bytes, GuestAddress};

use crate::arch::aarch64::{self, layout};
use crate::loader::{BootSetup, LoadedKernel};
use crate::{Error, Result};

/// "ARM\x64" little-endian at offset 0x38.
const IMAGE_MAGIC: u32 = 0x644D_5241;
const MAGIC_OFFSET: usize = 0x38;
const TEXT_OFFSET_OFFSET: usize = 0x08;

/// GIC interrupt specifier cells.
const GIC_SPI: u32 = 0;
const GIC_PPI: u32 = 1;
const IRQ_TYPE_LEVEL_HIGH: u32 = 4;
const IRQ_TYPE_EDGE_RISING: u32 = 1;

pub fn load(setup: &BootSetup<'_>) -> Result<LoadedKernel> {
    if setup.kernel.len() < MAGIC_OFFSET + 4 {
        return Err(Error::Boot("kernel too small for Image header".into()));
    }
    let magic = u32::from_le_bytes(
        setup.kernel[MAGIC_OFFSET..MAGIC_OFFSET + 4]
            .try_into()
            .unwrap(),
    );
    if magic != IMAGE_MAGIC {
        return Err(Error::Boot(format!(
            "bad arm64 Image magic {:#x}",
            magic
        )));
    }
    let text_offset = u64::from_le_bytes(
        setup.kernel[TEXT_OFFSET_OFFSET..TEXT_OFFSET_OFFSET + 8]
            .try_into()
            .unwrap(),
    );

    let kernel_base = aarch64::kernel_address(text_offset);
    setup
        .memory
        .write_slice(setup.kernel, GuestAddress(kernel_base))
        .map_err(|e| Error::Boot(format!("kernel write: {}", e)))?;
    info!(
        base = format_args!("{:#x}", kernel_base),
        text_offset = format_args!("{:#x}", text_offset),
        "arm64 Image loaded"
    );

    // Initramfs just above the kernel image, page aligned.
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
    let dtb_addr = aarch64::fdt_address();
    if dtb.len() > layout::FDT_MAX_SIZE {
        return Err(Error::Boot(format!(
            "generated FDT too large: {} bytes",
            dtb.len()
        )));
    }
    setup
        .memory
        .write_slice(&dtb, GuestAddress(dtb_addr))
        .map_err(|e| Error::Boot(format!("dtb write: {}", e)))?;
    debug!(size = dtb.len(), addr = format_args!("{:#x}", dtb_addr), "FDT written");

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
    fdt.property_string("compatible", "linux,dummy-virt")
        .map_err(fdt_err)?;
    fdt.property_u32("#address-cells", 2).map_err(fdt_err)?;
    fdt.property_u32("#size-cells", 2).map_err(fdt_err)?;
    fdt.property_u32("interrupt-parent", 1).map_err(fdt_err)?;

    // chosen: bootargs + initrd window.
    let chosen = fdt.begin_node("chosen").map_err(fdt_err)?;
    fdt.property_string("bootargs", setup.cmdline).map_err(fdt_err)?;
    if let Some((base, size)) = initramfs {
        fdt.property_u64("linux,initrd-start", base).map_err(fdt_err)?;
        fdt.property_u64("linux,initrd-end", base + size)
            .map_err(fdt_err)?;
    }
    fdt.end_node(chosen).map_err(fdt_err)?;

    // memory
    let memory = fdt.begin_node("memory@40000000").map_err(fdt_err)?;
    fdt.property_string("device_type", "memory").map_err(fdt_err)?;
    fdt.property_array_u64("reg", &[setup.ram_base, setup.ram_size])
        .map_err(fdt_err)?;
    fdt.end_node(memory).map_err(fdt_err)?;

    // cpus with PSCI enable-method.
    let cpus = fdt.begin_node("cpus").map_err(fdt_err)?;
    fdt.property_u32("#address-cells", 1).map_err(fdt_err)?;
    fdt.property_u32("#size-cells", 0).map_err(fdt_err)?;
    for cpu in 0..setup.vcpu_count {
        let node = fdt
            .begin_node(&format!("cpu@{}", cpu))
            .map_err(fdt_err)?;
        fdt.property_string("device_type", "cpu").map_err(fdt_err)?;
        fdt.property_string("compatible", "arm,arm-v8").map_err(fdt_err)?;
        fdt.property_string("enable-method", "psci").map_err(fdt_err)?;
        fdt.property_u32("reg", cpu as u32).map_err(fdt_err)?;
        fdt.end_node(node).map_err(fdt_err)?;
    }
    fdt.end_node(cpus).map_err(fdt_err)?;

    // psci over hvc.
    let psci = fdt.begin_node("psci").map_err(fdt_err)?;
    fdt.property_string("compatible", "arm,psci-0.2").map_err(fdt_err)?;
    fdt.property_string("method", "hvc").map_err(fdt_err)?;
    fdt.end_node(psci).map_err(fdt_err)?;

    // GIC-v3: distributor + one redistributor frame per vCPU.
    let gic = fdt
        .begin_node(&format!("intc@{:x}", layout::GICD_BASE))
        .map_err(fdt_err)?;
    fdt.property_string("compatible", "arm,gic-v3").map_err(fdt_err)?;
    fdt.property_u32("#interrupt-cells", 3).map_err(fdt_err)?;
    fdt.property_null("interrupt-controller").map_err(fdt_err)?;
    fdt.property_array_u64(
        "reg",
        &[
            layout::GICD_BASE,
            layout::GICD_SIZE,
            layout::GICR_BASE,
            layout::GICR_STRIDE * setup.vcpu_count as u64,
        ],
    )
    .map_err(fdt_err)?;
    fdt.property_u32("phandle", 1).map_err(fdt_err)?;
    fdt.end_node(gic).map_err(fdt_err)?;

    // Architected timer PPIs.
    let timer = fdt.begin_node("timer").map_err(fdt_err)?;
    fdt.property_string("compatible", "arm,armv8-timer").map_err(fdt_err)?;
    fdt.property_array_u32(
        "interrupts",
        &[
            GIC_PPI,
            layout::TIMER_PPI_PHYS - 16,
            IRQ_TYPE_LEVEL_HIGH,
            GIC_PPI,
            layout::TIMER_PPI_VIRT - 16,
            IRQ_TYPE_LEVEL_HIGH,
        ],
    )
    .map_err(fdt_err)?;
    fdt.end_node(timer).map_err(fdt_err)?;

    // Device-contributed nodes, merged under the root with unit addresses.
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
            let mut cells = Vec::new();
            for &pin in &node.interrupts {
                // Pins at or above 32 are SPIs; the specifier counts from 32.
                cells.push(GIC_SPI);
                cells.push(pin.saturating_sub(32));
                cells.push(IRQ_TYPE_EDGE_RISING);
            }
            fdt.property_array_u32("interrupts", &cells).map_err(fdt_err)?;
        }
        for (key, value) in &node.props {
            fdt.property_string(key, value).map_err(fdt_err)?;
        }
        fdt.end_node(handle).map_err(fdt_err)?;
    }

    fdt.end_node(root).map_err(fdt_err)?;
    fdt.finish().map_err(fdt_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chipset::DtNode;
    use vm_memory::GuestMemoryMmap;

    fn fake_image(text_offset: u64) -> Vec<u8> {
        let mut image = vec![0u8; 0x1000];
        image[TEXT_OFFSET_OFFSET..TEXT_OFFSET_OFFSET + 8]
            .copy_from_slice(&text_offset.to_le_bytes());
        image[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&IMAGE_MAGIC.to_le_bytes());
        image
    }

    fn arm_memory() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(layout::RAM_BASE), 256 << 20)]).unwrap()
    }

    #[test]
    fn image_magic_checked() {
        let memory = arm_memory();
        let setup = BootSetup {
            memory: &memory,
            ram_base: layout::RAM_BASE,
            ram_size: 256 << 20,
            vcpu_count: 1,
            kernel: &[0u8; 0x100],
            initramfs: None,
            cmdline: "console=hvc0",
            device_nodes: &[],
        };
        assert!(load(&setup).is_err());
    }

    #[test]
    fn kernel_placed_at_text_offset() {
        let memory = arm_memory();
        let image = fake_image(0x8_0000);
        let setup = BootSetup {
            memory: &memory,
            ram_base: layout::RAM_BASE,
            ram_size: 256 << 20,
            vcpu_count: 2,
            kernel: &image,
            initramfs: Some(b"initrd-bytes"),
            cmdline: "console=hvc0",
            device_nodes: &[DtNode {
                name: "virtio_mmio".into(),
                compatible: "virtio,mmio".into(),
                reg: vec![(layout::VIRTIO_MMIO_BASE, layout::VIRTIO_MMIO_SIZE)],
                interrupts: vec![layout::VIRTIO_IRQ_BASE],
                props: vec![],
            }],
        };
        let loaded = load(&setup).unwrap();
        assert_eq!(loaded.entry_point, layout::RAM_BASE + 0x8_0000);
        assert!(loaded.dtb.is_some());
        let (initrd_base, initrd_size) = loaded.initramfs.unwrap();
        assert_eq!(initrd_size, 12);
        assert!(initrd_base > loaded.kernel_base);

        // The DTB landed in guest memory with the FDT magic.
        let mut magic = [0u8; 4];
        memory
            .read_slice(&mut magic, GuestAddress(loaded.dtb.unwrap()))
            .unwrap();
        assert_eq!(u32::from_be_bytes(magic), 0xD00D_FEED);
    }

    #[test]
    fn fdt_contains_bootargs() {
        let memory = arm_memory();
        let setup = BootSetup {
            memory: &memory,
            ram_base: layout::RAM_BASE,
            ram_size: 256 << 20,
            vcpu_count: 1,
            kernel: &[],
            initramfs: None,
            cmdline: "console=hvc0 quiet",
            device_nodes: &[],
        };
        let dtb = build_fdt(&setup, None).unwrap();
        let needle = b"console=hvc0 quiet\0";
        assert!(dtb.windows(needle.len()).any(|w| w == needle));
    }
}
