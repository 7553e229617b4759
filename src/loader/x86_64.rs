//! x86_64 boot: bzImage/ELF loading, zero page, e820 map
//!
//! The setup header is read from the kernel blob itself so the guest sees
//! its own version/loadflags/init_size fields; loader-owned fields
//! (cmdline pointer, ramdisk, e820) are overridden on top. The vCPU enters
//! at the 64-bit entry point with page tables prebuilt by the arch helpers.

use std::io::Cursor;

use linux_loader::bootparam::{boot_e820_entry, boot_params};
use linux_loader::loader::bzimage::BzImage;
use linux_loader::loader::elf::Elf as ElfLoader;
use linux_loader::loader::KernelLoader;
use tracing::{debug, info};
use vm_memory::{Address, Bytes, ByteValued, GuestAddress};

use crate::arch::x86_64::layout;
use crate::loader::{BootSetup, LoadedKernel};
use crate::{Error, Result};

/// "HdrS" at file offset 0x202.
const BZIMAGE_MAGIC: u32 = 0x5372_6448;
/// File offset of the setup header within a bzImage.
const SETUP_HEADER_OFFSET: usize = 0x1F1;
/// File offset of setup_header.initrd_addr_max.
const INITRD_ADDR_MAX_OFFSET: usize = 0x22C;

const E820_RAM: u32 = 1;
const E820_RESERVED: u32 = 2;

pub fn load(setup: &BootSetup<'_>) -> Result<LoadedKernel> {
    let mut cursor = Cursor::new(setup.kernel);

    let is_bzimage = setup.kernel.len() > 0x206
        && u32::from_le_bytes(setup.kernel[0x202..0x206].try_into().unwrap()) == BZIMAGE_MAGIC;

    let (kernel_base, entry_point) = if is_bzimage {
        debug!("loading bzImage kernel");
        let result = BzImage::load(setup.memory, None, &mut cursor, None)
            .map_err(|e| Error::Boot(format!("bzImage load: {:?}", e)))?;
        let base = result.kernel_load.raw_value();
        // startup_64 sits 0x200 past the protected-mode entry.
        (base, base + 0x200)
    } else {
        debug!("loading ELF kernel");
        let result = ElfLoader::load(setup.memory, None, &mut cursor, None)
            .map_err(|e| Error::Boot(format!("ELF load: {:?}", e)))?;
        (result.kernel_load.raw_value(), result.kernel_end)
    };
    info!(
        base = format_args!("{:#x}", kernel_base),
        entry = format_args!("{:#x}", entry_point),
        "kernel loaded"
    );

    // Initramfs goes as high as the setup header, the early identity map,
    // and RAM allow, aligned down to 2 MiB.
    let initramfs = match setup.initramfs {
        Some(blob) if !blob.is_empty() => {
            let initrd_addr_max = if is_bzimage {
                u32::from_le_bytes(
                    setup.kernel[INITRD_ADDR_MAX_OFFSET..INITRD_ADDR_MAX_OFFSET + 4]
                        .try_into()
                        .unwrap(),
                ) as u64
            } else {
                u32::MAX as u64
            };
            let identity_limit =
                crate::arch::x86_64::identity_map_limit(setup.ram_size);
            let max_end = (setup.ram_size - 1)
                .min(initrd_addr_max)
                .min(identity_limit - 1)
                .min(layout::MMIO_GAP_START - 1);
            if blob.len() as u64 > max_end + 1 {
                return Err(Error::Boot(format!(
                    "initramfs too large ({} bytes) for placement window end {:#x}",
                    blob.len(),
                    max_end
                )));
            }
            let addr = (max_end + 1 - blob.len() as u64) & !0x1F_FFFF;
            setup
                .memory
                .write_slice(blob, GuestAddress(addr))
                .map_err(|e| Error::Boot(format!("initramfs write: {}", e)))?;
            debug!(
                addr = format_args!("{:#x}", addr),
                size = blob.len(),
                "initramfs placed"
            );
            Some((addr, blob.len() as u64))
        }
        _ => None,
    };

    write_boot_params(setup, is_bzimage, initramfs)?;

    Ok(LoadedKernel {
        entry_point,
        kernel_base,
        initramfs,
        dtb: None,
    })
}

fn write_boot_params(
    setup: &BootSetup<'_>,
    is_bzimage: bool,
    initramfs: Option<(u64, u64)>,
) -> Result<()> {
    // Command line, NUL-terminated.
    let cmdline = setup.cmdline.as_bytes();
    if cmdline.len() >= layout::CMDLINE_MAX_SIZE {
        return Err(Error::Boot("kernel command line too long".into()));
    }
    let mut terminated = cmdline.to_vec();
    terminated.push(0);
    setup
        .memory
        .write_slice(&terminated, GuestAddress(layout::CMDLINE_ADDR))
        .map_err(|e| Error::Boot(format!("cmdline write: {}", e)))?;

    let mut params = boot_params::default();

    // Copy the real setup header out of the kernel blob so version,
    // loadflags, and init_size are the kernel's own.
    if is_bzimage {
        let hdr_size = std::mem::size_of_val(&params.hdr);
        let src = setup
            .kernel
            .get(SETUP_HEADER_OFFSET..SETUP_HEADER_OFFSET + hdr_size)
            .ok_or_else(|| Error::Boot("kernel truncated before setup header".into()))?;
        // SAFETY: setup_header is a plain-old-data #[repr(C)] struct.
        let dst = unsafe {
            std::slice::from_raw_parts_mut(&mut params.hdr as *mut _ as *mut u8, hdr_size)
        };
        dst.copy_from_slice(src);
    }

    params.hdr.type_of_loader = 0xFF;
    params.hdr.cmd_line_ptr = layout::CMDLINE_ADDR as u32;
    params.hdr.cmdline_size = cmdline.len() as u32;
    if let Some((addr, size)) = initramfs {
        params.hdr.ramdisk_image = addr as u32;
        params.hdr.ramdisk_size = size as u32;
    }

    // e820: low RAM, reserved BIOS hole, high RAM below the MMIO gap, and
    // RAM above 4 GiB when present. The kernel wants at least two entries.
    let mut idx = 0usize;
    params.e820_table[idx] = boot_e820_entry {
        addr: 0,
        size: 0x9FC00,
        type_: E820_RAM,
    };
    idx += 1;
    params.e820_table[idx] = boot_e820_entry {
        addr: 0x9FC00,
        size: 0x100000 - 0x9FC00,
        type_: E820_RESERVED,
    };
    idx += 1;
    let low_end = setup.ram_size.min(layout::MMIO_GAP_START);
    if low_end > 0x100000 {
        params.e820_table[idx] = boot_e820_entry {
            addr: 0x100000,
            size: low_end - 0x100000,
            type_: E820_RAM,
        };
        idx += 1;
    }
    if setup.ram_size > layout::MMIO_GAP_START {
        params.e820_table[idx] = boot_e820_entry {
            addr: layout::MMIO_GAP_END,
            size: setup.ram_size - layout::MMIO_GAP_START,
            type_: E820_RAM,
        };
        idx += 1;
    }
    params.e820_entries = idx as u8;

    setup
        .memory
        .write_slice(params.as_slice(), GuestAddress(layout::BOOT_PARAMS_ADDR))
        .map_err(|e| Error::Boot(format!("boot params write: {}", e)))?;
    debug!(e820_entries = idx, "zero page written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_memory::GuestMemoryMmap;

    fn memory(size: u64) -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size as usize)]).unwrap()
    }

    fn setup_with<'a>(
        memory: &'a GuestMemoryMmap,
        kernel: &'a [u8],
        initramfs: Option<&'a [u8]>,
    ) -> BootSetup<'a> {
        BootSetup {
            memory,
            ram_base: 0,
            ram_size: 128 << 20,
            vcpu_count: 1,
            kernel,
            initramfs,
            cmdline: "console=ttyS0 reboot=k panic=1",
            device_nodes: &[],
        }
    }

    #[test]
    fn garbage_kernel_rejected() {
        let mem = memory(128 << 20);
        let setup = setup_with(&mem, b"\x00\x01\x02garbage", None);
        assert!(load(&setup).is_err());
    }

    #[test]
    fn cmdline_written_with_terminator() {
        let mem = memory(128 << 20);
        let setup = setup_with(&mem, b"", None);
        write_boot_params(&setup, false, None).unwrap();

        let mut buf = vec![0u8; setup.cmdline.len() + 1];
        mem.read_slice(&mut buf, GuestAddress(layout::CMDLINE_ADDR))
            .unwrap();
        assert_eq!(&buf[..setup.cmdline.len()], setup.cmdline.as_bytes());
        assert_eq!(buf[setup.cmdline.len()], 0);
    }

    #[test]
    fn overlong_cmdline_rejected() {
        let mem = memory(128 << 20);
        let long = "x".repeat(layout::CMDLINE_MAX_SIZE);
        let mut setup = setup_with(&mem, b"", None);
        setup.cmdline = &long;
        assert!(matches!(
            write_boot_params(&setup, false, None),
            Err(Error::Boot(_))
        ));
    }

    #[test]
    fn e820_covers_ram_below_gap() {
        let mem = memory(128 << 20);
        let setup = setup_with(&mem, b"", None);
        write_boot_params(&setup, false, Some((0x400_0000, 0x1000))).unwrap();

        // e820_entries at zero-page offset 0x1e8.
        let mut count = [0u8];
        mem.read_slice(&mut count, GuestAddress(layout::BOOT_PARAMS_ADDR + 0x1E8))
            .unwrap();
        assert_eq!(count[0], 3);

        // Third entry: high RAM from 1 MiB, size 127 MiB.
        let mut entry = [0u8; 20];
        mem.read_slice(
            &mut entry,
            GuestAddress(layout::BOOT_PARAMS_ADDR + 0x2D0 + 40),
        )
        .unwrap();
        assert_eq!(u64::from_le_bytes(entry[0..8].try_into().unwrap()), 0x100000);
        assert_eq!(
            u64::from_le_bytes(entry[8..16].try_into().unwrap()),
            (128 << 20) - 0x100000
        );
        assert_eq!(u32::from_le_bytes(entry[16..20].try_into().unwrap()), E820_RAM);

        // Ramdisk fields live in the setup header.
        let mut ramdisk = [0u8; 4];
        mem.read_slice(
            &mut ramdisk,
            GuestAddress(layout::BOOT_PARAMS_ADDR + 0x218),
        )
        .unwrap();
        assert_eq!(u32::from_le_bytes(ramdisk), 0x400_0000);
    }
}
