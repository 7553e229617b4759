//! fw_cfg firmware configuration device (MMIO flavor)
//!
//! Exposes named configuration files (`etc/ramfb`, `etc/acpi/*`, ...) to the
//! guest through a selector register, a data window, and the DMA interface.
//! The DMA control block lives in guest memory and is big-endian on the
//! wire, per the QEMU fw_cfg specification.

use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::chipset::{Device, MmioRange};
use crate::error::DeviceResult;
use crate::Result;

/// MMIO window: data (8 bytes), selector (2), DMA address (8).
pub const FW_CFG_BASE: u64 = 0xFED8_0000;
const OFF_DATA: u64 = 0x00;
const OFF_SELECTOR: u64 = 0x08;
const OFF_DMA_HI: u64 = 0x10;
const OFF_DMA_LO: u64 = 0x14;

/// Well-known selector keys.
const KEY_SIGNATURE: u16 = 0x0000;
const KEY_ID: u16 = 0x0001;
const KEY_FILE_DIR: u16 = 0x0019;
/// First key assigned to named files.
const KEY_FILE_BASE: u16 = 0x0020;

/// DMA control flags.
const DMA_ERROR: u32 = 1 << 0;
const DMA_READ: u32 = 1 << 1;
const DMA_SKIP: u32 = 1 << 2;
const DMA_SELECT: u32 = 1 << 3;
const DMA_WRITE: u32 = 1 << 4;

const SIGNATURE: &[u8; 4] = b"QEMU";
/// Feature bits: traditional interface + DMA.
const ID_FEATURES: u32 = 0x3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FwCfgFile {
    name: String,
    data: Vec<u8>,
    writable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FwCfgState {
    files: Vec<FwCfgFile>,
    selector: u16,
    /// Read cursor within the selected item.
    offset: usize,
    /// Staged high half of the DMA address.
    dma_addr_hi: u32,
}

impl FwCfgState {
    /// Bytes of the currently selected item.
    fn selected(&self) -> Vec<u8> {
        match self.selector {
            KEY_SIGNATURE => SIGNATURE.to_vec(),
            KEY_ID => {
                let mut buf = [0u8; 4];
                // The ID is read little-endian through the data port.
                buf.copy_from_slice(&ID_FEATURES.to_le_bytes());
                buf.to_vec()
            }
            KEY_FILE_DIR => self.file_directory(),
            key if key >= KEY_FILE_BASE => {
                let idx = (key - KEY_FILE_BASE) as usize;
                self.files.get(idx).map(|f| f.data.clone()).unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }

    /// The FileDir structure: big-endian count then 64-byte entries.
    fn file_directory(&self) -> Vec<u8> {
        let mut out = vec![0u8; 4];
        BigEndian::write_u32(&mut out, self.files.len() as u32);
        for (idx, file) in self.files.iter().enumerate() {
            let mut entry = [0u8; 64];
            BigEndian::write_u32(&mut entry[0..4], file.data.len() as u32);
            BigEndian::write_u16(&mut entry[4..6], KEY_FILE_BASE + idx as u16);
            let name = file.name.as_bytes();
            let n = name.len().min(55);
            entry[8..8 + n].copy_from_slice(&name[..n]);
            out.extend_from_slice(&entry);
        }
        out
    }
}

/// The chipset-facing fw_cfg device.
pub struct FwCfgDevice {
    state: Arc<Mutex<FwCfgState>>,
}

impl Default for FwCfgDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FwCfgDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FwCfgState {
                files: Vec::new(),
                selector: 0,
                offset: 0,
                dma_addr_hi: 0,
            })),
        }
    }

    /// Add (or replace) a named file.
    pub fn add_file(&self, name: &str, data: Vec<u8>, writable: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.files.iter_mut().find(|f| f.name == name) {
            existing.data = data;
            existing.writable = writable;
            return;
        }
        debug!(name, len = data.len(), "fw_cfg file added");
        state.files.push(FwCfgFile {
            name: name.to_string(),
            data,
            writable,
        });
    }

    /// Read back a file's current contents (picks up guest DMA writes).
    pub fn file_contents(&self, name: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.data.clone())
    }

    fn run_dma(&self, control_addr: u64, mem: &GuestMemoryMmap) {
        // Control block: u32 control, u32 length, u64 address, big-endian.
        let mut block = [0u8; 16];
        if mem.read_slice(&mut block, GuestAddress(control_addr)).is_err() {
            return;
        }
        let mut control = BigEndian::read_u32(&block[0..4]);
        let length = BigEndian::read_u32(&block[4..8]) as usize;
        let address = BigEndian::read_u64(&block[8..16]);

        let mut state = self.state.lock().unwrap();
        if control & DMA_SELECT != 0 {
            state.selector = (control >> 16) as u16;
            state.offset = 0;
        }

        let mut error = false;
        if control & DMA_READ != 0 {
            let data = state.selected();
            let start = state.offset.min(data.len());
            let end = (start + length).min(data.len());
            let mut chunk = data[start..end].to_vec();
            // Short reads pad with zeros per spec.
            chunk.resize(length, 0);
            if mem.write_slice(&chunk, GuestAddress(address)).is_err() {
                error = true;
            }
            state.offset = start + length;
        } else if control & DMA_WRITE != 0 {
            let mut chunk = vec![0u8; length];
            if mem.read_slice(&mut chunk, GuestAddress(address)).is_err() {
                error = true;
            } else {
                let selector = state.selector;
                let offset = state.offset;
                let written = match selector {
                    key if key >= KEY_FILE_BASE => {
                        let idx = (key - KEY_FILE_BASE) as usize;
                        match state.files.get_mut(idx) {
                            Some(f) if f.writable => {
                                let end = offset + chunk.len();
                                if f.data.len() < end {
                                    f.data.resize(end, 0);
                                }
                                f.data[offset..end].copy_from_slice(&chunk);
                                true
                            }
                            _ => false,
                        }
                    }
                    _ => false,
                };
                if !written {
                    error = true;
                }
                state.offset += length;
            }
        } else if control & DMA_SKIP != 0 {
            state.offset += length;
        }

        // Completion: clear all bits, or set the error bit.
        control = if error { DMA_ERROR } else { 0 };
        let mut done = [0u8; 4];
        BigEndian::write_u32(&mut done, control);
        let _ = mem.write_slice(&done, GuestAddress(control_addr));
    }
}

impl Device for FwCfgDevice {
    fn kind(&self) -> &'static str {
        "fw-cfg"
    }

    fn mmio_ranges(&self) -> Vec<MmioRange> {
        vec![MmioRange::new(FW_CFG_BASE, 0x18)]
    }

    fn mmio_read(&mut self, addr: u64, data: &mut [u8], _mem: &GuestMemoryMmap) -> DeviceResult {
        let offset = addr - FW_CFG_BASE;
        match offset {
            OFF_DATA => {
                let mut state = self.state.lock().unwrap();
                let bytes = state.selected();
                for slot in data.iter_mut() {
                    *slot = bytes.get(state.offset).copied().unwrap_or(0);
                    state.offset += 1;
                }
            }
            OFF_DMA_HI => {
                // Reading the DMA register returns the feature signature.
                let len = 4.min(data.len());
                BigEndian::write_u32(&mut data[..len], 0x51454d55); // "QEMU"
            }
            _ => data.fill(0),
        }
        Ok(())
    }

    fn mmio_write(&mut self, addr: u64, data: &[u8], mem: &GuestMemoryMmap) -> DeviceResult {
        let offset = addr - FW_CFG_BASE;
        match offset {
            OFF_SELECTOR => {
                // Selector is big-endian in the MMIO flavor.
                if data.len() >= 2 {
                    let mut state = self.state.lock().unwrap();
                    state.selector = BigEndian::read_u16(&data[..2]);
                    state.offset = 0;
                    trace!(selector = state.selector, "fw_cfg select");
                }
            }
            OFF_DMA_HI => {
                if data.len() >= 4 {
                    self.state.lock().unwrap().dma_addr_hi = BigEndian::read_u32(&data[..4]);
                }
            }
            OFF_DMA_LO => {
                if data.len() >= 4 {
                    let lo = BigEndian::read_u32(&data[..4]) as u64;
                    let hi = self.state.lock().unwrap().dma_addr_hi as u64;
                    self.run_dma((hi << 32) | lo, mem);
                    self.state.lock().unwrap().dma_addr_hi = 0;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(&*self.state.lock().unwrap())?)
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<()> {
        *self.state.lock().unwrap() = postcard::from_bytes(blob)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap()
    }

    fn select(dev: &mut FwCfgDevice, key: u16, memory: &GuestMemoryMmap) {
        let mut sel = [0u8; 2];
        BigEndian::write_u16(&mut sel, key);
        dev.mmio_write(FW_CFG_BASE + OFF_SELECTOR, &sel, memory)
            .unwrap();
    }

    #[test]
    fn signature_readable_bytewise() {
        let mut dev = FwCfgDevice::new();
        let memory = mem();
        select(&mut dev, KEY_SIGNATURE, &memory);
        let mut out = [0u8; 4];
        for slot in out.iter_mut() {
            let mut b = [0u8];
            dev.mmio_read(FW_CFG_BASE + OFF_DATA, &mut b, &memory).unwrap();
            *slot = b[0];
        }
        assert_eq!(&out, SIGNATURE);
    }

    #[test]
    fn file_directory_lists_named_files() {
        let mut dev = FwCfgDevice::new();
        dev.add_file("etc/ramfb", vec![0; 28], true);
        dev.add_file("etc/acpi/tables", vec![1, 2, 3], false);

        let memory = mem();
        select(&mut dev, KEY_FILE_DIR, &memory);
        let dir = dev.state.lock().unwrap().file_directory();
        assert_eq!(BigEndian::read_u32(&dir[0..4]), 2);
        // First entry: size 28, key 0x20, name at +8.
        assert_eq!(BigEndian::read_u32(&dir[4..8]), 28);
        assert_eq!(BigEndian::read_u16(&dir[8..10]), KEY_FILE_BASE);
        assert!(dir[12..].starts_with(b"etc/ramfb\0"));
    }

    #[test]
    fn dma_read_transfers_file_to_guest() {
        let mut dev = FwCfgDevice::new();
        dev.add_file("etc/test", b"hello fw_cfg".to_vec(), false);
        let memory = mem();

        // Control block at 0x1000: select key 0x20 + read 12 bytes to 0x2000.
        let mut block = [0u8; 16];
        BigEndian::write_u32(
            &mut block[0..4],
            DMA_READ | DMA_SELECT | ((KEY_FILE_BASE as u32) << 16),
        );
        BigEndian::write_u32(&mut block[4..8], 12);
        BigEndian::write_u64(&mut block[8..16], 0x2000);
        memory.write_slice(&block, GuestAddress(0x1000)).unwrap();

        let mut lo = [0u8; 4];
        BigEndian::write_u32(&mut lo, 0x1000);
        dev.mmio_write(FW_CFG_BASE + OFF_DMA_LO, &lo, &memory).unwrap();

        let mut out = [0u8; 12];
        memory.read_slice(&mut out, GuestAddress(0x2000)).unwrap();
        assert_eq!(&out, b"hello fw_cfg");

        // Control word cleared on success.
        let mut done = [0u8; 4];
        memory.read_slice(&mut done, GuestAddress(0x1000)).unwrap();
        assert_eq!(BigEndian::read_u32(&done), 0);
    }

    #[test]
    fn dma_write_updates_writable_file() {
        let mut dev = FwCfgDevice::new();
        dev.add_file("etc/ramfb", vec![0; 8], true);
        let memory = mem();
        memory.write_slice(b"RAMFBCFG", GuestAddress(0x3000)).unwrap();

        let mut block = [0u8; 16];
        BigEndian::write_u32(
            &mut block[0..4],
            DMA_WRITE | DMA_SELECT | ((KEY_FILE_BASE as u32) << 16),
        );
        BigEndian::write_u32(&mut block[4..8], 8);
        BigEndian::write_u64(&mut block[8..16], 0x3000);
        memory.write_slice(&block, GuestAddress(0x1000)).unwrap();

        let mut lo = [0u8; 4];
        BigEndian::write_u32(&mut lo, 0x1000);
        dev.mmio_write(FW_CFG_BASE + OFF_DMA_LO, &lo, &memory).unwrap();

        assert_eq!(dev.file_contents("etc/ramfb").unwrap(), b"RAMFBCFG");
    }

    #[test]
    fn dma_write_readonly_file_sets_error() {
        let mut dev = FwCfgDevice::new();
        dev.add_file("etc/ro", vec![0; 4], false);
        let memory = mem();

        let mut block = [0u8; 16];
        BigEndian::write_u32(
            &mut block[0..4],
            DMA_WRITE | DMA_SELECT | ((KEY_FILE_BASE as u32) << 16),
        );
        BigEndian::write_u32(&mut block[4..8], 4);
        BigEndian::write_u64(&mut block[8..16], 0x3000);
        memory.write_slice(&block, GuestAddress(0x1000)).unwrap();

        let mut lo = [0u8; 4];
        BigEndian::write_u32(&mut lo, 0x1000);
        dev.mmio_write(FW_CFG_BASE + OFF_DMA_LO, &lo, &memory).unwrap();

        let mut done = [0u8; 4];
        memory.read_slice(&mut done, GuestAddress(0x1000)).unwrap();
        assert_eq!(BigEndian::read_u32(&done), DMA_ERROR);
    }

    #[test]
    fn dma_skip_advances_cursor() {
        let mut dev = FwCfgDevice::new();
        dev.add_file("etc/test", b"abcdef".to_vec(), false);
        let memory = mem();
        select(&mut dev, KEY_FILE_BASE, &memory);

        let mut block = [0u8; 16];
        BigEndian::write_u32(&mut block[0..4], DMA_SKIP);
        BigEndian::write_u32(&mut block[4..8], 3);
        memory.write_slice(&block, GuestAddress(0x1000)).unwrap();
        let mut lo = [0u8; 4];
        BigEndian::write_u32(&mut lo, 0x1000);
        dev.mmio_write(FW_CFG_BASE + OFF_DMA_LO, &lo, &memory).unwrap();

        let mut b = [0u8];
        dev.mmio_read(FW_CFG_BASE + OFF_DATA, &mut b, &memory).unwrap();
        assert_eq!(b[0], b'd');
    }
}
