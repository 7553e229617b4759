//! virtio-blk (device id 2)
//!
//! Single request queue. Each request is a 16-byte header {type, reserved,
//! sector}, data buffers in 512-byte sectors, and a trailing status byte
//! (OK / IOERR / UNSUPP). FLUSH requests are honored by forwarding to the
//! backend before completing.

use std::fs::File;
use std::io;
use std::path::Path;

use tracing::{trace, warn};
use vm_memory::GuestMemoryMmap;

use crate::virtio::{device_id, features, NotifyOutcome, Virtqueue, VirtioDevice};
use crate::{Error, Result};

pub const SECTOR_SIZE: usize = 512;

/// Request types.
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;
const VIRTIO_BLK_T_GET_ID: u32 = 8;

/// Status byte values.
const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Feature bits.
const VIRTIO_BLK_F_RO: u64 = 1 << 5;
const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;

/// Storage behind the block device.
pub trait BlockBackend: Send {
    fn capacity_sectors(&self) -> u64;
    fn read(&mut self, sector: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write(&mut self, sector: u64, data: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    fn is_read_only(&self) -> bool {
        false
    }
}

/// File-backed disk.
pub struct FileBackend {
    file: File,
    sectors: u64,
    read_only: bool,
}

impl FileBackend {
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| Error::io("open", path.display().to_string(), e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::io("stat", path.display().to_string(), e))?
            .len();
        Ok(Self {
            file,
            sectors: len / SECTOR_SIZE as u64,
            read_only,
        })
    }
}

impl BlockBackend for FileBackend {
    fn capacity_sectors(&self) -> u64 {
        self.sectors
    }

    fn read(&mut self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, sector * SECTOR_SIZE as u64)
    }

    fn write(&mut self, sector: u64, data: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(data, sector * SECTOR_SIZE as u64)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// RAM-backed disk, used by tests and throwaway scratch disks.
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new(sectors: u64) -> Self {
        Self {
            data: vec![0; sectors as usize * SECTOR_SIZE],
        }
    }
}

impl BlockBackend for MemBackend {
    fn capacity_sectors(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn read(&mut self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = sector as usize * SECTOR_SIZE;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "past end"));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write(&mut self, sector: u64, data: &[u8]) -> io::Result<()> {
        let start = sector as usize * SECTOR_SIZE;
        let end = start + data.len();
        if end > self.data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "past end"));
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The virtio block device.
pub struct Block {
    backend: Box<dyn BlockBackend>,
    serial: String,
}

impl Block {
    pub fn new(backend: Box<dyn BlockBackend>, serial: &str) -> Self {
        Self {
            backend,
            serial: serial.to_string(),
        }
    }

    fn process_chain(
        &mut self,
        chain: &crate::virtio::DescChain,
        mem: &GuestMemoryMmap,
    ) -> Result<u32> {
        let header = chain.read_all(mem)?;
        if header.len() < 16 {
            warn!("virtio-blk request shorter than header");
            return self.finish(chain, mem, 0, VIRTIO_BLK_S_IOERR);
        }
        let req_type = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let sector = u64::from_le_bytes(header[8..16].try_into().unwrap());
        trace!(req_type, sector, "virtio-blk request");

        match req_type {
            VIRTIO_BLK_T_IN => {
                // Writable suffix is data + 1 status byte.
                let data_len = chain.writable_len().saturating_sub(1);
                if data_len % SECTOR_SIZE != 0 {
                    return self.finish(chain, mem, 0, VIRTIO_BLK_S_IOERR);
                }
                let mut buf = vec![0u8; data_len];
                match self.backend.read(sector, &mut buf) {
                    Ok(()) => {
                        chain.write_at(mem, 0, &buf)?;
                        self.finish(chain, mem, data_len as u32, VIRTIO_BLK_S_OK)
                    }
                    Err(e) => {
                        warn!("virtio-blk read error at sector {}: {}", sector, e);
                        self.finish(chain, mem, 0, VIRTIO_BLK_S_IOERR)
                    }
                }
            }
            VIRTIO_BLK_T_OUT => {
                if self.backend.is_read_only() {
                    return self.finish(chain, mem, 0, VIRTIO_BLK_S_IOERR);
                }
                let data = &header[16..];
                if data.len() % SECTOR_SIZE != 0 {
                    return self.finish(chain, mem, 0, VIRTIO_BLK_S_IOERR);
                }
                match self.backend.write(sector, data) {
                    Ok(()) => self.finish(chain, mem, 0, VIRTIO_BLK_S_OK),
                    Err(e) => {
                        warn!("virtio-blk write error at sector {}: {}", sector, e);
                        self.finish(chain, mem, 0, VIRTIO_BLK_S_IOERR)
                    }
                }
            }
            VIRTIO_BLK_T_FLUSH => match self.backend.flush() {
                Ok(()) => self.finish(chain, mem, 0, VIRTIO_BLK_S_OK),
                Err(e) => {
                    warn!("virtio-blk flush error: {}", e);
                    self.finish(chain, mem, 0, VIRTIO_BLK_S_IOERR)
                }
            },
            VIRTIO_BLK_T_GET_ID => {
                let mut id = [0u8; 20];
                let bytes = self.serial.as_bytes();
                let n = bytes.len().min(20);
                id[..n].copy_from_slice(&bytes[..n]);
                chain.write_at(mem, 0, &id)?;
                self.finish(chain, mem, 20, VIRTIO_BLK_S_OK)
            }
            other => {
                trace!(req_type = other, "virtio-blk unsupported request");
                self.finish(chain, mem, 0, VIRTIO_BLK_S_UNSUPP)
            }
        }
    }

    /// Write the status byte at the tail and report total bytes written.
    fn finish(
        &self,
        chain: &crate::virtio::DescChain,
        mem: &GuestMemoryMmap,
        data_written: u32,
        status: u8,
    ) -> Result<u32> {
        let status_offset = chain.writable_len().saturating_sub(1);
        chain.write_at(mem, status_offset, &[status])?;
        Ok(data_written + 1)
    }
}

impl VirtioDevice for Block {
    fn device_id(&self) -> u32 {
        device_id::BLOCK
    }

    fn device_features(&self) -> u64 {
        let mut feats = features::VERSION_1 | VIRTIO_BLK_F_FLUSH;
        if self.backend.is_read_only() {
            feats |= VIRTIO_BLK_F_RO;
        }
        feats
    }

    fn queue_max_sizes(&self) -> Vec<u16> {
        vec![256]
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        let capacity = self.backend.capacity_sectors().to_le_bytes();
        for (i, slot) in data.iter_mut().enumerate() {
            *slot = capacity.get(offset as usize + i).copied().unwrap_or(0);
        }
    }

    fn handle_notify(
        &mut self,
        queue: usize,
        queues: &mut [Virtqueue],
        mem: &GuestMemoryMmap,
    ) -> Result<NotifyOutcome> {
        let q = &mut queues[queue];
        let mut any = false;
        while let Some(chain) = q.pop_chain(mem)? {
            let written = self.process_chain(&chain, mem)?;
            q.add_used(mem, chain.head, written)?;
            any = true;
        }
        Ok(if any {
            NotifyOutcome::used(queue)
        } else {
            NotifyOutcome::default()
        })
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        // Backend contents persist outside the VM snapshot; nothing to save.
        Ok(Vec::new())
    }

    fn restore_state(&mut self, _blob: &[u8]) -> Result<()> {
        Ok(())
    }
}
