//! virtio-gpu, 2D mode (device id 16)
//!
//! Control queue handling RESOURCE_CREATE_2D, RESOURCE_ATTACH_BACKING
//! (scatter-gather of guest pages), SET_SCANOUT, TRANSFER_TO_HOST_2D (pull
//! copy into the host surface), RESOURCE_FLUSH (host redraw trigger),
//! GET_DISPLAY_INFO, and the config-change interrupt raised when the host
//! window is resized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::virtio::{device_id, features, NotifyOutcome, Virtqueue, VirtioDevice};
use crate::Result;

const Q_CONTROL: usize = 0;
const Q_CURSOR: usize = 1;

/// Control command/response types.
mod cmd {
    pub const GET_DISPLAY_INFO: u32 = 0x0100;
    pub const RESOURCE_CREATE_2D: u32 = 0x0101;
    pub const RESOURCE_UNREF: u32 = 0x0102;
    pub const SET_SCANOUT: u32 = 0x0103;
    pub const RESOURCE_FLUSH: u32 = 0x0104;
    pub const TRANSFER_TO_HOST_2D: u32 = 0x0105;
    pub const RESOURCE_ATTACH_BACKING: u32 = 0x0106;
    pub const RESOURCE_DETACH_BACKING: u32 = 0x0107;

    pub const RESP_OK_NODATA: u32 = 0x1100;
    pub const RESP_OK_DISPLAY_INFO: u32 = 0x1101;
    pub const RESP_ERR_UNSPEC: u32 = 0x1200;
    pub const RESP_ERR_INVALID_RESOURCE_ID: u32 = 0x1204;
}

/// Header flag: response must carry the fence id back.
const FLAG_FENCE: u32 = 1 << 0;

const HDR_LEN: usize = 24;
const BYTES_PER_PIXEL: usize = 4;
pub const MAX_SCANOUTS: usize = 1;

/// A guest-resolution rectangle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// The host-visible display surface for one scanout. The embedding UI polls
/// `take_dirty` and blits `pixels` (B8G8R8A8) when it returns true.
#[derive(Debug, Default)]
pub struct Scanout {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    dirty: bool,
}

impl Scanout {
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

/// Shared handle the embedding application renders from and resizes.
#[derive(Clone, Default)]
pub struct Display {
    inner: Arc<Mutex<DisplayInner>>,
}

#[derive(Debug, Default)]
struct DisplayInner {
    scanout: Scanout,
    requested_width: u32,
    requested_height: u32,
    /// Resize event pending; cleared by the guest via events_clear.
    resized: bool,
    /// The config-change interrupt for the pending event was already raised.
    resize_announced: bool,
}

impl Display {
    pub fn new(width: u32, height: u32) -> Self {
        let display = Self::default();
        {
            let mut inner = display.inner.lock().unwrap();
            inner.requested_width = width;
            inner.requested_height = height;
        }
        display
    }

    /// Host window was resized; the device raises a config-change interrupt
    /// and reports the new size in GET_DISPLAY_INFO.
    pub fn resize(&self, width: u32, height: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.requested_width = width;
        inner.requested_height = height;
        inner.resized = true;
        inner.resize_announced = false;
    }

    /// Run `f` against the scanout surface (render loop hook).
    pub fn with_scanout<R>(&self, f: impl FnOnce(&mut Scanout) -> R) -> R {
        f(&mut self.inner.lock().unwrap().scanout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Resource {
    width: u32,
    height: u32,
    format: u32,
    /// Host-side pixel copy, filled by TRANSFER_TO_HOST_2D.
    data: Vec<u8>,
    /// Guest backing pages from RESOURCE_ATTACH_BACKING.
    backing: Vec<(u64, u32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GpuState {
    resources: HashMap<u32, Resource>,
    scanout_resource: u32,
}

/// The virtio GPU device.
pub struct Gpu {
    state: GpuState,
    display: Display,
}

impl Gpu {
    pub fn new(display: Display) -> Self {
        Self {
            state: GpuState {
                resources: HashMap::new(),
                scanout_resource: 0,
            },
            display,
        }
    }

    fn handle_command(&mut self, request: &[u8], mem: &GuestMemoryMmap) -> Vec<u8> {
        if request.len() < HDR_LEN {
            return respond(cmd::RESP_ERR_UNSPEC, 0, 0, &[]);
        }
        let cmd_type = u32::from_le_bytes(request[0..4].try_into().unwrap());
        let flags = u32::from_le_bytes(request[4..8].try_into().unwrap());
        let fence_id = u64::from_le_bytes(request[8..16].try_into().unwrap());
        let body = &request[HDR_LEN..];
        trace!(cmd_type = format_args!("{:#x}", cmd_type), "gpu command");

        let (resp_type, resp_body) = match cmd_type {
            cmd::GET_DISPLAY_INFO => {
                // 16 pmodes of {rect, u32 enabled, u32 flags}.
                let (w, h) = {
                    let inner = self.display.inner.lock().unwrap();
                    (inner.requested_width, inner.requested_height)
                };
                let mut body_out = vec![0u8; 16 * 24];
                body_out[8..12].copy_from_slice(&w.to_le_bytes());
                body_out[12..16].copy_from_slice(&h.to_le_bytes());
                body_out[16..20].copy_from_slice(&1u32.to_le_bytes()); // enabled
                (cmd::RESP_OK_DISPLAY_INFO, body_out)
            }
            cmd::RESOURCE_CREATE_2D => {
                // {u32 resource_id, u32 format, u32 width, u32 height}
                if body.len() < 16 {
                    (cmd::RESP_ERR_UNSPEC, Vec::new())
                } else {
                    let id = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    let format = u32::from_le_bytes(body[4..8].try_into().unwrap());
                    let width = u32::from_le_bytes(body[8..12].try_into().unwrap());
                    let height = u32::from_le_bytes(body[12..16].try_into().unwrap());
                    debug!(id, width, height, "gpu resource created");
                    self.state.resources.insert(
                        id,
                        Resource {
                            width,
                            height,
                            format,
                            data: vec![0; (width * height) as usize * BYTES_PER_PIXEL],
                            backing: Vec::new(),
                        },
                    );
                    (cmd::RESP_OK_NODATA, Vec::new())
                }
            }
            cmd::RESOURCE_UNREF => {
                let id = read_u32(body, 0);
                self.state.resources.remove(&id);
                if self.state.scanout_resource == id {
                    self.state.scanout_resource = 0;
                }
                (cmd::RESP_OK_NODATA, Vec::new())
            }
            cmd::RESOURCE_ATTACH_BACKING => {
                // {u32 resource_id, u32 nr_entries} then entries of
                // {u64 addr, u32 length, u32 padding}.
                let id = read_u32(body, 0);
                let nr = read_u32(body, 4) as usize;
                match self.state.resources.get_mut(&id) {
                    Some(res) => {
                        res.backing.clear();
                        for i in 0..nr {
                            let off = 8 + i * 16;
                            if body.len() < off + 12 {
                                break;
                            }
                            let addr =
                                u64::from_le_bytes(body[off..off + 8].try_into().unwrap());
                            let len = read_u32(body, off + 8);
                            res.backing.push((addr, len));
                        }
                        (cmd::RESP_OK_NODATA, Vec::new())
                    }
                    None => (cmd::RESP_ERR_INVALID_RESOURCE_ID, Vec::new()),
                }
            }
            cmd::RESOURCE_DETACH_BACKING => {
                let id = read_u32(body, 0);
                if let Some(res) = self.state.resources.get_mut(&id) {
                    res.backing.clear();
                }
                (cmd::RESP_OK_NODATA, Vec::new())
            }
            cmd::SET_SCANOUT => {
                // {rect, u32 scanout_id, u32 resource_id}
                let resource_id = read_u32(body, 20);
                self.state.scanout_resource = resource_id;
                if let Some(res) = self.state.resources.get(&resource_id) {
                    self.display.with_scanout(|s| {
                        s.width = res.width;
                        s.height = res.height;
                        s.pixels = vec![0; res.data.len()];
                    });
                }
                (cmd::RESP_OK_NODATA, Vec::new())
            }
            cmd::TRANSFER_TO_HOST_2D => {
                // {rect, u64 offset, u32 resource_id, u32 padding}
                let rect = read_rect(body);
                let offset = u64::from_le_bytes(body[16..24].try_into().unwrap());
                let id = read_u32(body, 24);
                match self.transfer_to_host(id, rect, offset, mem) {
                    Ok(()) => (cmd::RESP_OK_NODATA, Vec::new()),
                    Err(()) => (cmd::RESP_ERR_INVALID_RESOURCE_ID, Vec::new()),
                }
            }
            cmd::RESOURCE_FLUSH => {
                // {rect, u32 resource_id, u32 padding}
                let id = read_u32(body, 16);
                match self.state.resources.get(&id) {
                    Some(res) if self.state.scanout_resource == id => {
                        let pixels = res.data.clone();
                        self.display.with_scanout(|s| {
                            s.pixels = pixels;
                            s.dirty = true;
                        });
                        (cmd::RESP_OK_NODATA, Vec::new())
                    }
                    Some(_) => (cmd::RESP_OK_NODATA, Vec::new()),
                    None => (cmd::RESP_ERR_INVALID_RESOURCE_ID, Vec::new()),
                }
            }
            other => {
                warn!(cmd_type = format_args!("{:#x}", other), "gpu unhandled command");
                (cmd::RESP_ERR_UNSPEC, Vec::new())
            }
        };

        respond(resp_type, flags, fence_id, &resp_body)
    }

    /// Pull-copy a rectangle from the guest backing pages into the host
    /// resource buffer.
    fn transfer_to_host(
        &mut self,
        id: u32,
        rect: Rect,
        offset: u64,
        mem: &GuestMemoryMmap,
    ) -> std::result::Result<(), ()> {
        let res = self.state.resources.get_mut(&id).ok_or(())?;
        if res.backing.is_empty() {
            return Err(());
        }
        let stride = res.width as usize * BYTES_PER_PIXEL;
        let row_bytes = rect.width as usize * BYTES_PER_PIXEL;
        for row in 0..rect.height as usize {
            let src_off = offset as usize + row * stride;
            let dst_off = (rect.y as usize + row) * stride + rect.x as usize * BYTES_PER_PIXEL;
            if dst_off + row_bytes > res.data.len() {
                break;
            }
            let mut buf = vec![0u8; row_bytes];
            if read_backing(&res.backing, src_off, &mut buf, mem).is_err() {
                return Err(());
            }
            res.data[dst_off..dst_off + row_bytes].copy_from_slice(&buf);
        }
        Ok(())
    }
}

fn read_u32(body: &[u8], off: usize) -> u32 {
    body.get(off..off + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .unwrap_or(0)
}

fn read_rect(body: &[u8]) -> Rect {
    Rect {
        x: read_u32(body, 0),
        y: read_u32(body, 4),
        width: read_u32(body, 8),
        height: read_u32(body, 12),
    }
}

/// Read `buf.len()` bytes at linear `offset` from the backing scatter list.
fn read_backing(
    backing: &[(u64, u32)],
    mut offset: usize,
    buf: &mut [u8],
    mem: &GuestMemoryMmap,
) -> Result<()> {
    let mut filled = 0usize;
    for &(addr, len) in backing {
        let len = len as usize;
        if offset >= len {
            offset -= len;
            continue;
        }
        let avail = len - offset;
        let n = avail.min(buf.len() - filled);
        mem.read_slice(
            &mut buf[filled..filled + n],
            GuestAddress(addr + offset as u64),
        )
        .map_err(|e| crate::Error::Memory(format!("gpu backing read: {}", e)))?;
        filled += n;
        offset = 0;
        if filled == buf.len() {
            return Ok(());
        }
    }
    Err(crate::Error::Memory("gpu backing too small".into()))
}

fn respond(resp_type: u32, req_flags: u32, fence_id: u64, body: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; HDR_LEN + body.len()];
    out[0..4].copy_from_slice(&resp_type.to_le_bytes());
    if req_flags & FLAG_FENCE != 0 {
        out[4..8].copy_from_slice(&FLAG_FENCE.to_le_bytes());
        out[8..16].copy_from_slice(&fence_id.to_le_bytes());
    }
    out[HDR_LEN..].copy_from_slice(body);
    out
}

impl VirtioDevice for Gpu {
    fn device_id(&self) -> u32 {
        device_id::GPU
    }

    fn device_features(&self) -> u64 {
        features::VERSION_1
    }

    fn queue_max_sizes(&self) -> Vec<u16> {
        vec![64, 16]
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        // {u32 events_read, u32 events_clear, u32 num_scanouts, u32 num_capsets}
        let resized = self.display.inner.lock().unwrap().resized;
        let mut config = [0u8; 16];
        config[0..4].copy_from_slice(&(resized as u32).to_le_bytes());
        config[8..12].copy_from_slice(&(MAX_SCANOUTS as u32).to_le_bytes());
        for (i, slot) in data.iter_mut().enumerate() {
            *slot = config.get(offset as usize + i).copied().unwrap_or(0);
        }
    }

    fn config_write(&mut self, offset: u64, data: &[u8]) {
        // events_clear at offset 4.
        if offset <= 4 && offset as usize + data.len() > 4 {
            self.display.inner.lock().unwrap().resized = false;
        }
    }

    fn handle_notify(
        &mut self,
        queue: usize,
        queues: &mut [Virtqueue],
        mem: &GuestMemoryMmap,
    ) -> Result<NotifyOutcome> {
        let mut outcome = NotifyOutcome::default();
        let q = &mut queues[queue];
        while let Some(chain) = q.pop_chain(mem)? {
            let request = chain.read_all(mem)?;
            let response = if queue == Q_CONTROL {
                self.handle_command(&request, mem)
            } else {
                // Cursor commands are accepted and ignored (2D pointer is
                // composited by the host).
                respond(cmd::RESP_OK_NODATA, 0, 0, &[])
            };
            let n = chain.write_at(mem, 0, &response)?;
            q.add_used(mem, chain.head, n as u32)?;
            outcome.merge(NotifyOutcome::used(queue));
        }
        Ok(outcome)
    }

    fn wants_poll(&self) -> bool {
        true
    }

    fn poll(&mut self, _queues: &mut [Virtqueue], _mem: &GuestMemoryMmap) -> Result<NotifyOutcome> {
        // Host resize becomes a config-change interrupt, raised once per
        // resize; the event bit stays visible until the guest clears it.
        let mut inner = self.display.inner.lock().unwrap();
        let mut outcome = NotifyOutcome::default();
        if inner.resized && !inner.resize_announced {
            inner.resize_announced = true;
            outcome.config_changed = true;
        }
        Ok(outcome)
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(&self.state)?)
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<()> {
        self.state = postcard::from_bytes(blob)?;
        Ok(())
    }
}
