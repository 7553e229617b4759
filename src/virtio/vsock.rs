//! virtio-vsock (device id 19)
//!
//! rx/tx/event queues carrying 44-byte-header packets addressed by
//! (cid, port). The host side is implemented in-process: CID 2 terminates at
//! a [`VsockSwitch`] which hands out stream handles, so the control plane
//! (guest init on port 1) and bulk stdio streams never leave the VMM.
//! Credit-based flow control follows the virtio-vsock accounting:
//! `buf_alloc`/`fwd_cnt` ride on every header, and RW packets toward the
//! guest are held back when the peer's window is full.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use vm_memory::GuestMemoryMmap;

use crate::virtio::{device_id, features, NotifyOutcome, Virtqueue, VirtioDevice};
use crate::{Error, Result};

/// CID the host answers on.
pub const HOST_CID: u64 = 2;

pub const HDR_LEN: usize = 44;

const Q_RX: usize = 0;
const Q_TX: usize = 1;

/// Our advertised receive window per connection.
const BUF_ALLOC: u32 = 256 * 1024;

/// Packet ops.
mod op {
    pub const REQUEST: u16 = 1;
    pub const RESPONSE: u16 = 2;
    pub const RST: u16 = 3;
    pub const SHUTDOWN: u16 = 4;
    pub const RW: u16 = 5;
    pub const CREDIT_UPDATE: u16 = 6;
    pub const CREDIT_REQUEST: u16 = 7;
}

const TYPE_STREAM: u16 = 1;

/// One vsock packet (header + payload), host representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src_cid: u64,
    pub dst_cid: u64,
    pub src_port: u32,
    pub dst_port: u32,
    pub ty: u16,
    pub op: u16,
    pub flags: u32,
    pub buf_alloc: u32,
    pub fwd_cnt: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HDR_LEN + self.payload.len()];
        out[0..8].copy_from_slice(&self.src_cid.to_le_bytes());
        out[8..16].copy_from_slice(&self.dst_cid.to_le_bytes());
        out[16..20].copy_from_slice(&self.src_port.to_le_bytes());
        out[20..24].copy_from_slice(&self.dst_port.to_le_bytes());
        out[24..28].copy_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out[28..30].copy_from_slice(&self.ty.to_le_bytes());
        out[30..32].copy_from_slice(&self.op.to_le_bytes());
        out[32..36].copy_from_slice(&self.flags.to_le_bytes());
        out[36..40].copy_from_slice(&self.buf_alloc.to_le_bytes());
        out[40..44].copy_from_slice(&self.fwd_cnt.to_le_bytes());
        out[HDR_LEN..].copy_from_slice(&self.payload);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HDR_LEN {
            return Err(Error::Device("vsock packet shorter than header".into()));
        }
        let len = u32::from_le_bytes(data[24..28].try_into().unwrap()) as usize;
        if data.len() < HDR_LEN + len {
            return Err(Error::Device("vsock packet truncated payload".into()));
        }
        Ok(Self {
            src_cid: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            dst_cid: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            src_port: u32::from_le_bytes(data[16..20].try_into().unwrap()),
            dst_port: u32::from_le_bytes(data[20..24].try_into().unwrap()),
            ty: u16::from_le_bytes(data[28..30].try_into().unwrap()),
            op: u16::from_le_bytes(data[30..32].try_into().unwrap()),
            flags: u32::from_le_bytes(data[32..36].try_into().unwrap()),
            buf_alloc: u32::from_le_bytes(data[36..40].try_into().unwrap()),
            fwd_cnt: u32::from_le_bytes(data[40..44].try_into().unwrap()),
            payload: data[HDR_LEN..HDR_LEN + len].to_vec(),
        })
    }
}

/// Connection key: (host port, guest port).
type ConnKey = (u32, u32);

struct ConnState {
    /// Data from the guest, delivered to the host stream.
    to_host: mpsc::UnboundedSender<Vec<u8>>,
    /// Bytes we have sent toward the guest (credit accounting).
    tx_cnt: u32,
    /// Peer window as of the last header seen.
    peer_buf_alloc: u32,
    peer_fwd_cnt: u32,
    /// Bytes received from the guest (our fwd_cnt).
    fwd_cnt: u32,
    /// RW payloads waiting for peer credit.
    blocked: VecDeque<Vec<u8>>,
}

impl ConnState {
    fn credit_available(&self) -> u32 {
        self.peer_buf_alloc
            .saturating_sub(self.tx_cnt.wrapping_sub(self.peer_fwd_cnt))
    }
}

struct SwitchInner {
    guest_cid: u64,
    conns: HashMap<ConnKey, ConnState>,
    /// Host listeners by host port.
    listeners: HashMap<u32, mpsc::UnboundedSender<VsockStream>>,
    /// Host-initiated connects awaiting the guest's RESPONSE.
    connect_waiters: HashMap<ConnKey, tokio::sync::oneshot::Sender<Result<VsockStream>>>,
    /// Packets headed for the guest, waiting for rx buffers.
    to_guest: VecDeque<Packet>,
    next_ephemeral: u32,
}

impl SwitchInner {
    fn header_to_guest(&self, src_port: u32, dst_port: u32, op_: u16, fwd_cnt: u32) -> Packet {
        Packet {
            src_cid: HOST_CID,
            dst_cid: self.guest_cid,
            src_port,
            dst_port,
            ty: TYPE_STREAM,
            op: op_,
            flags: 0,
            buf_alloc: BUF_ALLOC,
            fwd_cnt,
            payload: Vec::new(),
        }
    }
}

/// Host-side endpoint of the in-process vsock fabric. Cloneable; shared by
/// the device and the RPC layer.
#[derive(Clone)]
pub struct VsockSwitch {
    inner: Arc<Mutex<SwitchInner>>,
}

impl VsockSwitch {
    pub fn new(guest_cid: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SwitchInner {
                guest_cid,
                conns: HashMap::new(),
                listeners: HashMap::new(),
                connect_waiters: HashMap::new(),
                to_guest: VecDeque::new(),
                next_ephemeral: 0x4000_0000,
            })),
        }
    }

    pub fn guest_cid(&self) -> u64 {
        self.inner.lock().unwrap().guest_cid
    }

    /// Listen for guest-initiated connections to host `port`.
    pub fn listen(&self, port: u32) -> mpsc::UnboundedReceiver<VsockStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().listeners.insert(port, tx);
        rx
    }

    /// Connect to `guest_port` inside the guest. Resolves when the guest
    /// answers the REQUEST with a RESPONSE (or RST).
    pub async fn connect(&self, guest_port: u32) -> Result<VsockStream> {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap();
            let host_port = inner.next_ephemeral;
            inner.next_ephemeral += 1;
            let key = (host_port, guest_port);
            let request = inner.header_to_guest(host_port, guest_port, op::REQUEST, 0);
            inner.to_guest.push_back(request);
            inner.connect_waiters.insert(key, done_tx);
            debug!(host_port, guest_port, "vsock connect request queued");
        }
        done_rx
            .await
            .map_err(|_| Error::Device("vsock switch dropped".into()))?
    }

    /// Queue `data` as RW packets toward the guest (credit permitting).
    fn send_to_guest(&self, key: ConnKey, data: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(conn) = inner.conns.get_mut(&key) else {
            return Err(Error::Device("vsock connection closed".into()));
        };
        conn.blocked.push_back(data);
        Self::drain_blocked(&mut inner, key);
        Ok(())
    }

    /// Move credit-permitted blocked payloads into the to_guest queue.
    fn drain_blocked(inner: &mut SwitchInner, key: ConnKey) {
        let guest_cid = inner.guest_cid;
        let Some(conn) = inner.conns.get_mut(&key) else {
            return;
        };
        let mut ready = Vec::new();
        while !conn.blocked.is_empty() {
            let credit = conn.credit_available() as usize;
            if credit == 0 {
                break;
            }
            let mut chunk = conn.blocked.pop_front().unwrap();
            if chunk.len() > credit {
                let rest = chunk.split_off(credit);
                conn.blocked.push_front(rest);
            }
            conn.tx_cnt = conn.tx_cnt.wrapping_add(chunk.len() as u32);
            ready.push(chunk);
        }
        let fwd_cnt = conn.fwd_cnt;
        for chunk in ready {
            inner.to_guest.push_back(Packet {
                src_cid: HOST_CID,
                dst_cid: guest_cid,
                src_port: key.0,
                dst_port: key.1,
                ty: TYPE_STREAM,
                op: op::RW,
                flags: 0,
                buf_alloc: BUF_ALLOC,
                fwd_cnt,
                payload: chunk,
            });
        }
    }

    fn close(&self, key: ConnKey) {
        let mut inner = self.inner.lock().unwrap();
        if inner.conns.remove(&key).is_some() {
            // Both directions closed.
            let mut pkt = inner.header_to_guest(key.0, key.1, op::SHUTDOWN, 0);
            pkt.flags = 0b11;
            inner.to_guest.push_back(pkt);
        }
    }
}

/// One established stream between the host and a guest port.
pub struct VsockStream {
    pub local_port: u32,
    pub peer_port: u32,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    switch: VsockSwitch,
    /// Data popped from `rx` but not yet consumed by `read`.
    pending: Vec<u8>,
}

impl VsockStream {
    /// Write the whole buffer toward the guest.
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        self.switch
            .send_to_guest((self.local_port, self.peer_port), data.to_vec())
    }

    /// Detach a cheap write handle usable while the read half lives in a
    /// reader task.
    pub fn writer(&self) -> VsockWriter {
        VsockWriter {
            local_port: self.local_port,
            peer_port: self.peer_port,
            switch: self.switch.clone(),
        }
    }

    /// Read some bytes; `None` means the guest closed its side.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        if !self.pending.is_empty() {
            return Some(std::mem::take(&mut self.pending));
        }
        self.rx.recv().await
    }

    /// Read exactly `n` bytes, buffering any excess.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if !self.pending.is_empty() {
                let take = (n - out.len()).min(self.pending.len());
                out.extend_from_slice(&self.pending[..take]);
                self.pending.drain(..take);
                continue;
            }
            match self.rx.recv().await {
                Some(chunk) => self.pending = chunk,
                None => {
                    return Err(Error::Device("vsock stream closed mid-read".into()));
                }
            }
        }
        Ok(out)
    }

    pub fn close(&self) {
        self.switch.close((self.local_port, self.peer_port));
    }
}

impl Drop for VsockStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write-only handle to a stream, cloneable across tasks.
#[derive(Clone)]
pub struct VsockWriter {
    local_port: u32,
    peer_port: u32,
    switch: VsockSwitch,
}

impl VsockWriter {
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        self.switch
            .send_to_guest((self.local_port, self.peer_port), data.to_vec())
    }

    pub fn close(&self) {
        self.switch.close((self.local_port, self.peer_port));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VsockState {
    guest_cid: u64,
}

/// The virtio vsock device.
pub struct Vsock {
    state: VsockState,
    switch: VsockSwitch,
}

impl Vsock {
    pub fn new(guest_cid: u64) -> Result<Self> {
        if guest_cid <= HOST_CID {
            return Err(Error::InvalidConfig(format!(
                "guest CID must be > {}, got {}",
                HOST_CID, guest_cid
            )));
        }
        Ok(Self {
            state: VsockState { guest_cid },
            switch: VsockSwitch::new(guest_cid),
        })
    }

    pub fn switch(&self) -> VsockSwitch {
        self.switch.clone()
    }

    /// Handle one packet from the guest TX queue.
    fn handle_guest_packet(&mut self, pkt: Packet) {
        if pkt.dst_cid != HOST_CID || pkt.ty != TYPE_STREAM {
            trace!(dst_cid = pkt.dst_cid, "vsock packet not for host; dropped");
            return;
        }
        // Connection key is (host port, guest port).
        let key = (pkt.dst_port, pkt.src_port);
        let mut inner = self.switch.inner.lock().unwrap();

        match pkt.op {
            op::REQUEST => {
                // Guest dialing a host listener.
                if let Some(listener) = inner.listeners.get(&pkt.dst_port).cloned() {
                    let (to_host_tx, to_host_rx) = mpsc::unbounded_channel();
                    inner.conns.insert(
                        key,
                        ConnState {
                            to_host: to_host_tx,
                            tx_cnt: 0,
                            peer_buf_alloc: pkt.buf_alloc,
                            peer_fwd_cnt: pkt.fwd_cnt,
                            fwd_cnt: 0,
                            blocked: VecDeque::new(),
                        },
                    );
                    let response =
                        inner.header_to_guest(pkt.dst_port, pkt.src_port, op::RESPONSE, 0);
                    inner.to_guest.push_back(response);
                    let stream = VsockStream {
                        local_port: pkt.dst_port,
                        peer_port: pkt.src_port,
                        rx: to_host_rx,
                        switch: self.switch.clone(),
                        pending: Vec::new(),
                    };
                    if listener.send(stream).is_err() {
                        warn!(port = pkt.dst_port, "vsock listener dropped");
                    }
                    debug!(
                        guest_port = pkt.src_port,
                        host_port = pkt.dst_port,
                        "vsock guest connection accepted"
                    );
                } else {
                    let rst = inner.header_to_guest(pkt.dst_port, pkt.src_port, op::RST, 0);
                    inner.to_guest.push_back(rst);
                }
            }
            op::RESPONSE => {
                // Guest accepted a host-initiated connect.
                if let Some(waiter) = inner.connect_waiters.remove(&key) {
                    let (to_host_tx, to_host_rx) = mpsc::unbounded_channel();
                    inner.conns.insert(
                        key,
                        ConnState {
                            to_host: to_host_tx,
                            tx_cnt: 0,
                            peer_buf_alloc: pkt.buf_alloc,
                            peer_fwd_cnt: pkt.fwd_cnt,
                            fwd_cnt: 0,
                            blocked: VecDeque::new(),
                        },
                    );
                    let _ = waiter.send(Ok(VsockStream {
                        local_port: key.0,
                        peer_port: key.1,
                        rx: to_host_rx,
                        switch: self.switch.clone(),
                        pending: Vec::new(),
                    }));
                }
            }
            op::RST => {
                if let Some(waiter) = inner.connect_waiters.remove(&key) {
                    let _ = waiter.send(Err(Error::Rpc {
                        op: "dial",
                        errno: libc::ECONNREFUSED,
                    }));
                }
                inner.conns.remove(&key);
            }
            op::RW => {
                let mut update = None;
                if let Some(conn) = inner.conns.get_mut(&key) {
                    conn.peer_buf_alloc = pkt.buf_alloc;
                    conn.peer_fwd_cnt = pkt.fwd_cnt;
                    conn.fwd_cnt = conn.fwd_cnt.wrapping_add(pkt.payload.len() as u32);
                    let fwd = conn.fwd_cnt;
                    if conn.to_host.send(pkt.payload).is_err() {
                        trace!("vsock host reader gone; data dropped");
                    }
                    // Tell the guest how much we consumed so its credit
                    // window keeps moving.
                    update = Some((key, fwd));
                }
                if let Some((key, fwd)) = update {
                    let pkt = inner.header_to_guest(key.0, key.1, op::CREDIT_UPDATE, fwd);
                    inner.to_guest.push_back(pkt);
                }
            }
            op::CREDIT_UPDATE => {
                if let Some(conn) = inner.conns.get_mut(&key) {
                    conn.peer_buf_alloc = pkt.buf_alloc;
                    conn.peer_fwd_cnt = pkt.fwd_cnt;
                }
                VsockSwitch::drain_blocked(&mut inner, key);
            }
            op::CREDIT_REQUEST => {
                let fwd = inner.conns.get(&key).map(|c| c.fwd_cnt).unwrap_or(0);
                let pkt = inner.header_to_guest(key.0, key.1, op::CREDIT_UPDATE, fwd);
                inner.to_guest.push_back(pkt);
            }
            op::SHUTDOWN => {
                // Close the host-facing stream (EOF) and confirm with RST.
                if let Some(conn) = inner.conns.remove(&key) {
                    drop(conn.to_host);
                }
                let rst = inner.header_to_guest(key.0, key.1, op::RST, 0);
                inner.to_guest.push_back(rst);
            }
            other => {
                trace!(op = other, "vsock unhandled op");
            }
        }
    }

    /// Deliver queued host→guest packets into rx buffers.
    fn fill_rx(&mut self, queues: &mut [Virtqueue], mem: &GuestMemoryMmap) -> Result<bool> {
        let mut progressed = false;
        loop {
            let pkt = {
                let mut inner = self.switch.inner.lock().unwrap();
                match inner.to_guest.pop_front() {
                    Some(p) => p,
                    None => break,
                }
            };
            let Some(chain) = queues[Q_RX].pop_chain(mem)? else {
                self.switch.inner.lock().unwrap().to_guest.push_front(pkt);
                break;
            };
            let bytes = pkt.encode();
            let n = chain.write_at(mem, 0, &bytes)?;
            queues[Q_RX].add_used(mem, chain.head, n as u32)?;
            progressed = true;
        }
        Ok(progressed)
    }
}

impl VirtioDevice for Vsock {
    fn device_id(&self) -> u32 {
        device_id::VSOCK
    }

    fn device_features(&self) -> u64 {
        features::VERSION_1
    }

    fn queue_max_sizes(&self) -> Vec<u16> {
        vec![256, 256, 16]
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        // {u64 guest_cid}
        let cid = self.state.guest_cid.to_le_bytes();
        for (i, slot) in data.iter_mut().enumerate() {
            *slot = cid.get(offset as usize + i).copied().unwrap_or(0);
        }
    }

    fn handle_notify(
        &mut self,
        queue: usize,
        queues: &mut [Virtqueue],
        mem: &GuestMemoryMmap,
    ) -> Result<NotifyOutcome> {
        let mut outcome = NotifyOutcome::default();
        match queue {
            Q_TX => {
                while let Some(chain) = queues[Q_TX].pop_chain(mem)? {
                    let data = chain.read_all(mem)?;
                    match Packet::decode(&data) {
                        Ok(pkt) => self.handle_guest_packet(pkt),
                        Err(e) => warn!("vsock bad tx packet: {}", e),
                    }
                    queues[Q_TX].add_used(mem, chain.head, 0)?;
                    outcome.merge(NotifyOutcome::used(Q_TX));
                }
                if self.fill_rx(queues, mem)? {
                    outcome.merge(NotifyOutcome::used(Q_RX));
                }
            }
            Q_RX => {
                if self.fill_rx(queues, mem)? {
                    outcome.merge(NotifyOutcome::used(Q_RX));
                }
            }
            _ => {}
        }
        Ok(outcome)
    }

    fn wants_poll(&self) -> bool {
        true
    }

    fn poll(&mut self, queues: &mut [Virtqueue], mem: &GuestMemoryMmap) -> Result<NotifyOutcome> {
        let mut outcome = NotifyOutcome::default();
        if self.fill_rx(queues, mem)? {
            outcome.merge(NotifyOutcome::used(Q_RX));
        }
        Ok(outcome)
    }

    fn on_reset(&mut self) {
        // Connections do not survive a device reset; streams see EOF.
        let mut inner = self.switch.inner.lock().unwrap();
        inner.conns.clear();
        inner.to_guest.clear();
        inner.connect_waiters.clear();
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        // Live connections are not snapshotted; the control plane
        // re-handshakes after restore.
        Ok(postcard::to_stdvec(&self.state)?)
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<()> {
        self.state = postcard::from_bytes(blob)?;
        self.switch.inner.lock().unwrap().guest_cid = self.state.guest_cid;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod guest_emu {
    //! In-process guest endpoint: emulates the guest driver and a set of
    //! guest-side servers, so sessions and devices can be exercised without
    //! booting anything.

    use super::*;
    use std::collections::HashMap as StdHashMap;

    /// Handles one guest-port's byte stream: given received bytes, returns
    /// reply chunks to send back to the host.
    pub(crate) type StreamHandler = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

    pub(crate) struct GuestEmulator {
        device: Arc<Mutex<Vsock>>,
        handlers: Arc<Mutex<StdHashMap<u32, StreamHandler>>>,
        next_guest_port: Arc<Mutex<u32>>,
    }

    impl GuestEmulator {
        pub(crate) fn new(guest_cid: u64) -> (Self, VsockSwitch) {
            let device = Vsock::new(guest_cid).unwrap();
            let switch = device.switch();
            (
                Self {
                    device: Arc::new(Mutex::new(device)),
                    handlers: Arc::new(Mutex::new(StdHashMap::new())),
                    next_guest_port: Arc::new(Mutex::new(40_000)),
                },
                switch,
            )
        }

        /// Open a guest-initiated connection to host `port`, served by
        /// `handler`.
        pub(crate) fn dial_host(
            &self,
            host_port: u32,
            handler: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
        ) -> u32 {
            let guest_port = {
                let mut next = self.next_guest_port.lock().unwrap();
                *next += 1;
                *next
            };
            self.handlers
                .lock()
                .unwrap()
                .insert(guest_port, Box::new(handler));
            let mut device = self.device.lock().unwrap();
            let src_cid = device.state.guest_cid;
            device.handle_guest_packet(Packet {
                src_cid,
                dst_cid: HOST_CID,
                src_port: guest_port,
                dst_port: host_port,
                ty: TYPE_STREAM,
                op: op::REQUEST,
                flags: 0,
                buf_alloc: BUF_ALLOC,
                fwd_cnt: 0,
                payload: Vec::new(),
            });
            guest_port
        }

        /// Send bytes from the guest side of an established stream.
        pub(crate) fn send_from_guest(&self, host_port: u32, guest_port: u32, data: Vec<u8>) {
            let mut device = self.device.lock().unwrap();
            let guest_cid = device.state.guest_cid;
            device.handle_guest_packet(Packet {
                src_cid: guest_cid,
                dst_cid: HOST_CID,
                src_port: guest_port,
                dst_port: host_port,
                ty: TYPE_STREAM,
                op: op::RW,
                flags: 0,
                buf_alloc: BUF_ALLOC,
                fwd_cnt: 0,
                payload: data,
            });
        }

        /// Close the guest side of a stream; the host reader sees EOF.
        pub(crate) fn shutdown_from_guest(&self, host_port: u32, guest_port: u32) {
            let mut device = self.device.lock().unwrap();
            let guest_cid = device.state.guest_cid;
            device.handle_guest_packet(Packet {
                src_cid: guest_cid,
                dst_cid: HOST_CID,
                src_port: guest_port,
                dst_port: host_port,
                ty: TYPE_STREAM,
                op: op::SHUTDOWN,
                flags: 0b11,
                buf_alloc: BUF_ALLOC,
                fwd_cnt: 0,
                payload: Vec::new(),
            });
        }

        /// Spawn the driver pump: drains to_guest packets, feeding RW data
        /// to handlers and sending their replies back.
        pub(crate) fn spawn_pump(&self) -> tokio::task::JoinHandle<()> {
            let device = self.device.clone();
            let handlers = self.handlers.clone();
            tokio::spawn(async move {
                loop {
                    let pkt = {
                        let dev = device.lock().unwrap();
                        let mut inner = dev.switch.inner.lock().unwrap();
                        inner.to_guest.pop_front()
                    };
                    let Some(pkt) = pkt else {
                        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                        continue;
                    };
                    match pkt.op {
                        op::RW => {
                            let replies = {
                                let mut handlers = handlers.lock().unwrap();
                                match handlers.get_mut(&pkt.dst_port) {
                                    Some(handler) => handler(&pkt.payload),
                                    None => Vec::new(),
                                }
                            };
                            let guest_cid = {
                                let dev = device.lock().unwrap();
                                dev.state.guest_cid
                            };
                            for reply in replies {
                                device.lock().unwrap().handle_guest_packet(Packet {
                                    src_cid: guest_cid,
                                    dst_cid: HOST_CID,
                                    src_port: pkt.dst_port,
                                    dst_port: pkt.src_port,
                                    ty: TYPE_STREAM,
                                    op: op::RW,
                                    flags: 0,
                                    buf_alloc: BUF_ALLOC,
                                    fwd_cnt: 0,
                                    payload: reply,
                                });
                            }
                        }
                        // Handshake and teardown packets need no reply here:
                        // guest-initiated connects are already established.
                        _ => {}
                    }
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest_packet(src_port: u32, dst_port: u32, op_: u16, payload: &[u8]) -> Packet {
        Packet {
            src_cid: 3,
            dst_cid: HOST_CID,
            src_port,
            dst_port,
            ty: TYPE_STREAM,
            op: op_,
            flags: 0,
            buf_alloc: 65536,
            fwd_cnt: 0,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn packet_codec_round_trip() {
        let pkt = guest_packet(1234, 1, op::RW, b"frame body");
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn short_packet_rejected() {
        assert!(Packet::decode(&[0u8; 10]).is_err());
        let mut bytes = guest_packet(1, 1, op::RW, b"xyz").encode();
        bytes.truncate(HDR_LEN + 1);
        assert!(Packet::decode(&bytes).is_err());
    }

    #[test]
    fn invalid_guest_cid_rejected() {
        assert!(Vsock::new(2).is_err());
        assert!(Vsock::new(3).is_ok());
    }

    #[tokio::test]
    async fn guest_connect_reaches_listener() {
        let mut dev = Vsock::new(3).unwrap();
        let switch = dev.switch();
        let mut listener = switch.listen(1);

        dev.handle_guest_packet(guest_packet(5000, 1, op::REQUEST, &[]));

        let stream = listener.recv().await.unwrap();
        assert_eq!(stream.peer_port, 5000);

        // Guest got a RESPONSE.
        let inner = switch.inner.lock().unwrap();
        assert_eq!(inner.to_guest.len(), 1);
        assert_eq!(inner.to_guest[0].op, op::RESPONSE);
    }

    #[tokio::test]
    async fn connect_to_unbound_port_gets_rst() {
        let mut dev = Vsock::new(3).unwrap();
        dev.handle_guest_packet(guest_packet(5000, 9, op::REQUEST, &[]));
        let inner = dev.switch.inner.lock().unwrap();
        assert_eq!(inner.to_guest[0].op, op::RST);
    }

    #[tokio::test]
    async fn rw_data_flows_to_stream_with_credit_update() {
        let mut dev = Vsock::new(3).unwrap();
        let switch = dev.switch();
        let mut listener = switch.listen(1);
        dev.handle_guest_packet(guest_packet(5000, 1, op::REQUEST, &[]));
        let mut stream = listener.recv().await.unwrap();

        dev.handle_guest_packet(guest_packet(5000, 1, op::RW, b"ping"));
        assert_eq!(stream.read().await.unwrap(), b"ping");

        let inner = switch.inner.lock().unwrap();
        let update = inner
            .to_guest
            .iter()
            .find(|p| p.op == op::CREDIT_UPDATE)
            .expect("credit update queued");
        assert_eq!(update.fwd_cnt, 4);
    }

    #[tokio::test]
    async fn host_write_respects_peer_credit() {
        let mut dev = Vsock::new(3).unwrap();
        let switch = dev.switch();
        let mut listener = switch.listen(1);
        // Guest connects with a tiny window.
        let mut req = guest_packet(5000, 1, op::REQUEST, &[]);
        req.buf_alloc = 4;
        dev.handle_guest_packet(req);
        let stream = listener.recv().await.unwrap();
        switch.inner.lock().unwrap().to_guest.clear();

        stream.write_all(b"0123456789").unwrap();
        {
            let inner = switch.inner.lock().unwrap();
            let rw: Vec<_> = inner.to_guest.iter().filter(|p| p.op == op::RW).collect();
            assert_eq!(rw.len(), 1);
            assert_eq!(rw[0].payload, b"0123");
        }

        // Guest consumes and updates credit; the rest drains.
        let mut update = guest_packet(5000, 1, op::CREDIT_UPDATE, &[]);
        update.buf_alloc = 4;
        update.fwd_cnt = 4;
        dev.handle_guest_packet(update);
        let inner = switch.inner.lock().unwrap();
        let total: usize = inner
            .to_guest
            .iter()
            .filter(|p| p.op == op::RW)
            .map(|p| p.payload.len())
            .sum();
        assert_eq!(total, 8);
    }

    #[tokio::test]
    async fn shutdown_gives_stream_eof() {
        let mut dev = Vsock::new(3).unwrap();
        let switch = dev.switch();
        let mut listener = switch.listen(1);
        dev.handle_guest_packet(guest_packet(5000, 1, op::REQUEST, &[]));
        let mut stream = listener.recv().await.unwrap();

        let mut shut = guest_packet(5000, 1, op::SHUTDOWN, &[]);
        shut.flags = 0b11;
        dev.handle_guest_packet(shut);
        assert!(stream.read().await.is_none());
    }

    #[tokio::test]
    async fn host_connect_resolves_on_response() {
        let mut dev = Vsock::new(3).unwrap();
        let switch = dev.switch();

        let connect = tokio::spawn({
            let switch = switch.clone();
            async move { switch.connect(1).await }
        });

        // Wait for the REQUEST to land in the to_guest queue.
        let (host_port, guest_port) = loop {
            tokio::task::yield_now().await;
            let inner = switch.inner.lock().unwrap();
            if let Some(p) = inner.to_guest.iter().find(|p| p.op == op::REQUEST) {
                break (p.src_port, p.dst_port);
            }
        };

        dev.handle_guest_packet(guest_packet(guest_port, host_port, op::RESPONSE, &[]));
        let stream = connect.await.unwrap().unwrap();
        assert_eq!(stream.local_port, host_port);
        assert_eq!(stream.peer_port, guest_port);
    }

    #[test]
    fn config_reports_guest_cid() {
        let dev = Vsock::new(77).unwrap();
        let mut cid = [0u8; 8];
        dev.config_read(0, &mut cid);
        assert_eq!(u64::from_le_bytes(cid), 77);
    }
}
