//! virtio-net (device id 1)
//!
//! rx/tx queue pair with the 12-byte virtio_net_hdr prefix on every frame.
//! The device terminates in the [`PacketIo`] trait so a user-space TCP/IP
//! stack (or a test harness) can be plugged in behind it; the device itself
//! never interprets frame contents. Checksum offload is negotiable; frames
//! pass through unmodified either way since the backend is a host-side
//! stack, not real hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::trace;
use vm_memory::GuestMemoryMmap;

use crate::virtio::{device_id, features, NotifyOutcome, Virtqueue, VirtioDevice};
use crate::Result;

/// virtio_net_hdr length when MRG_RXBUF is negotiated (we always send the
/// 12-byte form under VERSION_1).
pub const NET_HDR_LEN: usize = 12;

const Q_RX: usize = 0;
const Q_TX: usize = 1;

/// Feature bits.
const VIRTIO_NET_F_CSUM: u64 = 1 << 0;
const VIRTIO_NET_F_GUEST_CSUM: u64 = 1 << 1;
const VIRTIO_NET_F_MAC: u64 = 1 << 5;
const VIRTIO_NET_F_STATUS: u64 = 1 << 16;

/// Link-up bit in the config status field.
const VIRTIO_NET_S_LINK_UP: u16 = 1;

/// Packet I/O sink/source behind the device. `send` takes a full Ethernet
/// frame without the virtio header; `recv` returns one frame when the stack
/// has data, never blocking.
pub trait PacketIo: Send {
    fn send(&mut self, frame: &[u8]);
    fn recv(&mut self) -> Option<Vec<u8>>;
}

/// Loopback-style queue pair, useful for tests and for stacks that run on
/// another thread and exchange frames through shared buffers.
#[derive(Default)]
pub struct PacketQueue {
    inner: Arc<Mutex<PacketQueueInner>>,
}

#[derive(Default)]
struct PacketQueueInner {
    to_guest: VecDeque<Vec<u8>>,
    from_guest: VecDeque<Vec<u8>>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for the host-side stack.
    pub fn handle(&self) -> PacketQueueHandle {
        PacketQueueHandle {
            inner: self.inner.clone(),
        }
    }
}

/// Host-side end of a [`PacketQueue`].
#[derive(Clone)]
pub struct PacketQueueHandle {
    inner: Arc<Mutex<PacketQueueInner>>,
}

impl PacketQueueHandle {
    /// Queue a frame for delivery to the guest.
    pub fn inject(&self, frame: Vec<u8>) {
        self.inner.lock().unwrap().to_guest.push_back(frame);
    }

    /// Take the next frame the guest transmitted.
    pub fn take_sent(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().from_guest.pop_front()
    }
}

impl PacketIo for PacketQueue {
    fn send(&mut self, frame: &[u8]) {
        self.inner.lock().unwrap().from_guest.push_back(frame.to_vec());
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().to_guest.pop_front()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NetState {
    mac: [u8; 6],
    /// Frames accepted from the backend but not yet placed in rx buffers.
    rx_backlog: VecDeque<Vec<u8>>,
}

/// Appends frames to a classic pcap file when `CRADLE_PCAP_DIR` is set.
struct PcapWriter {
    file: std::fs::File,
}

impl PcapWriter {
    fn open() -> Option<Self> {
        let dir = crate::trace::pcap_dir()?;
        std::fs::create_dir_all(&dir).ok()?;
        let path = dir.join(format!("net-{}.pcap", std::process::id()));
        let mut file = std::fs::File::create(path).ok()?;
        // Global header: magic, v2.4, no offsets, snaplen, LINKTYPE_ETHERNET.
        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&0xA1B2_C3D4u32.to_le_bytes());
        header.extend_from_slice(&2u16.to_le_bytes());
        header.extend_from_slice(&4u16.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&65535u32.to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());
        use std::io::Write;
        file.write_all(&header).ok()?;
        Some(Self { file })
    }

    fn record(&mut self, frame: &[u8]) {
        use std::io::Write;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let mut record = Vec::with_capacity(16 + frame.len());
        record.extend_from_slice(&(now.as_secs() as u32).to_le_bytes());
        record.extend_from_slice(&now.subsec_micros().to_le_bytes());
        record.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        record.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        record.extend_from_slice(frame);
        let _ = self.file.write_all(&record);
    }
}

/// The virtio network device.
pub struct Net {
    state: NetState,
    backend: Box<dyn PacketIo>,
    pcap: Option<PcapWriter>,
}

impl Net {
    pub fn new(backend: Box<dyn PacketIo>, mac: [u8; 6]) -> Self {
        Self {
            state: NetState {
                mac,
                rx_backlog: VecDeque::new(),
            },
            backend,
            pcap: PcapWriter::open(),
        }
    }

    pub fn mac(&self) -> [u8; 6] {
        self.state.mac
    }

    /// Move backlog + fresh backend frames into guest rx buffers.
    fn fill_rx(&mut self, queues: &mut [Virtqueue], mem: &GuestMemoryMmap) -> Result<bool> {
        let mut progressed = false;
        loop {
            let frame = match self.state.rx_backlog.pop_front() {
                Some(f) => f,
                None => match self.backend.recv() {
                    Some(f) => f,
                    None => break,
                },
            };

            let Some(chain) = queues[Q_RX].pop_chain(mem)? else {
                // No buffers; keep the frame for the next notify/poll.
                self.state.rx_backlog.push_front(frame);
                break;
            };

            // 12-byte header, zeroed except num_buffers = 1.
            let mut hdr = [0u8; NET_HDR_LEN];
            hdr[10..12].copy_from_slice(&1u16.to_le_bytes());
            chain.write_at(mem, 0, &hdr)?;
            let n = chain.write_at(mem, NET_HDR_LEN, &frame)?;
            queues[Q_RX].add_used(mem, chain.head, (NET_HDR_LEN + n) as u32)?;
            if let Some(pcap) = &mut self.pcap {
                pcap.record(&frame);
            }
            trace!(len = frame.len(), "virtio-net rx frame delivered");
            progressed = true;
        }
        Ok(progressed)
    }

    fn drain_tx(&mut self, queues: &mut [Virtqueue], mem: &GuestMemoryMmap) -> Result<bool> {
        let mut progressed = false;
        while let Some(chain) = queues[Q_TX].pop_chain(mem)? {
            let buf = chain.read_all(mem)?;
            if buf.len() > NET_HDR_LEN {
                if let Some(pcap) = &mut self.pcap {
                    pcap.record(&buf[NET_HDR_LEN..]);
                }
                self.backend.send(&buf[NET_HDR_LEN..]);
                trace!(len = buf.len() - NET_HDR_LEN, "virtio-net tx frame");
            }
            queues[Q_TX].add_used(mem, chain.head, 0)?;
            progressed = true;
        }
        Ok(progressed)
    }
}

impl VirtioDevice for Net {
    fn device_id(&self) -> u32 {
        device_id::NET
    }

    fn device_features(&self) -> u64 {
        features::VERSION_1
            | VIRTIO_NET_F_MAC
            | VIRTIO_NET_F_STATUS
            | VIRTIO_NET_F_CSUM
            | VIRTIO_NET_F_GUEST_CSUM
    }

    fn queue_max_sizes(&self) -> Vec<u16> {
        vec![256, 256]
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        // {u8 mac[6], u16 status}
        let mut config = [0u8; 8];
        config[0..6].copy_from_slice(&self.state.mac);
        config[6..8].copy_from_slice(&VIRTIO_NET_S_LINK_UP.to_le_bytes());
        for (i, slot) in data.iter_mut().enumerate() {
            *slot = config.get(offset as usize + i).copied().unwrap_or(0);
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
            Q_RX => {
                if self.fill_rx(queues, mem)? {
                    outcome.merge(NotifyOutcome::used(Q_RX));
                }
            }
            Q_TX => {
                if self.drain_tx(queues, mem)? {
                    outcome.merge(NotifyOutcome::used(Q_TX));
                }
                // TX often unblocks RX (responses from the stack).
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
        // RX bottom half: frames arriving while the guest computes would
        // otherwise sit unread until the next VM exit.
        let mut outcome = NotifyOutcome::default();
        if self.fill_rx(queues, mem)? {
            outcome.merge(NotifyOutcome::used(Q_RX));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::queue::testing::{push_avail, test_mem, test_queue, write_desc};
    use crate::virtio::queue::VIRTQ_DESC_F_WRITE;
    use vm_memory::{Bytes, GuestAddress};

    fn net() -> (Net, PacketQueueHandle) {
        let pq = PacketQueue::new();
        let handle = pq.handle();
        (
            Net::new(Box::new(pq), [0x52, 0x54, 0x00, 0x12, 0x34, 0x56]),
            handle,
        )
    }

    #[test]
    fn tx_frame_strips_header() {
        let (mut dev, handle) = net();
        let mem = test_mem();
        let mut queues = vec![test_queue(8), test_queue(8)];

        let mut frame = vec![0u8; NET_HDR_LEN];
        frame.extend_from_slice(b"\xff\xff\xff\xff\xff\xffarp?");
        mem.write_slice(&frame, GuestAddress(0x8000)).unwrap();
        write_desc(&mem, 0, 0x8000, frame.len() as u32, 0, 0);
        push_avail(&mem, 8, 0);

        dev.handle_notify(Q_TX, &mut queues, &mem).unwrap();
        assert_eq!(handle.take_sent().unwrap(), b"\xff\xff\xff\xff\xff\xffarp?");
    }

    #[test]
    fn rx_frame_gets_12_byte_header() {
        let (mut dev, handle) = net();
        let mem = test_mem();
        let mut queues = vec![test_queue(8), test_queue(8)];

        handle.inject(b"pong".to_vec());
        write_desc(&mem, 0, 0x9000, 256, VIRTQ_DESC_F_WRITE, 0);
        push_avail(&mem, 8, 0);

        let outcome = dev.poll(&mut queues, &mem).unwrap();
        assert_eq!(outcome.used_queues, vec![Q_RX]);

        let mut buf = [0u8; NET_HDR_LEN + 4];
        mem.read_slice(&mut buf, GuestAddress(0x9000)).unwrap();
        assert_eq!(&buf[..2], &[0, 0]); // no flags, no gso
        assert_eq!(u16::from_le_bytes([buf[10], buf[11]]), 1); // num_buffers
        assert_eq!(&buf[NET_HDR_LEN..], b"pong");
    }

    #[test]
    fn rx_without_buffers_is_backlogged() {
        let (mut dev, handle) = net();
        let mem = test_mem();
        let mut queues = vec![test_queue(8), test_queue(8)];

        handle.inject(b"later".to_vec());
        let outcome = dev.poll(&mut queues, &mem).unwrap();
        assert!(outcome.used_queues.is_empty());
        assert_eq!(dev.state.rx_backlog.len(), 1);

        // Buffers show up; backlog drains.
        write_desc(&mem, 0, 0x9000, 256, VIRTQ_DESC_F_WRITE, 0);
        push_avail(&mem, 8, 0);
        let outcome = dev.handle_notify(Q_RX, &mut queues, &mem).unwrap();
        assert_eq!(outcome.used_queues, vec![Q_RX]);
        assert!(dev.state.rx_backlog.is_empty());
    }

    #[test]
    fn config_carries_mac_and_link_up() {
        let (dev, _) = net();
        let mut mac = [0u8; 6];
        dev.config_read(0, &mut mac);
        assert_eq!(mac, dev.mac());
        let mut status = [0u8; 2];
        dev.config_read(6, &mut status);
        assert_eq!(u16::from_le_bytes(status), VIRTIO_NET_S_LINK_UP);
    }
}
