//! virtio-console (device id 3)
//!
//! Two queues per port (rx/tx) plus the multiport control pair. Port 0 is
//! the primary console wired to the host output channel; additional named
//! ports are announced over the control queue (the agent-protocol port name
//! `com.redhat.spice.0` is reserved and refused for user ports).

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use vm_memory::GuestMemoryMmap;

use crate::virtio::{device_id, features, NotifyOutcome, Virtqueue, VirtioDevice};
use crate::{Error, Result};

/// VIRTIO_CONSOLE_F_MULTIPORT.
const F_MULTIPORT: u64 = 1 << 1;

/// Reserved for the graphics agent protocol.
pub const AGENT_PORT_NAME: &str = "com.redhat.spice.0";

/// Control message events (virtio 1.2 §5.3.6.2).
mod control {
    pub const DEVICE_READY: u16 = 0;
    pub const PORT_ADD: u16 = 1;
    pub const PORT_READY: u16 = 3;
    pub const CONSOLE_PORT: u16 = 4;
    pub const PORT_OPEN: u16 = 6;
    pub const PORT_NAME: u16 = 7;
}

/// Queue indexes for the multiport layout.
const Q_RX0: usize = 0;
const Q_TX0: usize = 1;
const Q_CTRL_RX: usize = 2;
const Q_CTRL_TX: usize = 3;

fn port_rx_queue(port: u32) -> usize {
    if port == 0 {
        Q_RX0
    } else {
        2 + port as usize * 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PortState {
    name: String,
    /// Guest opened the port.
    open: bool,
    /// Bytes waiting to be injected into the port's rx queue.
    pending_rx: VecDeque<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConsoleState {
    ports: Vec<PortState>,
    /// Control events waiting for guest control-rx buffers.
    pending_control: VecDeque<(u32, u16, u16)>,
    device_ready: bool,
}

/// The virtio console device.
pub struct Console {
    state: ConsoleState,
    output_tx: mpsc::Sender<Vec<u8>>,
    cols: u16,
    rows: u16,
}

impl Console {
    /// `extra_ports` are announced over the control queue after port 0.
    pub fn new(output_tx: mpsc::Sender<Vec<u8>>, extra_ports: &[&str]) -> Result<Self> {
        let mut ports = vec![PortState {
            name: String::new(),
            open: false,
            pending_rx: VecDeque::new(),
        }];
        for name in extra_ports {
            if *name == AGENT_PORT_NAME {
                return Err(Error::InvalidConfig(format!(
                    "console port name {:?} is reserved",
                    AGENT_PORT_NAME
                )));
            }
            ports.push(PortState {
                name: name.to_string(),
                open: false,
                pending_rx: VecDeque::new(),
            });
        }
        Ok(Self {
            state: ConsoleState {
                ports,
                pending_control: VecDeque::new(),
                device_ready: false,
            },
            output_tx,
            cols: 80,
            rows: 25,
        })
    }

    /// Queue bytes for delivery to a port's rx queue on the next poll.
    pub fn queue_input(&mut self, port: u32, data: &[u8]) {
        if let Some(p) = self.state.ports.get_mut(port as usize) {
            p.pending_rx.push_back(data.to_vec());
        }
    }

    fn push_control(&mut self, port: u32, event: u16, value: u16) {
        self.state.pending_control.push_back((port, event, value));
    }

    fn announce_ports(&mut self) {
        for idx in 0..self.state.ports.len() {
            let port = idx as u32;
            self.push_control(port, control::PORT_ADD, 0);
            if port == 0 {
                self.push_control(port, control::CONSOLE_PORT, 1);
            }
            self.push_control(port, control::PORT_OPEN, 1);
        }
    }

    /// Drain pending control events into guest control-rx buffers.
    /// A control message is 8 bytes {u32 id, u16 event, u16 value}, with the
    /// port name appended for PORT_NAME.
    fn flush_control(
        &mut self,
        queues: &mut [Virtqueue],
        mem: &GuestMemoryMmap,
    ) -> Result<bool> {
        let mut progressed = false;
        while let Some(&(port, event, value)) = self.state.pending_control.front() {
            let Some(chain) = queues[Q_CTRL_RX].pop_chain(mem)? else {
                break;
            };
            let mut msg = Vec::with_capacity(16);
            msg.extend_from_slice(&port.to_le_bytes());
            msg.extend_from_slice(&event.to_le_bytes());
            msg.extend_from_slice(&value.to_le_bytes());
            if event == control::PORT_NAME {
                if let Some(p) = self.state.ports.get(port as usize) {
                    msg.extend_from_slice(p.name.as_bytes());
                }
            }
            let n = chain.write_at(mem, 0, &msg)?;
            queues[Q_CTRL_RX].add_used(mem, chain.head, n as u32)?;
            self.state.pending_control.pop_front();
            progressed = true;
        }
        Ok(progressed)
    }

    /// Drain a port's pending bytes into its rx queue.
    fn flush_rx(
        &mut self,
        port: u32,
        queues: &mut [Virtqueue],
        mem: &GuestMemoryMmap,
    ) -> Result<bool> {
        let qi = port_rx_queue(port);
        if qi >= queues.len() {
            return Ok(false);
        }
        let mut progressed = false;
        loop {
            let Some(p) = self.state.ports.get_mut(port as usize) else {
                break;
            };
            let Some(buf) = p.pending_rx.front() else {
                break;
            };
            let Some(chain) = queues[qi].pop_chain(mem)? else {
                break;
            };
            let n = chain.write_at(mem, 0, buf)?;
            queues[qi].add_used(mem, chain.head, n as u32)?;
            let p = self.state.ports.get_mut(port as usize).unwrap();
            if n >= p.pending_rx.front().map(|b| b.len()).unwrap_or(0) {
                p.pending_rx.pop_front();
            } else {
                let rest = p.pending_rx.front().unwrap()[n..].to_vec();
                *p.pending_rx.front_mut().unwrap() = rest;
            }
            progressed = true;
        }
        Ok(progressed)
    }

    fn handle_control_tx(
        &mut self,
        queues: &mut [Virtqueue],
        mem: &GuestMemoryMmap,
    ) -> Result<NotifyOutcome> {
        let mut outcome = NotifyOutcome::default();
        while let Some(chain) = queues[Q_CTRL_TX].pop_chain(mem)? {
            let msg = chain.read_all(mem)?;
            queues[Q_CTRL_TX].add_used(mem, chain.head, 0)?;
            outcome.merge(NotifyOutcome::used(Q_CTRL_TX));
            if msg.len() < 8 {
                continue;
            }
            let id = u32::from_le_bytes(msg[0..4].try_into().unwrap());
            let event = u16::from_le_bytes(msg[4..6].try_into().unwrap());
            let value = u16::from_le_bytes(msg[6..8].try_into().unwrap());
            trace!(id, event, value, "console control message");
            match event {
                control::DEVICE_READY => {
                    self.state.device_ready = value == 1;
                    if self.state.device_ready {
                        debug!("console driver ready, announcing ports");
                        self.announce_ports();
                    }
                }
                control::PORT_READY => {
                    // Respond with the port name for named ports.
                    if value == 1 {
                        let named = self
                            .state
                            .ports
                            .get(id as usize)
                            .map(|p| !p.name.is_empty())
                            .unwrap_or(false);
                        if named {
                            self.push_control(id, control::PORT_NAME, 1);
                        }
                    }
                }
                control::PORT_OPEN => {
                    if let Some(p) = self.state.ports.get_mut(id as usize) {
                        p.open = value == 1;
                    }
                }
                _ => {}
            }
        }
        if self.flush_control(queues, mem)? {
            outcome.merge(NotifyOutcome::used(Q_CTRL_RX));
        }
        Ok(outcome)
    }
}

impl VirtioDevice for Console {
    fn device_id(&self) -> u32 {
        device_id::CONSOLE
    }

    fn device_features(&self) -> u64 {
        features::VERSION_1 | F_MULTIPORT
    }

    fn queue_max_sizes(&self) -> Vec<u16> {
        // rx0/tx0, control rx/tx, then rx/tx per extra port.
        let mut sizes = vec![128, 128, 32, 32];
        for _ in 1..self.state.ports.len() {
            sizes.push(128);
            sizes.push(128);
        }
        sizes
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        // {u16 cols, u16 rows, u32 max_nr_ports, u32 emerg_wr}
        let mut config = [0u8; 12];
        config[0..2].copy_from_slice(&self.cols.to_le_bytes());
        config[2..4].copy_from_slice(&self.rows.to_le_bytes());
        config[4..8].copy_from_slice(&(self.state.ports.len() as u32).to_le_bytes());
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
        match queue {
            Q_CTRL_TX => self.handle_control_tx(queues, mem),
            Q_CTRL_RX => {
                let mut outcome = NotifyOutcome::default();
                if self.flush_control(queues, mem)? {
                    outcome.merge(NotifyOutcome::used(Q_CTRL_RX));
                }
                Ok(outcome)
            }
            q => {
                // Even queues past the control pair are rx, odd are tx.
                let is_tx = q == Q_TX0 || (q > Q_CTRL_TX && q % 2 == 1);
                if is_tx {
                    let port = if q == Q_TX0 { 0 } else { (q - 3) / 2 };
                    let mut any = false;
                    while let Some(chain) = queues[q].pop_chain(mem)? {
                        let data = chain.read_all(mem)?;
                        queues[q].add_used(mem, chain.head, 0)?;
                        any = true;
                        if port == 0 {
                            let _ = self.output_tx.try_send(data);
                        } else {
                            trace!(port, len = data.len(), "named port output dropped");
                        }
                    }
                    Ok(if any {
                        NotifyOutcome::used(q)
                    } else {
                        NotifyOutcome::default()
                    })
                } else {
                    // Guest replenished rx buffers; try to drain pending input.
                    let port = if q == Q_RX0 { 0 } else { ((q - 2) / 2) as u32 };
                    let mut outcome = NotifyOutcome::default();
                    if self.flush_rx(port, queues, mem)? {
                        outcome.merge(NotifyOutcome::used(q));
                    }
                    Ok(outcome)
                }
            }
        }
    }

    fn wants_poll(&self) -> bool {
        true
    }

    fn poll(&mut self, queues: &mut [Virtqueue], mem: &GuestMemoryMmap) -> Result<NotifyOutcome> {
        let mut outcome = NotifyOutcome::default();
        if self.flush_control(queues, mem)? {
            outcome.merge(NotifyOutcome::used(Q_CTRL_RX));
        }
        for port in 0..self.state.ports.len() as u32 {
            if self.flush_rx(port, queues, mem)? {
                outcome.merge(NotifyOutcome::used(port_rx_queue(port)));
            }
        }
        Ok(outcome)
    }

    fn on_reset(&mut self) {
        for p in &mut self.state.ports {
            p.open = false;
            p.pending_rx.clear();
        }
        self.state.pending_control.clear();
        self.state.device_ready = false;
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
    use vm_memory::{Bytes, GuestAddress};

    fn console_queues() -> Vec<Virtqueue> {
        (0..4).map(|_| test_queue(8)).collect()
    }

    #[test]
    fn reserved_port_name_rejected() {
        let (tx, _rx) = mpsc::channel(4);
        assert!(matches!(
            Console::new(tx, &[AGENT_PORT_NAME]),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn tx_data_reaches_host_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut console = Console::new(tx, &[]).unwrap();
        let mem = test_mem();
        let mut queues = console_queues();

        mem.write_slice(b"boot ok", GuestAddress(0x8000)).unwrap();
        write_desc(&mem, 0, 0x8000, 7, 0, 0);
        push_avail(&mem, 8, 0);

        let outcome = console.handle_notify(Q_TX0, &mut queues, &mem).unwrap();
        assert_eq!(outcome.used_queues, vec![Q_TX0]);
        assert_eq!(rx.try_recv().unwrap(), b"boot ok");
    }

    #[test]
    fn input_flows_into_rx_buffers() {
        let (tx, _rx) = mpsc::channel(4);
        let mut console = Console::new(tx, &[]).unwrap();
        let mem = test_mem();
        let mut queues = console_queues();

        console.queue_input(0, b"ls\n");
        write_desc(&mem, 0, 0x9000, 64, crate::virtio::queue::VIRTQ_DESC_F_WRITE, 0);
        push_avail(&mem, 8, 0);

        let outcome = console.poll(&mut queues, &mem).unwrap();
        assert_eq!(outcome.used_queues, vec![Q_RX0]);
        let mut buf = [0u8; 3];
        mem.read_slice(&mut buf, GuestAddress(0x9000)).unwrap();
        assert_eq!(&buf, b"ls\n");
    }

    #[test]
    fn device_ready_announces_ports() {
        let (tx, _rx) = mpsc::channel(4);
        let mut console = Console::new(tx, &["agent"]).unwrap();
        let mem = test_mem();
        let mut queues: Vec<Virtqueue> = (0..6).map(|_| test_queue(8)).collect();
        // All fixture queues share one ring; keep ctrl-rx quiet so only the
        // ctrl-tx message is consumed.
        queues[Q_CTRL_RX].ready = false;

        let mut msg = Vec::new();
        msg.extend_from_slice(&0u32.to_le_bytes());
        msg.extend_from_slice(&control::DEVICE_READY.to_le_bytes());
        msg.extend_from_slice(&1u16.to_le_bytes());
        mem.write_slice(&msg, GuestAddress(0x8000)).unwrap();

        write_desc(&mem, 0, 0x8000, 8, 0, 0);
        push_avail(&mem, 8, 0);

        let _ = console.handle_notify(Q_CTRL_TX, &mut queues, &mem).unwrap();
        assert!(console.state.device_ready);
        // PORT_ADD + CONSOLE_PORT + OPEN for port 0, PORT_ADD + OPEN for 1.
        assert_eq!(console.state.pending_control.len(), 5);
    }

    #[test]
    fn multiport_feature_offered() {
        let (tx, _rx) = mpsc::channel(4);
        let console = Console::new(tx, &[]).unwrap();
        assert_ne!(console.device_features() & F_MULTIPORT, 0);
        assert_ne!(console.device_features() & features::VERSION_1, 0);
    }

    #[test]
    fn config_reports_port_count() {
        let (tx, _rx) = mpsc::channel(4);
        let console = Console::new(tx, &["a", "b"]).unwrap();
        let mut buf = [0u8; 4];
        console.config_read(4, &mut buf);
        assert_eq!(u32::from_le_bytes(buf), 3);
    }
}
