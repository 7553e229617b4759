//! 16550A UART serial port
//!
//! Full register file: RBR/THR with DLAB banking, IER, IIR/FCR with the four
//! FIFO trigger levels (1/4/8/14), LCR, MCR with loopback and the OUT2
//! interrupt gate, LSR, MSR with delta bits, and the scratch register.
//! Interrupts are prioritized line status > RX data > THR empty > modem
//! status and delivered on the chipset line handed in at construction.
//!
//! Console output bytes flow into a tokio channel the instance drains.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::chipset::{Device, DtNode, IrqLine, PortRange};
use crate::error::DeviceResult;
use crate::Result;

/// COM1 base port.
pub const COM1_BASE: u16 = 0x3F8;
/// Default COM1 interrupt pin.
pub const COM1_IRQ: u32 = 4;

const FIFO_SIZE: usize = 16;

/// Interrupt Enable Register bits.
mod ier {
    pub const RX_AVAIL: u8 = 1 << 0;
    pub const THR_EMPTY: u8 = 1 << 1;
    pub const LINE_STATUS: u8 = 1 << 2;
    pub const MODEM_STATUS: u8 = 1 << 3;
    pub const MASK: u8 = 0x0F;
}

/// Interrupt Identification Register values (bits 3:0).
mod iir {
    pub const NONE: u8 = 0x01;
    pub const MODEM_STATUS: u8 = 0x00;
    pub const THR_EMPTY: u8 = 0x02;
    pub const RX_AVAIL: u8 = 0x04;
    pub const LINE_STATUS: u8 = 0x06;
    pub const FIFO_ENABLED: u8 = 0xC0;
}

/// FIFO Control Register bits.
mod fcr {
    pub const ENABLE: u8 = 1 << 0;
    pub const CLEAR_RX: u8 = 1 << 1;
    pub const CLEAR_TX: u8 = 1 << 2;
}

/// Line Control Register bits.
mod lcr {
    pub const DLAB: u8 = 1 << 7;
}

/// Modem Control Register bits.
mod mcr {
    pub const DTR: u8 = 1 << 0;
    pub const RTS: u8 = 1 << 1;
    pub const OUT1: u8 = 1 << 2;
    pub const OUT2: u8 = 1 << 3;
    pub const LOOPBACK: u8 = 1 << 4;
}

/// Line Status Register bits.
mod lsr {
    pub const DATA_READY: u8 = 1 << 0;
    pub const OVERRUN: u8 = 1 << 1;
    pub const THR_EMPTY: u8 = 1 << 5;
    pub const TRANSMITTER_EMPTY: u8 = 1 << 6;
}

/// Modem Status Register bits.
mod msr {
    pub const DELTA_CTS: u8 = 1 << 0;
    pub const DELTA_DSR: u8 = 1 << 1;
    pub const TERI: u8 = 1 << 2;
    pub const DELTA_DCD: u8 = 1 << 3;
    pub const CTS: u8 = 1 << 4;
    pub const DSR: u8 = 1 << 5;
    pub const RI: u8 = 1 << 6;
    pub const DCD: u8 = 1 << 7;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SerialState {
    ier: u8,
    fcr: u8,
    lcr: u8,
    mcr: u8,
    lsr: u8,
    msr: u8,
    scratch: u8,
    dll: u8,
    dlh: u8,
    rx_fifo: VecDeque<u8>,
    /// THR-empty interrupt latched until the next write or IIR read.
    thr_empty_pending: bool,
}

impl SerialState {
    fn new() -> Self {
        Self {
            ier: 0,
            fcr: 0,
            lcr: 0x03, // 8n1
            mcr: mcr::OUT2,
            lsr: lsr::THR_EMPTY | lsr::TRANSMITTER_EMPTY,
            msr: msr::CTS | msr::DSR | msr::DCD,
            scratch: 0,
            dll: 0x0C, // 9600 baud
            dlh: 0,
            rx_fifo: VecDeque::new(),
            thr_empty_pending: false,
        }
    }

    fn dlab(&self) -> bool {
        self.lcr & lcr::DLAB != 0
    }

    fn fifo_enabled(&self) -> bool {
        self.fcr & fcr::ENABLE != 0
    }

    /// RX bytes needed before the RX-available interrupt fires.
    fn rx_trigger_level(&self) -> usize {
        if !self.fifo_enabled() {
            return 1;
        }
        match self.fcr >> 6 {
            0 => 1,
            1 => 4,
            2 => 8,
            _ => 14,
        }
    }

    /// Highest-priority pending interrupt source, if enabled.
    fn pending_iir(&self) -> u8 {
        if self.ier & ier::LINE_STATUS != 0 && self.lsr & lsr::OVERRUN != 0 {
            return iir::LINE_STATUS;
        }
        if self.ier & ier::RX_AVAIL != 0 && self.rx_fifo.len() >= self.rx_trigger_level() {
            return iir::RX_AVAIL;
        }
        if self.ier & ier::THR_EMPTY != 0 && self.thr_empty_pending {
            return iir::THR_EMPTY;
        }
        if self.ier & ier::MODEM_STATUS != 0 && self.msr & 0x0F != 0 {
            return iir::MODEM_STATUS;
        }
        iir::NONE
    }

    /// Interrupt output, gated by MCR OUT2.
    fn irq_level(&self) -> bool {
        self.mcr & mcr::OUT2 != 0 && self.pending_iir() != iir::NONE
    }

    fn push_rx(&mut self, byte: u8) {
        if self.rx_fifo.len() >= FIFO_SIZE {
            self.lsr |= lsr::OVERRUN;
            return;
        }
        self.rx_fifo.push_back(byte);
        self.lsr |= lsr::DATA_READY;
    }

    fn pop_rx(&mut self) -> u8 {
        let byte = self.rx_fifo.pop_front().unwrap_or(0);
        if self.rx_fifo.is_empty() {
            self.lsr &= !lsr::DATA_READY;
        }
        byte
    }
}

/// The chipset-facing 16550 device. Cloneable so the instance can keep a
/// handle for injecting console input.
#[derive(Clone)]
pub struct SerialDevice {
    state: Arc<Mutex<SerialState>>,
    output_tx: mpsc::Sender<u8>,
    irq: IrqLine,
    base: u16,
}

impl SerialDevice {
    pub fn new(output_tx: mpsc::Sender<u8>, irq: IrqLine) -> Self {
        Self::with_base(output_tx, irq, COM1_BASE)
    }

    pub fn with_base(output_tx: mpsc::Sender<u8>, irq: IrqLine, base: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(SerialState::new())),
            output_tx,
            irq,
            base,
        }
    }

    /// Queue console input for the guest and update the interrupt line.
    pub fn queue_input(&self, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        for &byte in data {
            state.push_rx(byte);
        }
        self.sync_irq(&state);
    }

    pub fn has_input(&self) -> bool {
        !self.state.lock().unwrap().rx_fifo.is_empty()
    }

    fn sync_irq(&self, state: &SerialState) {
        if state.irq_level() {
            self.irq.assert();
        } else {
            self.irq.deassert();
        }
    }

    fn register_read(&self, offset: u16) -> u8 {
        let mut state = self.state.lock().unwrap();
        let value = match offset {
            0 if state.dlab() => state.dll,
            0 => {
                let b = state.pop_rx();
                trace!(byte = b, "serial rx read");
                b
            }
            1 if state.dlab() => state.dlh,
            1 => state.ier,
            2 => {
                let pending = state.pending_iir();
                if pending == iir::THR_EMPTY {
                    // Reading IIR clears the THR-empty source.
                    state.thr_empty_pending = false;
                }
                let fifo_bits = if state.fifo_enabled() {
                    iir::FIFO_ENABLED
                } else {
                    0
                };
                pending | fifo_bits
            }
            3 => state.lcr,
            4 => state.mcr,
            5 => {
                let value = state.lsr;
                // Overrun is read-clear.
                state.lsr &= !lsr::OVERRUN;
                value
            }
            6 => {
                if state.mcr & mcr::LOOPBACK != 0 {
                    // Loopback wires MCR outputs back into MSR inputs.
                    let mut value = 0u8;
                    if state.mcr & mcr::DTR != 0 {
                        value |= msr::DSR;
                    }
                    if state.mcr & mcr::RTS != 0 {
                        value |= msr::CTS;
                    }
                    if state.mcr & mcr::OUT1 != 0 {
                        value |= msr::RI;
                    }
                    if state.mcr & mcr::OUT2 != 0 {
                        value |= msr::DCD;
                    }
                    value
                } else {
                    let value = state.msr;
                    // Delta bits are read-clear.
                    state.msr &= !(msr::DELTA_CTS | msr::DELTA_DSR | msr::TERI | msr::DELTA_DCD);
                    value
                }
            }
            7 => state.scratch,
            _ => 0xFF,
        };
        self.sync_irq(&state);
        value
    }

    fn register_write(&self, offset: u16, value: u8) {
        let mut state = self.state.lock().unwrap();
        match offset {
            0 if state.dlab() => state.dll = value,
            0 => {
                if state.mcr & mcr::LOOPBACK != 0 {
                    state.push_rx(value);
                } else {
                    let _ = self.output_tx.try_send(value);
                }
                state.thr_empty_pending = true;
            }
            1 if state.dlab() => state.dlh = value,
            1 => {
                let was = state.ier;
                state.ier = value & ier::MASK;
                // Enabling THR-empty with an empty THR raises it immediately.
                if value & ier::THR_EMPTY != 0 && was & ier::THR_EMPTY == 0 {
                    state.thr_empty_pending = true;
                }
            }
            2 => {
                state.fcr = value;
                if value & fcr::CLEAR_RX != 0 {
                    state.rx_fifo.clear();
                    state.lsr &= !lsr::DATA_READY;
                }
                if value & fcr::CLEAR_TX != 0 {
                    state.thr_empty_pending = false;
                }
            }
            3 => state.lcr = value,
            4 => state.mcr = value & 0x1F,
            7 => state.scratch = value,
            _ => {}
        }
        self.sync_irq(&state);
    }
}

impl Device for SerialDevice {
    fn kind(&self) -> &'static str {
        "serial-16550"
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        vec![PortRange::new(self.base, 8)]
    }

    fn pio_read(&mut self, port: u16, data: &mut [u8]) -> DeviceResult {
        let value = self.register_read(port - self.base);
        data.fill(value);
        Ok(())
    }

    fn pio_write(&mut self, port: u16, data: &[u8]) -> DeviceResult {
        for &byte in data {
            self.register_write(port - self.base, byte);
        }
        Ok(())
    }

    fn reset(&mut self) {
        *self.state.lock().unwrap() = SerialState::new();
        self.irq.deassert();
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(&*self.state.lock().unwrap())?)
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<()> {
        let state: SerialState = postcard::from_bytes(blob)?;
        let mut guard = self.state.lock().unwrap();
        *guard = state;
        self.sync_irq(&guard);
        Ok(())
    }

    fn device_tree_node(&self) -> Option<DtNode> {
        Some(DtNode {
            name: "uart".into(),
            compatible: "ns16550a".into(),
            reg: vec![(crate::arch::aarch64::layout::UART_BASE, 0x8)],
            interrupts: vec![COM1_IRQ],
            props: vec![("clock-frequency".into(), "1843200".into())],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chipset::LineSet;

    fn serial() -> (SerialDevice, mpsc::Receiver<u8>, IrqLine) {
        let (tx, rx) = mpsc::channel(64);
        let lines = LineSet::new();
        let irq = lines.allocate("serial", COM1_IRQ);
        (SerialDevice::new(tx, irq.clone()), rx, irq)
    }

    #[test]
    fn tx_byte_reaches_channel() {
        let (mut dev, mut rx, _) = serial();
        dev.pio_write(COM1_BASE, b"A").unwrap();
        assert_eq!(rx.try_recv().unwrap(), b'A');
    }

    #[test]
    fn dlab_banks_divisor_latch() {
        let (mut dev, mut rx, _) = serial();
        dev.pio_write(COM1_BASE + 3, &[lcr::DLAB]).unwrap();
        dev.pio_write(COM1_BASE, &[0x18]).unwrap(); // DLL, not THR
        assert!(rx.try_recv().is_err());

        let mut data = [0u8];
        dev.pio_read(COM1_BASE, &mut data).unwrap();
        assert_eq!(data[0], 0x18);

        dev.pio_write(COM1_BASE + 3, &[0x03]).unwrap();
        dev.pio_write(COM1_BASE, &[0x42]).unwrap();
        assert_eq!(rx.try_recv().unwrap(), 0x42);
    }

    #[test]
    fn rx_interrupt_fires_at_trigger_level() {
        let (mut dev, _rx, irq) = serial();
        // Enable FIFO with trigger level 4, enable RX interrupt.
        dev.pio_write(COM1_BASE + 2, &[fcr::ENABLE | 0x40]).unwrap();
        dev.pio_write(COM1_BASE + 1, &[ier::RX_AVAIL]).unwrap();

        dev.queue_input(b"abc");
        assert!(!irq.is_high(), "below trigger level");

        dev.queue_input(b"d");
        assert!(irq.is_high(), "at trigger level");
    }

    #[test]
    fn iir_reports_rx_over_thr() {
        let (mut dev, _rx, _) = serial();
        dev.pio_write(COM1_BASE + 1, &[ier::RX_AVAIL | ier::THR_EMPTY])
            .unwrap();
        dev.queue_input(b"x");

        let mut data = [0u8];
        dev.pio_read(COM1_BASE + 2, &mut data).unwrap();
        assert_eq!(data[0] & 0x0F, iir::RX_AVAIL);
    }

    #[test]
    fn loopback_routes_tx_to_rx() {
        let (mut dev, mut rx, _) = serial();
        dev.pio_write(COM1_BASE + 4, &[mcr::LOOPBACK]).unwrap();
        dev.pio_write(COM1_BASE, b"z").unwrap();

        // Nothing leaves the device.
        assert!(rx.try_recv().is_err());
        let mut data = [0u8];
        dev.pio_read(COM1_BASE, &mut data).unwrap();
        assert_eq!(data[0], b'z');
    }

    #[test]
    fn loopback_reflects_mcr_in_msr() {
        let (mut dev, _rx, _) = serial();
        dev.pio_write(COM1_BASE + 4, &[mcr::LOOPBACK | mcr::RTS | mcr::OUT2])
            .unwrap();
        let mut data = [0u8];
        dev.pio_read(COM1_BASE + 6, &mut data).unwrap();
        assert_ne!(data[0] & msr::CTS, 0);
        assert_ne!(data[0] & msr::DCD, 0);
        assert_eq!(data[0] & msr::DSR, 0);
    }

    #[test]
    fn out2_gates_interrupt_line() {
        let (mut dev, _rx, irq) = serial();
        dev.pio_write(COM1_BASE + 1, &[ier::RX_AVAIL]).unwrap();
        // Drop OUT2: interrupts suppressed even with data ready.
        dev.pio_write(COM1_BASE + 4, &[0]).unwrap();
        dev.queue_input(b"q");
        assert!(!irq.is_high());

        dev.pio_write(COM1_BASE + 4, &[mcr::OUT2]).unwrap();
        assert!(irq.is_high());
    }

    #[test]
    fn overrun_sets_lsr_and_is_read_clear() {
        let (mut dev, _rx, _) = serial();
        dev.queue_input(&[0u8; FIFO_SIZE + 4]);

        let mut data = [0u8];
        dev.pio_read(COM1_BASE + 5, &mut data).unwrap();
        assert_ne!(data[0] & lsr::OVERRUN, 0);

        dev.pio_read(COM1_BASE + 5, &mut data).unwrap();
        assert_eq!(data[0] & lsr::OVERRUN, 0);
    }

    #[test]
    fn state_round_trip() {
        let (mut dev, _rx, _) = serial();
        dev.pio_write(COM1_BASE + 7, &[0x5A]).unwrap();
        dev.queue_input(b"hi");
        let blob = dev.save_state().unwrap();

        let (mut fresh, _rx2, _) = serial();
        fresh.restore_state(&blob).unwrap();
        let mut data = [0u8];
        fresh.pio_read(COM1_BASE + 7, &mut data).unwrap();
        assert_eq!(data[0], 0x5A);
        assert!(fresh.has_input());
    }
}
