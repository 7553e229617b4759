//! Dual 8259A programmable interrupt controller
//!
//! Master at ports 0x20/0x21, slave at 0xA0/0xA1, cascaded through IRQ2.
//! Implements the ICW1–4 programming sequence, OCW1 masking, OCW2
//! EOI/rotate, OCW3 poll/register reads, and spurious IRQ7/15 with stat
//! counters. Vectors are computed from the ICW2 offset plus the resolved
//! IRR priority and handed to the [`VectorInjector`] (the LAPIC helper).

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::chipset::{Device, IrqRouter, PortRange, VectorInjector};
use crate::error::DeviceResult;
use crate::Result;

const MASTER_CMD: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_CMD: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

/// ICW1 bits
const ICW1_INIT: u8 = 1 << 4;
const ICW1_IC4: u8 = 1 << 0;
const ICW1_SINGLE: u8 = 1 << 1;

/// OCW2 bits
const OCW2_EOI: u8 = 1 << 5;
const OCW2_SPECIFIC: u8 = 1 << 6;
const OCW2_ROTATE: u8 = 1 << 7;

/// OCW3 bits
const OCW3_MARKER: u8 = 1 << 3;
const OCW3_POLL: u8 = 1 << 2;
const OCW3_READ_ISR: u8 = 0b11;
const OCW3_READ_IRR: u8 = 0b10;

/// Where the 8259 is in its ICW programming sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum InitState {
    Ready,
    ExpectIcw2,
    ExpectIcw3,
    ExpectIcw4,
}

/// One 8259 chip.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chip {
    init: InitState,
    /// ICW1 latched at init start (IC4/single bits matter later).
    icw1: u8,
    /// Vector offset.
    icw2: u8,
    /// Cascade mask (master) or slave id (slave).
    icw3: u8,
    icw4: u8,
    /// Interrupt request register: lines currently requesting.
    irr: u8,
    /// In-service register.
    isr: u8,
    /// Interrupt mask register (OCW1).
    imr: u8,
    /// Lowest-priority IRQ; priority runs from (base+1) mod 8 downward.
    priority_base: u8,
    /// Latched line levels for edge detection.
    levels: u8,
    /// OCW3 register-read selector: true = ISR, false = IRR.
    read_isr: bool,
    /// Poll command pending: next data read returns poll byte.
    poll_pending: bool,
    /// Spurious interrupt counter (IRQ7 on master, IRQ15 on slave).
    spurious: u64,
}

impl Chip {
    fn new() -> Self {
        Self {
            init: InitState::Ready,
            icw1: 0,
            icw2: 0,
            icw3: 0,
            icw4: 0,
            irr: 0,
            isr: 0,
            imr: 0xFF,
            priority_base: 7,
            levels: 0,
            read_isr: false,
            poll_pending: false,
            spurious: 0,
        }
    }

    fn command_write(&mut self, value: u8) {
        if value & ICW1_INIT != 0 {
            // ICW1: restart the init sequence, clear mask and state.
            self.icw1 = value;
            self.init = InitState::ExpectIcw2;
            self.imr = 0;
            self.isr = 0;
            self.irr = 0;
            self.priority_base = 7;
            self.read_isr = false;
            debug!(icw1 = value, "pic init sequence started");
        } else if value & OCW3_MARKER != 0 {
            // OCW3
            if value & OCW3_POLL != 0 {
                self.poll_pending = true;
            }
            match value & 0b11 {
                OCW3_READ_ISR => self.read_isr = true,
                OCW3_READ_IRR => self.read_isr = false,
                _ => {}
            }
        } else {
            // OCW2
            self.ocw2(value);
        }
    }

    fn ocw2(&mut self, value: u8) {
        let level = value & 0x07;
        match value & (OCW2_ROTATE | OCW2_SPECIFIC | OCW2_EOI) {
            v if v & OCW2_EOI != 0 && v & OCW2_SPECIFIC != 0 => {
                // Specific EOI
                self.isr &= !(1 << level);
                if v & OCW2_ROTATE != 0 {
                    self.priority_base = level;
                }
            }
            v if v & OCW2_EOI != 0 => {
                // Non-specific EOI: clear the highest-priority in-service bit.
                if let Some(irq) = self.highest_priority(self.isr) {
                    self.isr &= !(1 << irq);
                    if v & OCW2_ROTATE != 0 {
                        self.priority_base = irq;
                    }
                }
            }
            v if v & OCW2_ROTATE != 0 => {
                // Set priority (rotate without EOI)
                self.priority_base = level;
            }
            _ => {}
        }
    }

    fn data_write(&mut self, value: u8) {
        match self.init {
            InitState::ExpectIcw2 => {
                self.icw2 = value & 0xF8;
                self.init = if self.icw1 & ICW1_SINGLE != 0 {
                    if self.icw1 & ICW1_IC4 != 0 {
                        InitState::ExpectIcw4
                    } else {
                        InitState::Ready
                    }
                } else {
                    InitState::ExpectIcw3
                };
            }
            InitState::ExpectIcw3 => {
                self.icw3 = value;
                self.init = if self.icw1 & ICW1_IC4 != 0 {
                    InitState::ExpectIcw4
                } else {
                    InitState::Ready
                };
            }
            InitState::ExpectIcw4 => {
                self.icw4 = value;
                self.init = InitState::Ready;
            }
            InitState::Ready => {
                // OCW1: interrupt mask
                self.imr = value;
            }
        }
    }

    fn data_read(&self) -> u8 {
        self.imr
    }

    fn command_read(&mut self) -> u8 {
        if self.poll_pending {
            self.poll_pending = false;
            return match self.pending() {
                Some(irq) => {
                    self.ack(irq);
                    0x80 | irq
                }
                None => 0,
            };
        }
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }

    /// Resolve the highest-priority set bit in `bits`, honoring rotation.
    fn highest_priority(&self, bits: u8) -> Option<u8> {
        if bits == 0 {
            return None;
        }
        for i in 1..=8u8 {
            let irq = (self.priority_base + i) % 8;
            if bits & (1 << irq) != 0 {
                return Some(irq);
            }
        }
        None
    }

    /// Highest-priority unmasked request not already in service.
    fn pending(&self) -> Option<u8> {
        let candidates = self.irr & !self.imr;
        let irq = self.highest_priority(candidates)?;
        // A higher-priority interrupt already in service blocks delivery.
        if let Some(serving) = self.highest_priority(self.isr) {
            let dist = |i: u8| (i + 8 - (self.priority_base + 1) % 8) % 8;
            if dist(serving) <= dist(irq) {
                return None;
            }
        }
        Some(irq)
    }

    fn ack(&mut self, irq: u8) {
        self.isr |= 1 << irq;
        // Edge-triggered: request consumed on acknowledge.
        self.irr &= !(1 << irq);
    }

    fn set_line(&mut self, irq: u8, high: bool) {
        let bit = 1u8 << irq;
        let was = self.levels & bit != 0;
        if high {
            self.levels |= bit;
            if !was {
                self.irr |= bit;
            }
        } else {
            self.levels &= !bit;
        }
    }
}

/// Shared dual-8259 state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DualPic {
    master: Chip,
    slave: Chip,
}

impl DualPic {
    fn new() -> Self {
        Self {
            master: Chip::new(),
            slave: Chip::new(),
        }
    }

    /// Deliver at most one pending vector; returns it if one was acked.
    fn next_vector(&mut self) -> Option<u8> {
        // Slave requests cascade through master IRQ2.
        if self.slave.pending().is_some() {
            self.master.set_line(2, true);
        }
        let master_irq = self.master.pending()?;
        if master_irq == 2 {
            match self.slave.pending() {
                Some(slave_irq) => {
                    self.master.ack(2);
                    self.slave.ack(slave_irq);
                    self.master.set_line(2, false);
                    Some(self.slave.icw2 + slave_irq)
                }
                None => {
                    // Request vanished between cascade and ack: spurious IRQ15.
                    self.slave.spurious += 1;
                    self.master.set_line(2, false);
                    Some(self.slave.icw2 + 7)
                }
            }
        } else {
            self.master.ack(master_irq);
            Some(self.master.icw2 + master_irq)
        }
    }

    fn set_pin(&mut self, pin: u32, high: bool) {
        match pin {
            0..=7 => self.master.set_line(pin as u8, high),
            8..=15 => self.slave.set_line((pin - 8) as u8, high),
            _ => {}
        }
    }
}

/// The chipset-facing PIC device.
pub struct PicDevice {
    state: Arc<Mutex<DualPic>>,
    injector: Arc<dyn VectorInjector>,
}

impl PicDevice {
    pub fn new(injector: Arc<dyn VectorInjector>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DualPic::new())),
            injector,
        }
    }

    /// Router half, to be attached to the chipset [`crate::chipset::LineSet`].
    pub fn router(&self) -> Arc<dyn IrqRouter> {
        Arc::new(PicRouter {
            state: self.state.clone(),
            injector: self.injector.clone(),
        })
    }

    /// Spurious counters (master IRQ7, slave IRQ15).
    pub fn spurious_counts(&self) -> (u64, u64) {
        let s = self.state.lock().unwrap();
        (s.master.spurious, s.slave.spurious)
    }

    fn deliver_pending(&self) {
        deliver_pending(&self.state, self.injector.as_ref());
    }
}

fn deliver_pending(state: &Arc<Mutex<DualPic>>, injector: &dyn VectorInjector) {
    let vector = state.lock().unwrap().next_vector();
    if let Some(vector) = vector {
        trace!(vector, "pic delivering vector");
        // Fixed delivery to CPU 0 in xAPIC physical mode.
        let _ = injector.signal(0xFEE0_0000, vector as u32);
    }
}

struct PicRouter {
    state: Arc<Mutex<DualPic>>,
    injector: Arc<dyn VectorInjector>,
}

impl IrqRouter for PicRouter {
    fn set_pin(&self, pin: u32, high: bool) {
        if pin > 15 {
            return;
        }
        self.state.lock().unwrap().set_pin(pin, high);
        if high {
            deliver_pending(&self.state, self.injector.as_ref());
        }
    }

    fn eoi(&self, _vector: u8) {
        // The guest EOIs the 8259 through OCW2, not the LAPIC broadcast.
    }
}

impl Device for PicDevice {
    fn kind(&self) -> &'static str {
        "pic-8259"
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        vec![PortRange::new(MASTER_CMD, 2), PortRange::new(SLAVE_CMD, 2)]
    }

    fn pio_read(&mut self, port: u16, data: &mut [u8]) -> DeviceResult {
        let mut state = self.state.lock().unwrap();
        let value = match port {
            MASTER_CMD => state.master.command_read(),
            MASTER_DATA => state.master.data_read(),
            SLAVE_CMD => state.slave.command_read(),
            SLAVE_DATA => state.slave.data_read(),
            _ => 0xFF,
        };
        data.fill(value);
        Ok(())
    }

    fn pio_write(&mut self, port: u16, data: &[u8]) -> DeviceResult {
        let Some(&value) = data.first() else {
            return Ok(());
        };
        {
            let mut state = self.state.lock().unwrap();
            match port {
                MASTER_CMD => state.master.command_write(value),
                MASTER_DATA => state.master.data_write(value),
                SLAVE_CMD => state.slave.command_write(value),
                SLAVE_DATA => state.slave.data_write(value),
                _ => {}
            }
        }
        // An EOI or unmask may unblock a lower-priority request.
        self.deliver_pending();
        Ok(())
    }

    fn reset(&mut self) {
        *self.state.lock().unwrap() = DualPic::new();
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(&*self.state.lock().unwrap())?)
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<()> {
        *self.state.lock().unwrap() = postcard::from_bytes(blob)?;
        Ok(())
    }
}
