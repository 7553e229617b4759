//! I/O APIC (82093AA-style, 24 inputs)
//!
//! Indirect register access through IOREGSEL/IOWIN at 0xFEC00000.
//! Redirection entries carry vector, delivery mode, destination mode,
//! polarity, trigger, mask, and destination. For level-triggered entries the
//! remote-IRR bit is set on delivery and cleared only on EOI; if the input
//! line is still high at EOI time the interrupt is delivered again.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::trace;
use vm_memory::GuestMemoryMmap;

use crate::arch::x86_64::layout::IOAPIC_BASE;
use crate::chipset::{Device, IrqRouter, MmioRange, VectorInjector};
use crate::error::DeviceResult;
use crate::Result;

pub const NUM_PINS: usize = 24;

const IOREGSEL: u64 = 0x00;
const IOWIN: u64 = 0x10;
/// Direct EOI register (IOAPIC version 0x20+).
const IOEOI: u64 = 0x40;

const REG_ID: u8 = 0x00;
const REG_VERSION: u8 = 0x01;
const REG_ARBITRATION: u8 = 0x02;
const REG_REDIR_BASE: u8 = 0x10;

/// Redirection entry bit positions.
const RED_MASKED: u64 = 1 << 16;
const RED_TRIGGER_LEVEL: u64 = 1 << 15;
const RED_REMOTE_IRR: u64 = 1 << 14;
const RED_DEST_LOGICAL: u64 = 1 << 11;
const RED_DELIVERY_STATUS: u64 = 1 << 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IoapicState {
    id: u32,
    ioregsel: u8,
    redirect: [u64; NUM_PINS],
    /// Current input line levels.
    levels: [bool; NUM_PINS],
}

impl IoapicState {
    fn new() -> Self {
        Self {
            id: 0,
            ioregsel: 0,
            // Reset value: masked, vector 0.
            redirect: [RED_MASKED; NUM_PINS],
            levels: [false; NUM_PINS],
        }
    }

    fn read_reg(&self, reg: u8) -> u32 {
        match reg {
            REG_ID => self.id,
            REG_VERSION => 0x20 | (((NUM_PINS as u32) - 1) << 16),
            REG_ARBITRATION => self.id,
            r if r >= REG_REDIR_BASE && r < REG_REDIR_BASE + 2 * NUM_PINS as u8 => {
                let idx = ((r - REG_REDIR_BASE) / 2) as usize;
                let entry = self.redirect[idx];
                if (r - REG_REDIR_BASE) % 2 == 0 {
                    entry as u32
                } else {
                    (entry >> 32) as u32
                }
            }
            _ => 0,
        }
    }

    fn write_reg(&mut self, reg: u8, value: u32) {
        match reg {
            REG_ID => self.id = value & 0x0F00_0000,
            r if r >= REG_REDIR_BASE && r < REG_REDIR_BASE + 2 * NUM_PINS as u8 => {
                let idx = ((r - REG_REDIR_BASE) / 2) as usize;
                let entry = &mut self.redirect[idx];
                if (r - REG_REDIR_BASE) % 2 == 0 {
                    // Remote-IRR and delivery status are read-only.
                    let ro = *entry & (RED_REMOTE_IRR | RED_DELIVERY_STATUS);
                    *entry = (*entry & 0xFFFF_FFFF_0000_0000)
                        | (value as u64 & !(RED_REMOTE_IRR | RED_DELIVERY_STATUS))
                        | ro;
                } else {
                    *entry = (*entry & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32);
                }
            }
            _ => {}
        }
    }

    /// Whether `pin` is ready for delivery right now.
    fn deliverable(&self, pin: usize) -> bool {
        let entry = self.redirect[pin];
        if entry & RED_MASKED != 0 {
            return false;
        }
        if entry & RED_TRIGGER_LEVEL != 0 && entry & RED_REMOTE_IRR != 0 {
            // Level interrupt already in flight.
            return false;
        }
        true
    }

    /// Compose the xAPIC MSI address/data pair for a redirection entry.
    fn msi_for(&self, pin: usize) -> (u64, u32) {
        let entry = self.redirect[pin];
        let vector = (entry & 0xFF) as u32;
        let delivery_mode = ((entry >> 8) & 0x7) as u32;
        let dest = ((entry >> 56) & 0xFF) as u64;
        let dest_logical = (entry & RED_DEST_LOGICAL != 0) as u64;
        let trigger_level = (entry & RED_TRIGGER_LEVEL != 0) as u32;

        let address = 0xFEE0_0000 | (dest << 12) | (dest_logical << 2);
        let data = vector | (delivery_mode << 8) | (trigger_level << 15);
        (address, data)
    }
}

/// The chipset-facing IOAPIC device.
pub struct IoapicDevice {
    state: Arc<Mutex<IoapicState>>,
    injector: Arc<dyn VectorInjector>,
}

impl IoapicDevice {
    pub fn new(injector: Arc<dyn VectorInjector>) -> Self {
        Self {
            state: Arc::new(Mutex::new(IoapicState::new())),
            injector,
        }
    }

    /// Router half, attached to the chipset line set. Also the EOI target:
    /// the LAPIC acknowledge broadcast lands here.
    pub fn router(&self) -> Arc<dyn IrqRouter> {
        Arc::new(IoapicRouter {
            state: self.state.clone(),
            injector: self.injector.clone(),
        })
    }

    fn eoi_internal(state: &Arc<Mutex<IoapicState>>, injector: &dyn VectorInjector, vector: u8) {
        let mut redeliver = Vec::new();
        {
            let mut s = state.lock().unwrap();
            for pin in 0..NUM_PINS {
                let entry = s.redirect[pin];
                if entry & 0xFF == vector as u64 && entry & RED_REMOTE_IRR != 0 {
                    s.redirect[pin] &= !RED_REMOTE_IRR;
                    // Still-high level line: deliver again.
                    if s.levels[pin] && s.deliverable(pin) {
                        s.redirect[pin] |= RED_REMOTE_IRR;
                        redeliver.push(s.msi_for(pin));
                    }
                }
            }
        }
        for (address, data) in redeliver {
            trace!(vector, "ioapic re-delivering after eoi");
            let _ = injector.signal(address, data);
        }
    }
}

struct IoapicRouter {
    state: Arc<Mutex<IoapicState>>,
    injector: Arc<dyn VectorInjector>,
}

impl IrqRouter for IoapicRouter {
    fn set_pin(&self, pin: u32, high: bool) {
        let pin = pin as usize;
        if pin >= NUM_PINS {
            return;
        }
        let deliver = {
            let mut s = self.state.lock().unwrap();
            let was = s.levels[pin];
            s.levels[pin] = high;
            let rising = high && !was;
            if rising && s.deliverable(pin) {
                if s.redirect[pin] & RED_TRIGGER_LEVEL != 0 {
                    s.redirect[pin] |= RED_REMOTE_IRR;
                }
                Some(s.msi_for(pin))
            } else {
                None
            }
        };
        if let Some((address, data)) = deliver {
            trace!(pin, "ioapic delivering");
            let _ = self.injector.signal(address, data);
        }
    }

    fn eoi(&self, vector: u8) {
        IoapicDevice::eoi_internal(&self.state, self.injector.as_ref(), vector);
    }
}

impl Device for IoapicDevice {
    fn kind(&self) -> &'static str {
        "ioapic"
    }

    fn mmio_ranges(&self) -> Vec<MmioRange> {
        vec![MmioRange::new(IOAPIC_BASE, 0x100)]
    }

    fn mmio_read(&mut self, addr: u64, data: &mut [u8], _mem: &GuestMemoryMmap) -> DeviceResult {
        let offset = addr - IOAPIC_BASE;
        let state = self.state.lock().unwrap();
        let value = match offset {
            IOREGSEL => state.ioregsel as u32,
            IOWIN => state.read_reg(state.ioregsel),
            _ => 0,
        };
        let bytes = value.to_le_bytes();
        let len = data.len().min(4);
        data[..len].copy_from_slice(&bytes[..len]);
        Ok(())
    }

    fn mmio_write(&mut self, addr: u64, data: &[u8], _mem: &GuestMemoryMmap) -> DeviceResult {
        let offset = addr - IOAPIC_BASE;
        let mut bytes = [0u8; 4];
        let len = data.len().min(4);
        bytes[..len].copy_from_slice(&data[..len]);
        let value = u32::from_le_bytes(bytes);

        match offset {
            IOREGSEL => self.state.lock().unwrap().ioregsel = value as u8,
            IOWIN => {
                let reg = self.state.lock().unwrap().ioregsel;
                self.state.lock().unwrap().write_reg(reg, value);
            }
            IOEOI => {
                IoapicDevice::eoi_internal(&self.state, self.injector.as_ref(), value as u8);
            }
            _ => {}
        }
        Ok(())
    }

    fn reset(&mut self) {
        *self.state.lock().unwrap() = IoapicState::new();
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(&*self.state.lock().unwrap())?)
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<()> {
        *self.state.lock().unwrap() = postcard::from_bytes(blob)?;
        Ok(())
    }
}
