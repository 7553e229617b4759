//! High Precision Event Timer
//!
//! Single main counter at 100 MHz virtual time with three comparators and
//! optional legacy replacement routing (timer 0 → IRQ0, timer 1 → IRQ8).
//! The counter is derived from elapsed host time so the guest's clocksource
//! selection logic can read it and watch it advance; comparator expirations
//! are converted into line pulses by the poll thread.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use vm_memory::GuestMemoryMmap;

use crate::chipset::{Device, IrqLine, MmioRange};
use crate::error::DeviceResult;
use crate::Result;

/// HPET MMIO window.
pub const HPET_BASE: u64 = 0xFED0_0000;
const HPET_SIZE: u64 = 0x400;

/// Counter frequency: 100 MHz, i.e. 10 ns per tick.
const TICK_FS: u64 = 10_000_000;
const TICKS_PER_SEC: u64 = 100_000_000;

const NUM_TIMERS: usize = 3;

/// Register offsets.
const REG_CAPS: u64 = 0x000;
const REG_CONFIG: u64 = 0x010;
const REG_INT_STATUS: u64 = 0x020;
const REG_COUNTER: u64 = 0x0F0;
const REG_TIMER_BASE: u64 = 0x100;
const TIMER_STRIDE: u64 = 0x20;

/// General config bits.
const CFG_ENABLE: u64 = 1 << 0;
const CFG_LEGACY: u64 = 1 << 1;

/// Timer config bits.
const TIMER_INT_ENABLE: u64 = 1 << 2;
const TIMER_PERIODIC: u64 = 1 << 3;
const TIMER_PERIODIC_CAP: u64 = 1 << 4;
const TIMER_SIZE_64: u64 = 1 << 5;
const TIMER_VAL_SET: u64 = 1 << 6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Timer {
    config: u64,
    comparator: u64,
    /// Period captured when the guest armed a periodic timer.
    period: u64,
    /// Last counter value for which this timer fired.
    last_fired: u64,
}

impl Timer {
    fn new() -> Self {
        Self {
            config: TIMER_PERIODIC_CAP | TIMER_SIZE_64,
            comparator: u64::MAX,
            period: 0,
            last_fired: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HpetState {
    config: u64,
    int_status: u64,
    timers: [Timer; NUM_TIMERS],
    /// Counter value when the counter was last written or halted.
    counter_base: u64,
    /// Virtual ns when counting (re)started; meaningful while enabled.
    started_at_ns: u64,
}

impl HpetState {
    fn new() -> Self {
        Self {
            config: 0,
            int_status: 0,
            timers: [Timer::new(); NUM_TIMERS],
            counter_base: 0,
            started_at_ns: 0,
        }
    }

    fn enabled(&self) -> bool {
        self.config & CFG_ENABLE != 0
    }

    fn counter(&self, now_ns: u64) -> u64 {
        if !self.enabled() {
            return self.counter_base;
        }
        let elapsed = now_ns.saturating_sub(self.started_at_ns);
        self.counter_base + elapsed * TICKS_PER_SEC / 1_000_000_000
    }
}

/// The chipset-facing HPET device.
pub struct HpetDevice {
    state: Arc<Mutex<HpetState>>,
    /// Per-timer output lines (legacy routing: IRQ0, IRQ8, spare).
    lines: Vec<IrqLine>,
    epoch: Instant,
}

impl HpetDevice {
    pub fn new(lines: Vec<IrqLine>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HpetState::new())),
            lines,
            epoch: Instant::now(),
        }
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn read_reg(&self, offset: u64) -> u64 {
        let state = self.state.lock().unwrap();
        match offset {
            REG_CAPS => {
                // Rev 1, NUM_TIMERS-1 in bits 12:8, 64-bit counter, legacy
                // capable, vendor 0x8086, period in femtoseconds up top.
                0x1 | (((NUM_TIMERS as u64) - 1) << 8)
                    | (1 << 13)
                    | (1 << 15)
                    | (0x8086 << 16)
                    | (TICK_FS << 32)
            }
            REG_CONFIG => state.config,
            REG_INT_STATUS => state.int_status,
            REG_COUNTER => state.counter(self.now_ns()),
            o if o >= REG_TIMER_BASE => {
                let timer = ((o - REG_TIMER_BASE) / TIMER_STRIDE) as usize;
                if timer >= NUM_TIMERS {
                    return 0;
                }
                match (o - REG_TIMER_BASE) % TIMER_STRIDE {
                    0x0 => state.timers[timer].config,
                    0x8 => state.timers[timer].comparator,
                    _ => 0,
                }
            }
            _ => 0,
        }
    }

    fn write_reg(&self, offset: u64, value: u64) {
        let now_ns = self.now_ns();
        let mut state = self.state.lock().unwrap();
        match offset {
            REG_CONFIG => {
                let was_enabled = state.enabled();
                state.config = value & (CFG_ENABLE | CFG_LEGACY);
                if state.enabled() && !was_enabled {
                    state.started_at_ns = now_ns;
                } else if !state.enabled() && was_enabled {
                    state.counter_base = state.counter(now_ns);
                }
            }
            REG_INT_STATUS => {
                // Write-1-to-clear (level mode); edge mode ignores.
                state.int_status &= !value;
            }
            REG_COUNTER => {
                // Only defined while halted.
                if !state.enabled() {
                    state.counter_base = value;
                }
            }
            o if o >= REG_TIMER_BASE => {
                let timer = ((o - REG_TIMER_BASE) / TIMER_STRIDE) as usize;
                if timer >= NUM_TIMERS {
                    return;
                }
                let counter = state.counter(now_ns);
                let t = &mut state.timers[timer];
                match (o - REG_TIMER_BASE) % TIMER_STRIDE {
                    0x0 => {
                        let writable =
                            TIMER_INT_ENABLE | TIMER_PERIODIC | TIMER_VAL_SET;
                        t.config = (t.config & !writable) | (value & writable);
                    }
                    0x8 => {
                        if t.config & TIMER_PERIODIC != 0 {
                            if t.config & TIMER_VAL_SET != 0 {
                                // Direct comparator write; VAL_SET self-clears.
                                t.comparator = value;
                                t.config &= !TIMER_VAL_SET;
                            } else {
                                // Writing the period arms it from "now".
                                t.period = value;
                                t.comparator = counter.wrapping_add(value);
                            }
                        } else {
                            t.comparator = value;
                        }
                        t.last_fired = counter;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

impl Device for HpetDevice {
    fn kind(&self) -> &'static str {
        "hpet"
    }

    fn mmio_ranges(&self) -> Vec<MmioRange> {
        vec![MmioRange::new(HPET_BASE, HPET_SIZE)]
    }

    fn wants_poll(&self) -> bool {
        true
    }

    fn mmio_read(&mut self, addr: u64, data: &mut [u8], _mem: &GuestMemoryMmap) -> DeviceResult {
        let offset = addr - HPET_BASE;
        // Serve 4-byte accesses from the aligned 8-byte register.
        let reg_offset = offset & !0x7;
        let value = self.read_reg(reg_offset);
        let shifted = value >> ((offset & 0x7) * 8);
        let bytes = shifted.to_le_bytes();
        let len = data.len().min(8);
        data[..len].copy_from_slice(&bytes[..len]);
        Ok(())
    }

    fn mmio_write(&mut self, addr: u64, data: &[u8], _mem: &GuestMemoryMmap) -> DeviceResult {
        let offset = addr - HPET_BASE;
        let reg_offset = offset & !0x7;
        let value = if data.len() >= 8 {
            u64::from_le_bytes(data[..8].try_into().unwrap())
        } else {
            // 32-bit access: merge into the existing register half.
            let mut bytes = [0u8; 4];
            bytes[..data.len().min(4)].copy_from_slice(&data[..data.len().min(4)]);
            let part = u32::from_le_bytes(bytes) as u64;
            let current = self.read_reg(reg_offset);
            if offset & 0x4 != 0 {
                (current & 0x0000_0000_FFFF_FFFF) | (part << 32)
            } else {
                (current & 0xFFFF_FFFF_0000_0000) | part
            }
        };
        self.write_reg(reg_offset, value);
        Ok(())
    }

    fn poll(&mut self, _now: Instant, _mem: &GuestMemoryMmap) {
        let now_ns = self.now_ns();
        let mut fired = [false; NUM_TIMERS];
        {
            let mut state = self.state.lock().unwrap();
            if !state.enabled() {
                return;
            }
            let counter = state.counter(now_ns);
            for (i, t) in state.timers.iter_mut().enumerate() {
                if t.config & TIMER_INT_ENABLE == 0 {
                    continue;
                }
                if counter >= t.comparator && t.comparator > t.last_fired {
                    fired[i] = true;
                    t.last_fired = counter;
                    if t.config & TIMER_PERIODIC != 0 && t.period > 0 {
                        // Advance past "counter", preserving phase.
                        while t.comparator <= counter {
                            t.comparator = t.comparator.wrapping_add(t.period);
                        }
                    }
                }
            }
            for (i, f) in fired.iter().enumerate() {
                if *f {
                    state.int_status |= 1 << i;
                }
            }
        }
        for (i, f) in fired.iter().enumerate() {
            if *f {
                if let Some(line) = self.lines.get(i) {
                    line.pulse();
                }
            }
        }
    }

    fn reset(&mut self) {
        *self.state.lock().unwrap() = HpetState::new();
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        // Freeze the counter into the blob so restore resumes from it.
        let mut state = self.state.lock().unwrap().clone();
        state.counter_base = state.counter(self.now_ns());
        state.started_at_ns = 0;
        Ok(postcard::to_stdvec(&state)?)
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<()> {
        let mut state: HpetState = postcard::from_bytes(blob)?;
        state.started_at_ns = self.now_ns();
        *self.state.lock().unwrap() = state;
        Ok(())
    }
}
