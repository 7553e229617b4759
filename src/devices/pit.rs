//! 8254 programmable interval timer, plus NMI status port 0x61
//!
//! Three channels, modes 0–5, with counters maintained in virtual time
//! derived from the polling clock rather than host timer ticks: reads
//! compute the current count from elapsed time at 1.193182 MHz. Channel 0
//! output pulses IRQ0; channel 2's gate is controlled by port 0x61 bit 0 and
//! its output is readable at bit 5.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::trace;
use vm_memory::GuestMemoryMmap;

use crate::chipset::{Device, IrqLine, PortRange};
use crate::error::DeviceResult;
use crate::Result;

/// PIT input clock in Hz.
pub const PIT_HZ: u64 = 1_193_182;

const PORT_CH0: u16 = 0x40;
const PORT_CH2: u16 = 0x42;
const PORT_CONTROL: u16 = 0x43;
const PORT_NMI_STATUS: u16 = 0x61;

/// Access mode from the control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Access {
    LatchOnly,
    LoByte,
    HiByte,
    Word,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Channel {
    /// Programmed reload value; 0 means 65536.
    reload: u16,
    mode: u8,
    bcd: bool,
    access: Access,
    /// Write sequencing for Word access: next byte is high.
    write_hi_next: bool,
    /// Partial low byte of an in-progress Word write.
    write_lo: u8,
    /// Read sequencing for Word access.
    read_hi_next: bool,
    /// Count latched by a latch command, drained byte-wise.
    latched_count: Option<u16>,
    /// Status latched by a readback command.
    latched_status: Option<u8>,
    /// Gate input (always high for ch0/ch1; ch2 follows port 0x61 bit 0).
    gate: bool,
    /// Virtual nanoseconds at the moment the count was (re)loaded.
    loaded_at_ns: u64,
    /// Whether a reload value has been written at all.
    armed: bool,
}

impl Channel {
    fn new() -> Self {
        Self {
            reload: 0,
            mode: 0,
            bcd: false,
            access: Access::Word,
            write_hi_next: false,
            write_lo: 0,
            read_hi_next: false,
            latched_count: None,
            latched_status: None,
            gate: true,
            loaded_at_ns: 0,
            armed: false,
        }
    }

    fn period_ticks(&self) -> u64 {
        if self.reload == 0 {
            65536
        } else {
            self.reload as u64
        }
    }

    fn elapsed_ticks(&self, now_ns: u64) -> u64 {
        if !self.armed || !self.gate {
            return 0;
        }
        let ns = now_ns.saturating_sub(self.loaded_at_ns);
        ns * PIT_HZ / 1_000_000_000
    }

    /// Current counter value in virtual time.
    fn current_count(&self, now_ns: u64) -> u16 {
        let period = self.period_ticks();
        let elapsed = self.elapsed_ticks(now_ns);
        let remaining = match self.mode {
            // Mode 0/1/4/5: one-shot count down, sticks at terminal count.
            0 | 1 | 4 | 5 => period.saturating_sub(elapsed),
            // Mode 2 (rate generator): reload each period.
            2 => period - (elapsed % period),
            // Mode 3 (square wave): counts down by two.
            3 => period - ((elapsed * 2) % period),
            _ => period.saturating_sub(elapsed),
        };
        remaining as u16
    }

    /// Output pin level in virtual time.
    fn output(&self, now_ns: u64) -> bool {
        if !self.armed {
            return self.mode != 0;
        }
        let period = self.period_ticks();
        let elapsed = self.elapsed_ticks(now_ns);
        match self.mode {
            // Mode 0: low until terminal count, then high.
            0 => elapsed >= period,
            // Mode 2: high except for one tick per period.
            2 => (elapsed % period) != period - 1,
            // Mode 3: high for the first half of each period.
            3 => (elapsed % period) < period.div_ceil(2),
            _ => true,
        }
    }

    /// Number of complete periods since the count was loaded.
    fn expirations(&self, now_ns: u64) -> u64 {
        if !self.armed {
            return 0;
        }
        match self.mode {
            2 | 3 => self.elapsed_ticks(now_ns) / self.period_ticks(),
            _ => u64::from(self.elapsed_ticks(now_ns) >= self.period_ticks()),
        }
    }

    fn status_byte(&self, now_ns: u64) -> u8 {
        let access_bits = match self.access {
            Access::LatchOnly => 0,
            Access::LoByte => 1,
            Access::HiByte => 2,
            Access::Word => 3,
        };
        ((self.output(now_ns) as u8) << 7)
            | (((!self.armed) as u8) << 6)
            | (access_bits << 4)
            | (self.mode << 1)
            | self.bcd as u8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PitState {
    channels: [Channel; 3],
    /// Port 0x61: bit 0 = ch2 gate, bit 1 = speaker data.
    nmi_status: u8,
    /// Expirations of channel 0 already converted into IRQ pulses.
    ch0_fired: u64,
}

impl PitState {
    fn new() -> Self {
        Self {
            channels: [Channel::new(), Channel::new(), Channel::new()],
            nmi_status: 0,
            ch0_fired: 0,
        }
    }
}

/// Shared handle between the PIT and the port-0x61 device.
#[derive(Clone)]
pub struct PitHandle {
    state: Arc<Mutex<PitState>>,
    /// Virtual-time epoch. Not serialized; re-seated on restore.
    epoch: Arc<Mutex<Instant>>,
}

impl PitHandle {
    fn now_ns(&self) -> u64 {
        self.epoch.lock().unwrap().elapsed().as_nanos() as u64
    }
}

/// The chipset-facing 8254 device.
pub struct PitDevice {
    handle: PitHandle,
    irq0: IrqLine,
}

impl PitDevice {
    pub fn new(irq0: IrqLine) -> Self {
        Self {
            handle: PitHandle {
                state: Arc::new(Mutex::new(PitState::new())),
                epoch: Arc::new(Mutex::new(Instant::now())),
            },
            irq0,
        }
    }

    /// Shared state handle for the port-0x61 companion device.
    pub fn handle(&self) -> PitHandle {
        self.handle.clone()
    }

    fn control_write(&self, value: u8) {
        let now_ns = self.handle.now_ns();
        let mut state = self.handle.state.lock().unwrap();
        let channel_sel = value >> 6;

        if channel_sel == 3 {
            // Readback command: bit4 clear = latch count, bit5 clear = latch
            // status, bits 1-3 select channels.
            let latch_count = value & 0x20 == 0;
            let latch_status = value & 0x10 == 0;
            for ch in 0..3 {
                if value & (2 << ch) == 0 {
                    continue;
                }
                let chan = &mut state.channels[ch];
                if latch_count && chan.latched_count.is_none() {
                    chan.latched_count = Some(chan.current_count(now_ns));
                }
                if latch_status && chan.latched_status.is_none() {
                    chan.latched_status = Some(chan.status_byte(now_ns));
                }
            }
            return;
        }

        let chan = &mut state.channels[channel_sel as usize];
        let access = (value >> 4) & 0x3;
        if access == 0 {
            // Counter latch command.
            if chan.latched_count.is_none() {
                chan.latched_count = Some(chan.current_count(now_ns));
            }
            return;
        }
        chan.access = match access {
            1 => Access::LoByte,
            2 => Access::HiByte,
            _ => Access::Word,
        };
        chan.mode = (value >> 1) & 0x7;
        if chan.mode > 5 {
            chan.mode -= 4; // 6/7 alias to 2/3
        }
        chan.bcd = value & 1 != 0;
        chan.write_hi_next = false;
        chan.read_hi_next = false;
        chan.armed = false;
        trace!(
            channel = channel_sel,
            mode = chan.mode,
            "pit control word"
        );
    }

    fn counter_write(&self, channel: usize, value: u8) {
        let now_ns = self.handle.now_ns();
        let mut state = self.handle.state.lock().unwrap();
        if channel == 0 {
            state.ch0_fired = 0;
        }
        let chan = &mut state.channels[channel];
        match chan.access {
            Access::LoByte => {
                chan.reload = value as u16;
                chan.loaded_at_ns = now_ns;
                chan.armed = true;
            }
            Access::HiByte => {
                chan.reload = (value as u16) << 8;
                chan.loaded_at_ns = now_ns;
                chan.armed = true;
            }
            Access::Word | Access::LatchOnly => {
                if chan.write_hi_next {
                    chan.reload = ((value as u16) << 8) | chan.write_lo as u16;
                    chan.loaded_at_ns = now_ns;
                    chan.armed = true;
                } else {
                    chan.write_lo = value;
                }
                chan.write_hi_next = !chan.write_hi_next;
            }
        }
    }

    fn counter_read(&self, channel: usize) -> u8 {
        let now_ns = self.handle.now_ns();
        let mut state = self.handle.state.lock().unwrap();
        let chan = &mut state.channels[channel];

        if let Some(status) = chan.latched_status.take() {
            return status;
        }

        let count = chan
            .latched_count
            .unwrap_or_else(|| chan.current_count(now_ns));
        match chan.access {
            Access::LoByte => {
                chan.latched_count = None;
                count as u8
            }
            Access::HiByte => {
                chan.latched_count = None;
                (count >> 8) as u8
            }
            Access::Word | Access::LatchOnly => {
                let byte = if chan.read_hi_next {
                    chan.latched_count = None;
                    (count >> 8) as u8
                } else {
                    byte_keep_latch(chan, count)
                };
                chan.read_hi_next = !chan.read_hi_next;
                byte
            }
        }
    }
}

fn byte_keep_latch(chan: &mut Channel, count: u16) -> u8 {
    // Keep the latch for the high byte so the pair is consistent.
    if chan.latched_count.is_none() {
        chan.latched_count = Some(count);
    }
    count as u8
}

impl Device for PitDevice {
    fn kind(&self) -> &'static str {
        "pit-8254"
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        vec![PortRange::new(PORT_CH0, 4)]
    }

    fn wants_poll(&self) -> bool {
        true
    }

    fn pio_read(&mut self, port: u16, data: &mut [u8]) -> DeviceResult {
        let value = match port {
            PORT_CH0 | 0x41 | PORT_CH2 => self.counter_read((port - PORT_CH0) as usize),
            PORT_CONTROL => 0xFF, // control port is write-only
            _ => 0xFF,
        };
        data.fill(value);
        Ok(())
    }

    fn pio_write(&mut self, port: u16, data: &[u8]) -> DeviceResult {
        let Some(&value) = data.first() else {
            return Ok(());
        };
        match port {
            PORT_CH0 | 0x41 | PORT_CH2 => self.counter_write((port - PORT_CH0) as usize, value),
            PORT_CONTROL => self.control_write(value),
            _ => {}
        }
        Ok(())
    }

    fn poll(&mut self, _now: Instant, _mem: &GuestMemoryMmap) {
        let now_ns = self.handle.now_ns();
        let pulses = {
            let mut state = self.handle.state.lock().unwrap();
            let expired = state.channels[0].expirations(now_ns);
            let due = expired.saturating_sub(state.ch0_fired);
            state.ch0_fired = expired;
            // A long poll gap collapses into a bounded burst.
            due.min(8)
        };
        for _ in 0..pulses {
            self.irq0.pulse();
        }
    }

    fn reset(&mut self) {
        *self.handle.state.lock().unwrap() = PitState::new();
        *self.handle.epoch.lock().unwrap() = Instant::now();
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(&*self.handle.state.lock().unwrap())?)
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<()> {
        *self.handle.state.lock().unwrap() = postcard::from_bytes(blob)?;
        // Virtual time restarts; counts continue from their reload points.
        *self.handle.epoch.lock().unwrap() = Instant::now();
        Ok(())
    }
}

/// System control port B (0x61): channel 2 gate, speaker data, and the
/// readable channel 2 output at bit 5.
pub struct SpeakerPort {
    pit: PitHandle,
}

impl SpeakerPort {
    pub fn new(pit: PitHandle) -> Self {
        Self { pit }
    }
}

impl Device for SpeakerPort {
    fn kind(&self) -> &'static str {
        "port61"
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        vec![PortRange::new(PORT_NMI_STATUS, 1)]
    }

    fn pio_read(&mut self, _port: u16, data: &mut [u8]) -> DeviceResult {
        let now_ns = self.pit.now_ns();
        let state = self.pit.state.lock().unwrap();
        let mut value = state.nmi_status & 0x0F;
        if state.channels[2].output(now_ns) {
            value |= 1 << 5;
        }
        data.fill(value);
        Ok(())
    }

    fn pio_write(&mut self, _port: u16, data: &[u8]) -> DeviceResult {
        let Some(&value) = data.first() else {
            return Ok(());
        };
        let now_ns = self.pit.now_ns();
        let mut state = self.pit.state.lock().unwrap();
        state.nmi_status = value & 0x0F;
        let gate = value & 1 != 0;
        let chan = &mut state.channels[2];
        if gate && !chan.gate {
            // Rising gate restarts the count.
            chan.loaded_at_ns = now_ns;
        }
        chan.gate = gate;
        Ok(())
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        // Port 0x61 state lives inside the PIT blob.
        Ok(Vec::new())
    }

    fn restore_state(&mut self, _blob: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chipset::LineSet;

    fn pit() -> PitDevice {
        let lines = LineSet::new();
        PitDevice::new(lines.allocate("pit", 0))
    }

    fn set_now(dev: &PitDevice, ns: u64) {
        // Rewind the epoch so `now_ns()` reports the wanted virtual time.
        *dev.handle.epoch.lock().unwrap() =
            Instant::now() - std::time::Duration::from_nanos(ns);
    }

    #[test]
    fn mode0_counts_down_in_virtual_time() {
        let mut dev = pit();
        // Channel 0, word access, mode 0.
        dev.pio_write(PORT_CONTROL, &[0b0011_0000]).unwrap();
        dev.pio_write(PORT_CH0, &[0x00]).unwrap();
        dev.pio_write(PORT_CH0, &[0x10]).unwrap(); // reload 0x1000

        // ~1 ms later about 1193 ticks have passed.
        set_now(&dev, 1_000_000 + dev.handle.now_ns());
        let lo = dev.counter_read(0) as u16;
        let hi = dev.counter_read(0) as u16;
        let count = (hi << 8) | lo;
        assert!(count < 0x1000);
        assert!(count > 0x1000 - 1400, "count {:#x} fell too far", count);
    }

    #[test]
    fn latch_freezes_count_for_paired_read() {
        let mut dev = pit();
        dev.pio_write(PORT_CONTROL, &[0b0011_0100]).unwrap(); // mode 2
        dev.pio_write(PORT_CH0, &[0xFF]).unwrap();
        dev.pio_write(PORT_CH0, &[0xFF]).unwrap();

        // Latch channel 0.
        dev.pio_write(PORT_CONTROL, &[0b0000_0000]).unwrap();
        let mut lo = [0u8];
        let mut hi = [0u8];
        dev.pio_read(PORT_CH0, &mut lo).unwrap();
        dev.pio_read(PORT_CH0, &mut hi).unwrap();
        let first = ((hi[0] as u16) << 8) | lo[0] as u16;
        assert!(first > 0);
    }

    #[test]
    fn readback_status_reports_mode() {
        let mut dev = pit();
        dev.pio_write(PORT_CONTROL, &[0b0011_0110]).unwrap(); // ch0 mode 3
        dev.pio_write(PORT_CH0, &[0x34]).unwrap();
        dev.pio_write(PORT_CH0, &[0x12]).unwrap();

        // Readback: latch status of channel 0.
        dev.pio_write(PORT_CONTROL, &[0b1101_0010]).unwrap();
        let mut status = [0u8];
        dev.pio_read(PORT_CH0, &mut status).unwrap();
        assert_eq!((status[0] >> 1) & 0x7, 3);
        assert_eq!((status[0] >> 4) & 0x3, 3); // word access
    }

    #[test]
    fn channel0_expirations_pulse_irq0() {
        let lines = LineSet::new();
        let line = lines.allocate("pit", 0);
        let mut dev = PitDevice::new(line);

        dev.pio_write(PORT_CONTROL, &[0b0011_0100]).unwrap(); // mode 2
        dev.pio_write(PORT_CH0, &[0xA9]).unwrap();
        dev.pio_write(PORT_CH0, &[0x04]).unwrap(); // 1193 -> 1 kHz

        let base = dev.handle.now_ns();
        set_now(&dev, base + 3_000_000); // 3 ms -> ~3 periods
        let mem =
            GuestMemoryMmap::from_ranges(&[(vm_memory::GuestAddress(0), 0x1000)]).unwrap();
        dev.poll(Instant::now(), &mem);
        let fired = dev.handle.state.lock().unwrap().ch0_fired;
        assert!((2..=4).contains(&fired), "fired {}", fired);
    }

    #[test]
    fn port61_gates_channel2() {
        let dev = pit();
        let mut speaker = SpeakerPort::new(dev.handle());

        // Gate off, then program channel 2 mode 3.
        speaker.pio_write(PORT_NMI_STATUS, &[0x00]).unwrap();
        {
            let mut s = dev.handle.state.lock().unwrap();
            s.channels[2].gate = false;
        }
        let mut p = pit_program(&dev);
        p(0b1011_0110, PORT_CONTROL);
        p(0x20, PORT_CH2);
        p(0x00, PORT_CH2);

        // Gate on: count restarts from now.
        speaker.pio_write(PORT_NMI_STATUS, &[0x01]).unwrap();
        assert!(dev.handle.state.lock().unwrap().channels[2].gate);

        let mut out = [0u8];
        speaker.pio_read(PORT_NMI_STATUS, &mut out).unwrap();
        // Mode 3 output starts high: bit 5 set.
        assert_ne!(out[0] & (1 << 5), 0);
    }

    fn pit_program(dev: &PitDevice) -> impl FnMut(u8, u16) + '_ {
        move |value, port| {
            let mut d = PitDevice {
                handle: dev.handle.clone(),
                irq0: dev.irq0.clone(),
            };
            d.pio_write(port, &[value]).unwrap();
        }
    }

    #[test]
    fn state_round_trip() {
        let mut dev = pit();
        dev.pio_write(PORT_CONTROL, &[0b0011_0100]).unwrap();
        dev.pio_write(PORT_CH0, &[0x10]).unwrap();
        dev.pio_write(PORT_CH0, &[0x00]).unwrap();

        let blob = dev.save_state().unwrap();
        let mut fresh = pit();
        fresh.restore_state(&blob).unwrap();
        let state = fresh.handle.state.lock().unwrap();
        assert_eq!(state.channels[0].reload, 0x10);
        assert_eq!(state.channels[0].mode, 2);
    }
}
