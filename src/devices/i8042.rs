//! i8042 keyboard controller with PS/2 keyboard and mouse
//!
//! Data port 0x60, status/command port 0x64. Models the controller command
//! byte, the single output buffer with its owner bit (keyboard vs aux), the
//! A20 gate, the CPU pulse-reset command, and the standard device command
//! sets (reset, enable/disable, LEDs, typematic rate, ID). Keyboard bytes
//! are produced in scancode set 2 and translated to set 1 when the command
//! byte's translate bit is on, which is how Linux expects a PC to behave.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::chipset::{Device, IrqLine, PortRange};
use crate::error::DeviceResult;
use crate::Result;

const PORT_DATA: u16 = 0x60;
const PORT_STATUS: u16 = 0x64;

/// Status register bits.
mod status {
    pub const OBF: u8 = 1 << 0;
    pub const IBF: u8 = 1 << 1;
    pub const SYS: u8 = 1 << 2;
    pub const CMD: u8 = 1 << 3;
    pub const AUX_OBF: u8 = 1 << 5;
}

/// Command byte bits.
mod cmdbyte {
    pub const KBD_INT: u8 = 1 << 0;
    pub const AUX_INT: u8 = 1 << 1;
    pub const SYS: u8 = 1 << 2;
    pub const KBD_DISABLE: u8 = 1 << 4;
    pub const AUX_DISABLE: u8 = 1 << 5;
    pub const TRANSLATE: u8 = 1 << 6;
}

/// Set-2 → set-1 make-code translation for the keys a boot and a shell need.
/// Break codes arrive as 0xF0+make in set 2 and leave as make|0x80 in set 1.
const SET2_TO_SET1: &[(u8, u8)] = &[
    (0x76, 0x01), // esc
    (0x16, 0x02),
    (0x1E, 0x03),
    (0x26, 0x04),
    (0x25, 0x05),
    (0x2E, 0x06),
    (0x36, 0x07),
    (0x3D, 0x08),
    (0x3E, 0x09),
    (0x46, 0x0A),
    (0x45, 0x0B), // 1-0
    (0x4E, 0x0C),
    (0x55, 0x0D),
    (0x66, 0x0E), // - = backspace
    (0x0D, 0x0F), // tab
    (0x15, 0x10),
    (0x1D, 0x11),
    (0x24, 0x12),
    (0x2D, 0x13),
    (0x2C, 0x14),
    (0x35, 0x15),
    (0x3C, 0x16),
    (0x43, 0x17),
    (0x44, 0x18),
    (0x4D, 0x19), // qwertyuiop
    (0x54, 0x1A),
    (0x5B, 0x1B),
    (0x5A, 0x1C), // [ ] enter
    (0x14, 0x1D), // left ctrl
    (0x1C, 0x1E),
    (0x1B, 0x1F),
    (0x23, 0x20),
    (0x2B, 0x21),
    (0x34, 0x22),
    (0x33, 0x23),
    (0x3B, 0x24),
    (0x42, 0x25),
    (0x4B, 0x26), // asdfghjkl
    (0x4C, 0x27),
    (0x52, 0x28),
    (0x0E, 0x29), // ; ' `
    (0x12, 0x2A), // left shift
    (0x5D, 0x2B), // backslash
    (0x1A, 0x2C),
    (0x22, 0x2D),
    (0x21, 0x2E),
    (0x2A, 0x2F),
    (0x32, 0x30),
    (0x31, 0x31),
    (0x3A, 0x32), // zxcvbnm
    (0x41, 0x33),
    (0x49, 0x34),
    (0x4A, 0x35), // , . /
    (0x59, 0x36), // right shift
    (0x11, 0x38), // left alt
    (0x29, 0x39), // space
    (0x58, 0x3A), // caps lock
];

fn translate_set2(code: u8) -> u8 {
    SET2_TO_SET1
        .iter()
        .find(|(s2, _)| *s2 == code)
        .map(|(_, s1)| *s1)
        .unwrap_or(code)
}

/// One byte in the output buffer, tagged with its producer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum OutByte {
    Kbd(u8),
    Aux(u8),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct I8042State {
    command_byte: u8,
    /// Pending controller command awaiting its parameter on port 0x60.
    pending_cmd: Option<u8>,
    /// Pending keyboard command awaiting a parameter (LEDs, rate).
    kbd_pending: Option<u8>,
    /// Pending mouse command awaiting a parameter.
    aux_pending: Option<u8>,
    out: VecDeque<OutByte>,
    a20: bool,
    kbd_enabled: bool,
    aux_enabled: bool,
    kbd_leds: u8,
    kbd_rate: u8,
    aux_sample_rate: u8,
    aux_resolution: u8,
    aux_stream: bool,
}

impl I8042State {
    fn new() -> Self {
        Self {
            command_byte: cmdbyte::KBD_INT | cmdbyte::SYS | cmdbyte::TRANSLATE,
            pending_cmd: None,
            kbd_pending: None,
            aux_pending: None,
            out: VecDeque::new(),
            a20: true,
            kbd_enabled: true,
            aux_enabled: false,
            kbd_leds: 0,
            kbd_rate: 0x2B,
            aux_sample_rate: 100,
            aux_resolution: 2,
            aux_stream: false,
        }
    }

    fn push_kbd(&mut self, byte: u8) {
        self.out.push_back(OutByte::Kbd(byte));
    }

    fn push_aux(&mut self, byte: u8) {
        self.out.push_back(OutByte::Aux(byte));
    }

    fn status(&self) -> u8 {
        let mut value = status::SYS;
        if let Some(front) = self.out.front() {
            value |= status::OBF;
            if matches!(front, OutByte::Aux(_)) {
                value |= status::AUX_OBF;
            }
        }
        value
    }
}

/// The chipset-facing i8042 device.
pub struct I8042Device {
    state: I8042State,
    irq_kbd: IrqLine,
    irq_aux: IrqLine,
    /// Raised when the guest issues the pulse-reset command (0xFE).
    reset_requested: Arc<AtomicBool>,
}

impl I8042Device {
    pub fn new(irq_kbd: IrqLine, irq_aux: IrqLine) -> Self {
        Self::with_reset_flag(irq_kbd, irq_aux, Arc::new(AtomicBool::new(false)))
    }

    /// Share the hypervisor's reboot flag so a pulse-reset command ends the
    /// current run with a reboot outcome.
    pub fn with_reset_flag(
        irq_kbd: IrqLine,
        irq_aux: IrqLine,
        reset_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state: I8042State::new(),
            irq_kbd,
            irq_aux,
            reset_requested,
        }
    }

    /// Shared flag set when the guest asks the 8042 to pulse CPU reset.
    pub fn reset_flag(&self) -> Arc<AtomicBool> {
        self.reset_requested.clone()
    }

    /// Current A20 gate state.
    pub fn a20_enabled(&self) -> bool {
        self.state.a20
    }

    /// Inject a key event as a set-2 make code; `press == false` produces
    /// the break sequence.
    pub fn inject_key(&mut self, set2_code: u8, press: bool) {
        if !self.state.kbd_enabled || self.state.command_byte & cmdbyte::KBD_DISABLE != 0 {
            return;
        }
        if self.state.command_byte & cmdbyte::TRANSLATE != 0 {
            let set1 = translate_set2(set2_code);
            self.state
                .push_kbd(if press { set1 } else { set1 | 0x80 });
        } else {
            if !press {
                self.state.push_kbd(0xF0);
            }
            self.state.push_kbd(set2_code);
        }
        self.raise_irqs();
    }

    /// Inject a mouse movement/button packet (stream mode).
    pub fn inject_mouse(&mut self, dx: i8, dy: i8, buttons: u8) {
        if !self.state.aux_enabled || !self.state.aux_stream {
            return;
        }
        let mut head = 0x08 | (buttons & 0x07);
        if dx < 0 {
            head |= 0x10;
        }
        if dy < 0 {
            head |= 0x20;
        }
        self.state.push_aux(head);
        self.state.push_aux(dx as u8);
        self.state.push_aux(dy as u8);
        self.raise_irqs();
    }

    fn raise_irqs(&self) {
        match self.state.out.front() {
            Some(OutByte::Kbd(_)) if self.state.command_byte & cmdbyte::KBD_INT != 0 => {
                self.irq_kbd.pulse();
            }
            Some(OutByte::Aux(_)) if self.state.command_byte & cmdbyte::AUX_INT != 0 => {
                self.irq_aux.pulse();
            }
            _ => {}
        }
    }

    fn controller_command(&mut self, cmd: u8) {
        match cmd {
            0x20 => {
                let byte = self.state.command_byte;
                self.state.push_kbd(byte);
            }
            0x60 | 0xD1 | 0xD4 => self.state.pending_cmd = Some(cmd),
            0xA7 => self.state.aux_enabled = false,
            0xA8 => self.state.aux_enabled = true,
            0xA9 => self.state.push_kbd(0x00), // aux interface test: ok
            0xAA => {
                // Controller self-test resets to defaults.
                self.state = I8042State::new();
                self.state.push_kbd(0x55);
            }
            0xAB => self.state.push_kbd(0x00), // kbd interface test: ok
            0xAD => self.state.kbd_enabled = false,
            0xAE => self.state.kbd_enabled = true,
            0xD0 => {
                // Read output port: bit 0 = no reset, bit 1 = A20.
                let byte = 0x01 | ((self.state.a20 as u8) << 1);
                self.state.push_kbd(byte);
            }
            0xFE => {
                debug!("i8042 pulse reset requested");
                self.reset_requested.store(true, Ordering::SeqCst);
            }
            0xF0..=0xFD | 0xFF => {} // other output-line pulses ignored
            other => trace!(cmd = other, "i8042 unhandled controller command"),
        }
        self.raise_irqs();
    }

    fn data_write(&mut self, value: u8) {
        match self.state.pending_cmd.take() {
            Some(0x60) => {
                self.state.command_byte = value;
                return;
            }
            Some(0xD1) => {
                self.state.a20 = value & 0x02 != 0;
                if value & 0x01 == 0 {
                    self.reset_requested.store(true, Ordering::SeqCst);
                }
                debug!(a20 = self.state.a20, "i8042 output port written");
                return;
            }
            Some(0xD4) => {
                self.aux_command(value);
                self.raise_irqs();
                return;
            }
            _ => {}
        }
        self.kbd_command(value);
        self.raise_irqs();
    }

    fn kbd_command(&mut self, value: u8) {
        if let Some(cmd) = self.state.kbd_pending.take() {
            match cmd {
                0xED => self.state.kbd_leds = value,
                0xF3 => self.state.kbd_rate = value,
                _ => {}
            }
            self.state.push_kbd(0xFA);
            return;
        }
        match value {
            0xFF => {
                // Reset: ACK then BAT ok.
                self.state.push_kbd(0xFA);
                self.state.push_kbd(0xAA);
            }
            0xF4 => {
                self.state.kbd_enabled = true;
                self.state.push_kbd(0xFA);
            }
            0xF5 => {
                self.state.kbd_enabled = false;
                self.state.push_kbd(0xFA);
            }
            0xED | 0xF3 => {
                self.state.kbd_pending = Some(value);
                self.state.push_kbd(0xFA);
            }
            0xF2 => {
                self.state.push_kbd(0xFA);
                self.state.push_kbd(0xAB);
                self.state.push_kbd(0x83);
            }
            0xEE => self.state.push_kbd(0xEE), // echo
            _ => self.state.push_kbd(0xFA),
        }
    }

    fn aux_command(&mut self, value: u8) {
        if let Some(cmd) = self.state.aux_pending.take() {
            match cmd {
                0xE8 => self.state.aux_resolution = value,
                0xF3 => self.state.aux_sample_rate = value,
                _ => {}
            }
            self.state.push_aux(0xFA);
            return;
        }
        match value {
            0xFF => {
                self.state.aux_stream = false;
                self.state.push_aux(0xFA);
                self.state.push_aux(0xAA);
                self.state.push_aux(0x00);
            }
            0xF4 => {
                self.state.aux_stream = true;
                self.state.push_aux(0xFA);
            }
            0xF5 => {
                self.state.aux_stream = false;
                self.state.push_aux(0xFA);
            }
            0xF2 => {
                self.state.push_aux(0xFA);
                self.state.push_aux(0x00);
            }
            0xE8 | 0xF3 => {
                self.state.aux_pending = Some(value);
                self.state.push_aux(0xFA);
            }
            _ => self.state.push_aux(0xFA),
        }
    }
}

impl Device for I8042Device {
    fn kind(&self) -> &'static str {
        "i8042"
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        vec![PortRange::new(PORT_DATA, 1), PortRange::new(PORT_STATUS, 1)]
    }

    fn pio_read(&mut self, port: u16, data: &mut [u8]) -> DeviceResult {
        let value = match port {
            PORT_STATUS => self.state.status(),
            _ => {
                let byte = match self.state.out.pop_front() {
                    Some(OutByte::Kbd(b)) | Some(OutByte::Aux(b)) => b,
                    None => 0,
                };
                // More buffered bytes re-raise the interrupt.
                self.raise_irqs();
                byte
            }
        };
        data.fill(value);
        Ok(())
    }

    fn pio_write(&mut self, port: u16, data: &[u8]) -> DeviceResult {
        let Some(&value) = data.first() else {
            return Ok(());
        };
        match port {
            PORT_STATUS => self.controller_command(value),
            _ => self.data_write(value),
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.state = I8042State::new();
        self.reset_requested.store(false, Ordering::SeqCst);
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(&self.state)?)
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<()> {
        self.state = postcard::from_bytes(blob)?;
        Ok(())
    }
}
