//! virtio-input (device id 18)
//!
//! Tablet-style absolute pointer plus keyboard. The config space is the
//! select/subsel window advertising EV_KEY/EV_ABS capability bitmaps and
//! the 0–32767 absolute axis ranges; BTN_TOUCH is present so the guest
//! binds the device as a pointer rather than a joystick. Every coalesced
//! axis update is terminated with SYN_REPORT before it reaches the event
//! queue.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use vm_memory::GuestMemoryMmap;

use crate::virtio::{device_id, features, NotifyOutcome, Virtqueue, VirtioDevice};
use crate::Result;

const Q_EVENT: usize = 0;
const Q_STATUS: usize = 1;

/// Config select values.
mod select {
    pub const ID_NAME: u8 = 0x01;
    pub const ID_DEVIDS: u8 = 0x02;
    pub const PROP_BITS: u8 = 0x10;
    pub const EV_BITS: u8 = 0x11;
    pub const ABS_INFO: u8 = 0x12;
}

/// Linux input event types and codes we advertise.
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_ABS: u16 = 0x03;
pub const SYN_REPORT: u16 = 0x00;
pub const BTN_LEFT: u16 = 0x110;
pub const BTN_TOUCH: u16 = 0x14A;
pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;

/// Absolute axis range for the tablet.
pub const ABS_MAX: u32 = 32767;

/// One 8-byte wire event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEvent {
    pub ev_type: u16,
    pub code: u16,
    pub value: u32,
}

impl InputEvent {
    fn to_wire(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&self.ev_type.to_le_bytes());
        out[2..4].copy_from_slice(&self.code.to_le_bytes());
        out[4..8].copy_from_slice(&self.value.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InputState {
    select: u8,
    subsel: u8,
    pending: VecDeque<InputEvent>,
    name: String,
}

/// The virtio input device.
pub struct Input {
    state: InputState,
}

impl Input {
    pub fn new(name: &str) -> Self {
        Self {
            state: InputState {
                select: 0,
                subsel: 0,
                pending: VecDeque::new(),
                name: name.to_string(),
            },
        }
    }

    /// Queue a key press/release followed by SYN_REPORT.
    pub fn inject_key(&mut self, code: u16, pressed: bool) {
        self.state.pending.push_back(InputEvent {
            ev_type: EV_KEY,
            code,
            value: pressed as u32,
        });
        self.push_syn();
    }

    /// Queue an absolute pointer move (and optional touch state change) as
    /// one coalesced update ending in SYN_REPORT.
    pub fn inject_abs(&mut self, x: u32, y: u32, touch: Option<bool>) {
        self.state.pending.push_back(InputEvent {
            ev_type: EV_ABS,
            code: ABS_X,
            value: x.min(ABS_MAX),
        });
        self.state.pending.push_back(InputEvent {
            ev_type: EV_ABS,
            code: ABS_Y,
            value: y.min(ABS_MAX),
        });
        if let Some(down) = touch {
            self.state.pending.push_back(InputEvent {
                ev_type: EV_KEY,
                code: BTN_TOUCH,
                value: down as u32,
            });
        }
        self.push_syn();
    }

    fn push_syn(&mut self) {
        self.state.pending.push_back(InputEvent {
            ev_type: EV_SYN,
            code: SYN_REPORT,
            value: 0,
        });
    }

    /// The payload for the current select/subsel pair.
    fn config_payload(&self) -> Vec<u8> {
        match self.state.select {
            select::ID_NAME => self.state.name.as_bytes().to_vec(),
            select::ID_DEVIDS => {
                // {bustype, vendor, product, version} all u16 le.
                let mut out = Vec::with_capacity(8);
                out.extend_from_slice(&0x0006u16.to_le_bytes()); // BUS_VIRTUAL
                out.extend_from_slice(&0x0627u16.to_le_bytes());
                out.extend_from_slice(&0x0001u16.to_le_bytes());
                out.extend_from_slice(&0x0001u16.to_le_bytes());
                out
            }
            select::PROP_BITS => Vec::new(),
            select::EV_BITS => match self.state.subsel as u16 {
                0 => {
                    // Supported event types bitmap: SYN, KEY, ABS.
                    let mut bits = [0u8; 1];
                    bits[0] = (1 << EV_SYN) | (1 << EV_KEY) | (1 << EV_ABS);
                    bits.to_vec()
                }
                t if t == EV_KEY => {
                    // Key bitmap covering BTN_LEFT and BTN_TOUCH plus the
                    // keyboard range.
                    let mut bits = vec![0u8; (BTN_TOUCH as usize / 8) + 1];
                    for code in 1..=0x58u16 {
                        bits[code as usize / 8] |= 1 << (code % 8);
                    }
                    bits[BTN_LEFT as usize / 8] |= 1 << (BTN_LEFT % 8);
                    bits[BTN_TOUCH as usize / 8] |= 1 << (BTN_TOUCH % 8);
                    bits
                }
                t if t == EV_ABS => {
                    vec![(1 << ABS_X) | (1 << ABS_Y)]
                }
                _ => Vec::new(),
            },
            select::ABS_INFO => {
                let axis = self.state.subsel as u16;
                if axis == ABS_X || axis == ABS_Y {
                    // {min, max, fuzz, flat, res} all u32 le.
                    let mut out = Vec::with_capacity(20);
                    out.extend_from_slice(&0u32.to_le_bytes());
                    out.extend_from_slice(&ABS_MAX.to_le_bytes());
                    out.extend_from_slice(&0u32.to_le_bytes());
                    out.extend_from_slice(&0u32.to_le_bytes());
                    out.extend_from_slice(&0u32.to_le_bytes());
                    out
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn flush_events(&mut self, queues: &mut [Virtqueue], mem: &GuestMemoryMmap) -> Result<bool> {
        let mut progressed = false;
        while let Some(event) = self.state.pending.front().copied() {
            let Some(chain) = queues[Q_EVENT].pop_chain(mem)? else {
                break;
            };
            let n = chain.write_at(mem, 0, &event.to_wire())?;
            queues[Q_EVENT].add_used(mem, chain.head, n as u32)?;
            self.state.pending.pop_front();
            progressed = true;
        }
        Ok(progressed)
    }
}

impl VirtioDevice for Input {
    fn device_id(&self) -> u32 {
        device_id::INPUT
    }

    fn device_features(&self) -> u64 {
        features::VERSION_1
    }

    fn queue_max_sizes(&self) -> Vec<u16> {
        vec![64, 64]
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        // Layout: {u8 select, u8 subsel, u8 size, u8 reserved[5], u8 payload[]}
        let payload = self.config_payload();
        for (i, slot) in data.iter_mut().enumerate() {
            let off = offset as usize + i;
            *slot = match off {
                0 => self.state.select,
                1 => self.state.subsel,
                2 => payload.len().min(128) as u8,
                3..=7 => 0,
                _ => payload.get(off - 8).copied().unwrap_or(0),
            };
        }
    }

    fn config_write(&mut self, offset: u64, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            match offset as usize + i {
                0 => self.state.select = byte,
                1 => self.state.subsel = byte,
                _ => {}
            }
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
            Q_EVENT => {
                if self.flush_events(queues, mem)? {
                    outcome.merge(NotifyOutcome::used(Q_EVENT));
                }
            }
            Q_STATUS => {
                // LED/repeat writes from the guest: consume and complete.
                while let Some(chain) = queues[Q_STATUS].pop_chain(mem)? {
                    let _ = chain.read_all(mem)?;
                    queues[Q_STATUS].add_used(mem, chain.head, 0)?;
                    outcome.merge(NotifyOutcome::used(Q_STATUS));
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
        if self.flush_events(queues, mem)? {
            outcome.merge(NotifyOutcome::used(Q_EVENT));
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
