//! Legacy chipset devices
//!
//! Small state machines obeying their real hardware register maps at a level
//! sufficient to boot a stock Linux:
//! - dual 8259 PIC and 24-pin IOAPIC (interrupt fabric backends)
//! - 8254 PIT with the port-0x61 gate/speaker companion
//! - HPET
//! - MC146818 CMOS/RTC
//! - 16550 serial UART
//! - i8042 keyboard controller with PS/2 keyboard and mouse
//! - fw_cfg firmware configuration with DMA

pub mod fw_cfg;
pub mod hpet;
pub mod i8042;
pub mod ioapic;
pub mod pic;
pub mod pit;
pub mod rtc;
pub mod serial;

pub use fw_cfg::FwCfgDevice;
pub use hpet::HpetDevice;
pub use i8042::I8042Device;
pub use ioapic::IoapicDevice;
pub use pic::PicDevice;
pub use pit::{PitDevice, SpeakerPort};
pub use rtc::RtcDevice;
pub use serial::SerialDevice;
