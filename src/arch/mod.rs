//! Per-architecture boot helpers
//!
//! Everything a freshly-created vCPU needs before its first instruction:
//! initial register files, early page tables, and the memory-layout
//! constants the loader and chipset agree on. Devices stay
//! architecture-agnostic; only MMIO base addresses differ, and those are
//! configuration.

pub mod aarch64;
pub mod riscv64;
pub mod x86_64;

use serde::{Deserialize, Serialize};

/// Guest instruction-set architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    X86_64,
    Aarch64,
    Riscv64,
}

impl Architecture {
    /// The architecture of the host this process runs on, when it is one we
    /// can virtualize natively.
    pub fn host() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86_64" => Some(Self::X86_64),
            "aarch64" => Some(Self::Aarch64),
            "riscv64" => Some(Self::Riscv64),
            _ => None,
        }
    }

    /// OCI-style architecture name ("amd64", "arm64", "riscv64").
    pub fn oci_name(&self) -> &'static str {
        match self {
            Self::X86_64 => "amd64",
            Self::Aarch64 => "arm64",
            Self::Riscv64 => "riscv64",
        }
    }

    /// Where guest RAM begins for this architecture.
    pub fn ram_base(&self) -> u64 {
        match self {
            Self::X86_64 => 0,
            Self::Aarch64 => aarch64::layout::RAM_BASE,
            Self::Riscv64 => riscv64::layout::RAM_BASE,
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X86_64 => write!(f, "x86_64"),
            Self::Aarch64 => write!(f, "aarch64"),
            Self::Riscv64 => write!(f, "riscv64"),
        }
    }
}
