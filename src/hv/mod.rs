//! Hypervisor abstraction
//!
//! Configures vCPUs, maps guest physical memory, dispatches VM exits into
//! the chipset, and supports live capture/restore of full VM state. The KVM
//! backend is the only one implemented; `open_for_architecture` reports
//! [`crate::Error::HypervisorUnavailable`] when the platform cannot provide
//! hardware virtualization, so callers can skip gracefully.

pub mod kvm;
pub mod memory;
pub mod snapshot;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::arch::Architecture;
use crate::{Error, Result};

pub use kvm::KvmVm;
pub use memory::{GuestRam, MemorySlot};
pub use snapshot::VmSnapshot;

/// Why `run` returned. Each cause is programmatically distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest asked to halt (HLT with interrupts off, PSCI SYSTEM_OFF).
    GuestHalt,
    /// The guest requested a reboot (i8042 pulse reset, PSCI SYSTEM_RESET).
    GuestReboot,
    /// A device handler returned the yield sentinel; poll and re-enter.
    DeviceYield,
    /// The supplied context was cancelled.
    Cancelled,
}

/// Cancellation handle passed into `run`. Clone freely.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Per-run tuning knobs.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Budget a device handler may block a vCPU thread for before it must
    /// yield instead.
    pub handler_timeout: Duration,
    /// Poll-thread tick interval.
    pub poll_interval: Duration,
    /// The watchdog aborts the process if a vCPU ignores cancellation for
    /// `watchdog_multiplier *` this long.
    pub run_timeout: Duration,
    pub watchdog_multiplier: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_millis(10),
            poll_interval: Duration::from_millis(1),
            run_timeout: Duration::from_secs(5),
            watchdog_multiplier: 4,
        }
    }
}

/// Static VM shape, fixed at construction.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub arch: Architecture,
    pub ram_base: u64,
    pub ram_size: u64,
    pub vcpu_count: usize,
}

impl VmConfig {
    pub fn new(arch: Architecture, ram_size: u64, vcpu_count: usize) -> Self {
        Self {
            arch,
            ram_base: arch.ram_base(),
            ram_size,
            vcpu_count,
        }
    }
}

/// Deterministic identifier of VM hardware configuration: architecture, RAM
/// geometry, vCPU count, and the ordered device signatures. A snapshot is
/// only restorable into a VM with an identical hash.
pub fn config_hash(config: &VmConfig, device_signatures: &[(String, String)]) -> [u8; 32] {
    let encoded = postcard::to_stdvec(&(
        config.arch,
        config.ram_base,
        config.ram_size,
        config.vcpu_count as u64,
        device_signatures,
    ))
    .expect("config encoding cannot fail");
    let digest = Sha256::digest(&encoded);
    digest.into()
}

/// Entry point: open the platform VT engine for `arch`.
pub fn open_for_architecture(arch: Architecture) -> Result<KvmHypervisor> {
    if Architecture::host() != Some(arch) {
        return Err(Error::HypervisorUnavailable(format!(
            "host is {}, cannot virtualize {} natively",
            std::env::consts::ARCH,
            arch
        )));
    }
    KvmHypervisor::open()
}

/// An opened /dev/kvm handle, factory for VMs.
pub struct KvmHypervisor {
    kvm: kvm_ioctls::Kvm,
}

impl KvmHypervisor {
    pub fn open() -> Result<Self> {
        let kvm = kvm_ioctls::Kvm::new().map_err(|e| {
            Error::HypervisorUnavailable(format!("/dev/kvm unavailable: {}", e))
        })?;
        Ok(Self { kvm })
    }

    pub fn api_version(&self) -> i32 {
        self.kvm.get_api_version()
    }

    pub fn new_vm(&self, config: VmConfig) -> Result<KvmVm> {
        KvmVm::new(&self.kvm, config)
    }
}
