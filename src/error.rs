//! Error types for cradle

use thiserror::Error;

/// Result type alias using the cradle [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by cradle operations.
///
/// Device handlers recover conditions local to one device (a bad descriptor
/// chain resets that queue); anything that would corrupt VM state propagates
/// through here and fails the `run()` call.
#[derive(Error, Debug)]
pub enum Error {
    /// The platform cannot provide hardware virtualization (missing /dev/kvm,
    /// missing entitlement). Distinguished so callers can skip gracefully.
    #[error("hypervisor unavailable: {0}")]
    HypervisorUnavailable(String),

    /// Overlapping memory slot, MMIO/port conflict, bad feature combination.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unhandled VM exit or triple fault. Fatal for the VM, never the host.
    #[error("guest fault: {exit_reason} ({context})")]
    GuestFault {
        exit_reason: String,
        context: String,
    },

    /// Storage, network, or guest memory access failure.
    #[error("I/O error during {op} on {target}: {source}")]
    Io {
        op: &'static str,
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Operation after VM close or before boot-complete.
    #[error("VM is not running")]
    NotRunning,

    /// Per-call deadline exceeded.
    #[error("timeout during {0}")]
    Timeout(&'static str),

    /// A guest-side syscall failed; carries the guest errno.
    #[error("guest rpc {op} failed: errno {errno}")]
    Rpc { op: &'static str, errno: i32 },

    /// Snapshot restore attempted against a VM with a different config hash.
    #[error("snapshot does not match VM configuration")]
    SnapshotMismatch,

    /// The supplied context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// KVM ioctl errors (Linux only)
    #[cfg(target_os = "linux")]
    #[error("KVM error: {0}")]
    Kvm(#[from] kvm_ioctls::Error),

    /// Guest memory access errors
    #[error("memory error: {0}")]
    Memory(String),

    /// Kernel/boot image errors
    #[error("boot error: {0}")]
    Boot(String),

    /// Device emulation errors
    #[error("device error: {0}")]
    Device(String),

    /// Plain I/O errors without op context
    #[error("I/O error: {0}")]
    PlainIo(#[from] std::io::Error),

    /// Serialization errors (manifests, image config)
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Binary state blob (de)serialization errors
    #[error("state encoding error: {0}")]
    State(#[from] postcard::Error),

    /// Control-plane wire-format errors
    #[error("protocol error: {0}")]
    Protocol(#[from] cradle_protocol::ProtocolError),
}

impl Error {
    /// Attach op/path context to a bare `std::io::Error`.
    pub fn io(op: &'static str, target: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            target: target.into(),
            source,
        }
    }

    /// True when the error means "try again later" rather than "give up".
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

/// Outcome of a device MMIO/PIO handler: done, or deferred to the poll list.
pub type DeviceResult = std::result::Result<(), DeviceError>;

/// Errors a device handler may produce.
///
/// `Yield` is a sentinel, not a failure: the handler needs host I/O it must
/// not block the vCPU thread for, so the exit dispatcher parks the work on
/// the poll list and re-enters the VM.
#[derive(Debug)]
pub enum DeviceError {
    /// Real work is pending; re-enter the VM and let the poll thread drain it.
    Yield,
    /// The access could not be handled; surfaces to the VM as a fault.
    Failed(Error),
}

impl From<Error> for DeviceError {
    fn from(e: Error) -> Self {
        DeviceError::Failed(e)
    }
}
