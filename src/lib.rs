//! cradle: a programmable micro-VMM
//!
//! cradle boots a minimal Linux guest from an OCI container extract inside a
//! hardware-virtualized VM, then lets the host drive the guest as if it were
//! a local process — reading files, spawning commands, opening sockets —
//! through an API that mirrors the standard library's filesystem/exec/net
//! surface.
//!
//! # Key pieces
//!
//! - **Hypervisor abstraction** ([`hv`]): KVM-backed VMs with memory slots,
//!   vCPU threads, exit dispatch, and whole-VM snapshot capture/restore.
//! - **Chipset** ([`chipset`], [`devices`]): legacy PC devices plus a
//!   pluggable virtio-MMIO transport ([`virtio`]).
//! - **Control plane** ([`rpc`], `cradle-init`): a vsock-framed RPC that
//!   turns host API calls into guest-side syscalls.
//! - **Snapshot engine** ([`snapshot`]): content-addressed COW filesystem
//!   layers, re-materialized as image sources for Dockerfile-style builds.
//!
//! # Example
//!
//! ```no_run
//! use cradle::{Instance, InstanceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = InstanceConfig::default()
//!         .kernel("/var/lib/cradle/vmlinux")
//!         .memory_mib(128);
//!
//!     let mut instance = Instance::new(config).await?;
//!     let output = instance.command("/bin/echo")?.arg("hello").run().await?;
//!     assert_eq!(output.stdout_str(), "hello\n");
//!
//!     instance.stop().await?;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod arch;
pub mod chipset;
pub mod config;
pub mod devices;
pub mod error;
pub mod loader;
pub mod rpc;
pub mod snapshot;
pub mod source;
pub mod trace;
pub mod virtio;

// The hypervisor backend and the instance assembly need KVM.
#[cfg(target_os = "linux")]
pub mod hv;
#[cfg(target_os = "linux")]
pub mod instance;

// Re-exports for convenience
pub use config::InstanceConfig;
pub use error::{Error, Result};
#[cfg(target_os = "linux")]
pub use instance::Instance;
pub use rpc::exec::ExecOutput;
pub use source::{InstanceSource, RuntimeConfig};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::InstanceConfig;
    pub use crate::error::{Error, Result};
    #[cfg(target_os = "linux")]
    pub use crate::instance::Instance;
    pub use crate::rpc::exec::ExecOutput;
    pub use crate::snapshot::{SnapshotFactory, SnapshotStore};
    pub use crate::source::{DirSource, InstanceSource, OciExtractSource, RuntimeConfig};
}
