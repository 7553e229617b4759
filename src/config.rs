//! Configuration for cradle instances

use std::path::PathBuf;
use std::time::Duration;

use crate::arch::Architecture;
use crate::{Error, Result};

/// Configuration for creating a new [`crate::Instance`].
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Guest architecture (defaults to the host's).
    pub arch: Architecture,
    /// Memory size in MiB (default: 128).
    pub memory_mib: usize,
    /// Number of vCPUs (default: 1).
    pub vcpus: usize,
    /// Path to the kernel image (bzImage/vmlinux/Image).
    pub kernel: PathBuf,
    /// Path to an initramfs holding the init program (optional).
    pub initramfs: Option<PathBuf>,
    /// Block device image for /dev/vda (optional).
    pub disk: Option<PathBuf>,
    /// Attach a virtio-net device backed by a pluggable packet stack.
    pub network: bool,
    /// Attach virtio-gpu and virtio-input (interactive instances).
    pub graphics: bool,
    /// vsock context id (random >= 3 when unset).
    pub cid: Option<u32>,
    /// Additional kernel command line arguments.
    pub extra_cmdline: Vec<String>,
    /// Directory for the snapshot layer cache.
    pub snapshot_cache: PathBuf,
    /// How long to wait for the init program to dial in.
    pub boot_timeout: Duration,
    /// Install the seccomp-BPF filter on the VM event loop.
    pub seccomp: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            arch: Architecture::host().unwrap_or(Architecture::X86_64),
            memory_mib: 128,
            vcpus: 1,
            kernel: PathBuf::new(),
            initramfs: None,
            disk: None,
            network: false,
            graphics: false,
            cid: None,
            extra_cmdline: Vec::new(),
            snapshot_cache: default_cache_dir(),
            boot_timeout: Duration::from_secs(30),
            seccomp: true,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".cache/cradle");
    }
    PathBuf::from("/tmp/cradle-cache")
}

impl InstanceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory_mib(mut self, mib: usize) -> Self {
        self.memory_mib = mib;
        self
    }

    pub fn vcpus(mut self, count: usize) -> Self {
        self.vcpus = count;
        self
    }

    pub fn kernel<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.kernel = path.into();
        self
    }

    pub fn initramfs<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.initramfs = Some(path.into());
        self
    }

    pub fn disk<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.disk = Some(path.into());
        self
    }

    pub fn network(mut self, enable: bool) -> Self {
        self.network = enable;
        self
    }

    pub fn graphics(mut self, enable: bool) -> Self {
        self.graphics = enable;
        self
    }

    pub fn cid(mut self, cid: u32) -> Self {
        self.cid = Some(cid);
        self
    }

    pub fn extra_cmdline<S: Into<String>>(mut self, arg: S) -> Self {
        self.extra_cmdline.push(arg.into());
        self
    }

    pub fn snapshot_cache<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.snapshot_cache = dir.into();
        self
    }

    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = timeout;
        self
    }

    pub fn seccomp(mut self, enable: bool) -> Self {
        self.seccomp = enable;
        self
    }

    /// RAM size in bytes.
    pub fn ram_size(&self) -> u64 {
        (self.memory_mib as u64) << 20
    }

    /// Assemble the kernel command line. `virtio_stanzas` come from the
    /// MMIO transports so the guest discovers its devices without ACPI.
    pub fn kernel_cmdline(&self, virtio_stanzas: &[String]) -> String {
        let mut cmdline = vec![
            "console=ttyS0".to_string(),
            "loglevel=4".to_string(),
            "reboot=k".to_string(),
            "panic=1".to_string(),
            "pci=off".to_string(),
            "nokaslr".to_string(),
            "i8042.noaux".to_string(),
            "rootfstype=virtiofs".to_string(),
            "root=cradle-root".to_string(),
            "rw".to_string(),
        ];
        cmdline.extend(virtio_stanzas.iter().cloned());

        // Inject host wall-clock so the guest can seed its system time;
        // otherwise TLS inside the guest fails at epoch 1970.
        let epoch_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        cmdline.push(format!("cradle.clock={}", epoch_secs));

        cmdline.extend(self.extra_cmdline.iter().cloned());
        cmdline.join(" ")
    }

    /// Validate before any VT resources are touched.
    pub fn validate(&self) -> Result<()> {
        if !self.kernel.exists() {
            return Err(Error::InvalidConfig(format!(
                "kernel not found: {}",
                self.kernel.display()
            )));
        }
        if let Some(ref initramfs) = self.initramfs {
            if !initramfs.exists() {
                return Err(Error::InvalidConfig(format!(
                    "initramfs not found: {}",
                    initramfs.display()
                )));
            }
        }
        if let Some(ref disk) = self.disk {
            if !disk.exists() {
                return Err(Error::InvalidConfig(format!(
                    "disk image not found: {}",
                    disk.display()
                )));
            }
        }
        if self.memory_mib < 16 {
            return Err(Error::InvalidConfig("memory must be at least 16 MiB".into()));
        }
        if self.memory_mib > 64 * 1024 {
            return Err(Error::InvalidConfig("memory must be at most 64 GiB".into()));
        }
        if self.vcpus == 0 {
            return Err(Error::InvalidConfig("at least one vCPU required".into()));
        }
        if self.vcpus > 64 {
            return Err(Error::InvalidConfig("at most 64 vCPUs supported".into()));
        }
        if let Some(cid) = self.cid {
            if cid < 3 {
                return Err(Error::InvalidConfig(
                    "vsock CID must be >= 3 (0-2 are reserved)".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = InstanceConfig::default();
        assert_eq!(config.memory_mib, 128);
        assert_eq!(config.vcpus, 1);
        assert!(config.seccomp);
    }

    #[test]
    fn builder_pattern() {
        let config = InstanceConfig::new()
            .memory_mib(256)
            .vcpus(2)
            .kernel("/boot/vmlinux")
            .network(true);
        assert_eq!(config.memory_mib, 256);
        assert_eq!(config.vcpus, 2);
        assert!(config.network);
        assert_eq!(config.ram_size(), 256 << 20);
    }

    #[test]
    fn cmdline_includes_stanzas_and_clock() {
        let config = InstanceConfig::new().extra_cmdline("quiet");
        let cmdline =
            config.kernel_cmdline(&["virtio_mmio.device=512@0xd0000000:16".to_string()]);
        assert!(cmdline.contains("console=ttyS0"));
        assert!(cmdline.contains("virtio_mmio.device=512@0xd0000000:16"));
        assert!(cmdline.contains("cradle.clock="));
        assert!(cmdline.ends_with("quiet"));
    }

    #[test]
    fn validation_rejects_tiny_memory() {
        let config = InstanceConfig::new().memory_mib(8).kernel("/nonexistent");
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_vcpus() {
        let config = InstanceConfig::new().vcpus(0).kernel("/nonexistent");
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_reserved_cid() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let config = InstanceConfig::new().kernel(tmp.path()).cid(2);
        assert!(config.validate().is_err());
    }
}
