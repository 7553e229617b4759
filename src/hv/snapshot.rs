//! Whole-VM snapshot state
//!
//! A snapshot captures vCPU register files, the contents of every mapped
//! memory region, per-device state blobs keyed by registered name, and (via
//! the virtio transport blobs) virtqueue progress. Restore is two-phase:
//! `verify` checks the config hash and layout without touching the VM, then
//! `commit` applies everything, so a failed restore leaves the VM in its
//! pre-restore state.

use serde::{Deserialize, Serialize};

use crate::hv::memory::MemorySlot;
use crate::{Error, Result};

/// Raw byte image of one vCPU's register state. The fields hold the
/// kernel's kvm_* structures as plain bytes; they are only ever reloaded on
/// a host with the identical config hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VcpuSnapshot {
    pub regs: Vec<u8>,
    pub sregs: Vec<u8>,
    pub fpu: Vec<u8>,
    pub lapic: Vec<u8>,
    pub mp_state: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRegionSnapshot {
    pub gpa: u64,
    pub size: u64,
    pub data: Vec<u8>,
}

/// Full VM state, serializable with postcard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSnapshot {
    /// Hash of the VM configuration this snapshot was taken from.
    pub config_hash: [u8; 32],
    pub vcpus: Vec<VcpuSnapshot>,
    pub memory: Vec<MemoryRegionSnapshot>,
    /// Device blobs keyed by registered chipset name.
    pub devices: Vec<(String, Vec<u8>)>,
}

impl VmSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Phase one of restore: refuse mismatched configurations without
    /// touching any state.
    pub fn verify(
        &self,
        config_hash: &[u8; 32],
        vcpu_count: usize,
        slots: &[MemorySlot],
        device_names: &[String],
    ) -> Result<()> {
        if &self.config_hash != config_hash {
            return Err(Error::SnapshotMismatch);
        }
        if self.vcpus.len() != vcpu_count {
            return Err(Error::SnapshotMismatch);
        }
        if self.memory.len() != slots.len()
            || !self.memory.iter().all(|r| {
                slots.contains(&MemorySlot {
                    gpa: r.gpa,
                    size: r.size,
                })
            })
        {
            return Err(Error::SnapshotMismatch);
        }
        let mut snapshot_names: Vec<&String> = self.devices.iter().map(|(n, _)| n).collect();
        let mut current_names: Vec<&String> = device_names.iter().collect();
        snapshot_names.sort();
        current_names.sort();
        if snapshot_names != current_names {
            return Err(Error::SnapshotMismatch);
        }
        Ok(())
    }
}

/// POD ↔ bytes helpers for kvm register structures.
pub(crate) fn pod_to_bytes<T: Copy>(value: &T) -> Vec<u8> {
    // SAFETY: T is a plain-old-data kernel ABI struct.
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
            .to_vec()
    }
}

pub(crate) fn pod_from_bytes<T: Copy + Default>(bytes: &[u8]) -> Result<T> {
    if bytes.len() != std::mem::size_of::<T>() {
        return Err(Error::SnapshotMismatch);
    }
    let mut value = T::default();
    // SAFETY: size checked above; T is plain-old-data.
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            &mut value as *mut T as *mut u8,
            bytes.len(),
        );
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> VmSnapshot {
        VmSnapshot {
            config_hash: [0xAB; 32],
            vcpus: vec![VcpuSnapshot::default()],
            memory: vec![MemoryRegionSnapshot {
                gpa: 0,
                size: 4,
                data: vec![1, 2, 3, 4],
            }],
            devices: vec![("serial".into(), vec![9])],
        }
    }

    #[test]
    fn bytes_round_trip() {
        let snap = snapshot();
        let decoded = VmSnapshot::from_bytes(&snap.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.config_hash, snap.config_hash);
        assert_eq!(decoded.memory[0].data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn verify_accepts_matching_layout() {
        let snap = snapshot();
        assert!(snap
            .verify(
                &[0xAB; 32],
                1,
                &[MemorySlot { gpa: 0, size: 4 }],
                &["serial".to_string()],
            )
            .is_ok());
    }

    #[test]
    fn verify_rejects_wrong_hash() {
        let snap = snapshot();
        let err = snap
            .verify(
                &[0xCD; 32],
                1,
                &[MemorySlot { gpa: 0, size: 4 }],
                &["serial".to_string()],
            )
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotMismatch));
    }

    #[test]
    fn verify_rejects_different_device_list() {
        let snap = snapshot();
        assert!(snap
            .verify(
                &[0xAB; 32],
                1,
                &[MemorySlot { gpa: 0, size: 4 }],
                &["serial".to_string(), "rtc".to_string()],
            )
            .is_err());
    }

    #[test]
    fn verify_rejects_memory_layout_change() {
        let snap = snapshot();
        assert!(snap
            .verify(
                &[0xAB; 32],
                1,
                &[MemorySlot { gpa: 0, size: 8 }],
                &["serial".to_string()],
            )
            .is_err());
    }

    #[test]
    fn pod_round_trip() {
        #[repr(C)]
        #[derive(Clone, Copy, Default, PartialEq, Debug)]
        struct Regs {
            a: u64,
            b: u32,
        }
        let regs = Regs { a: 7, b: 9 };
        let bytes = pod_to_bytes(&regs);
        let back: Regs = pod_from_bytes(&bytes).unwrap();
        assert_eq!(back, regs);

        assert!(pod_from_bytes::<Regs>(&bytes[1..]).is_err());
    }
}
