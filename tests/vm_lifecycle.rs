//! VM lifecycle: config-hash gating, snapshot verification, and (under
//! KVM) real boot/run/restore flows.

#![cfg(target_os = "linux")]

use cradle::arch::Architecture;
use cradle::hv::{config_hash, CancelToken, VmConfig, VmSnapshot};
use cradle::Error;

fn sigs(names: &[&str]) -> Vec<(String, String)> {
    names
        .iter()
        .map(|n| (n.to_string(), format!("{}-kind", n)))
        .collect()
}

#[test]
fn snapshot_restore_gated_by_config_hash() {
    let config = VmConfig::new(Architecture::X86_64, 128 << 20, 1);
    let devices = sigs(&["pic", "serial", "virtio0-vsock"]);
    let hash = config_hash(&config, &devices);

    let snapshot = VmSnapshot {
        config_hash: hash,
        vcpus: vec![Default::default()],
        memory: vec![],
        devices: vec![
            ("pic".into(), vec![]),
            ("serial".into(), vec![]),
            ("virtio0-vsock".into(), vec![]),
        ],
    };

    let names: Vec<String> = devices.iter().map(|(n, _)| n.clone()).collect();

    // Identical configuration: verify passes.
    assert!(snapshot.verify(&hash, 1, &[], &names).is_ok());

    // More RAM: different hash, SnapshotMismatch.
    let bigger = VmConfig::new(Architecture::X86_64, 256 << 20, 1);
    let bigger_hash = config_hash(&bigger, &devices);
    assert!(matches!(
        snapshot.verify(&bigger_hash, 1, &[], &names),
        Err(Error::SnapshotMismatch)
    ));

    // Extra device: different signature list, SnapshotMismatch.
    let extra = sigs(&["pic", "serial", "virtio0-vsock", "virtio2-net"]);
    let extra_hash = config_hash(&config, &extra);
    let extra_names: Vec<String> = extra.iter().map(|(n, _)| n.clone()).collect();
    assert!(matches!(
        snapshot.verify(&extra_hash, 1, &[], &extra_names),
        Err(Error::SnapshotMismatch)
    ));
}

#[test]
fn mismatch_iff_hash_differs() {
    // Property: verify fails with SnapshotMismatch if and only if the
    // current hash differs from the recorded one (holding layout equal).
    let config = VmConfig::new(Architecture::X86_64, 64 << 20, 2);
    let devices = sigs(&["serial"]);
    let names: Vec<String> = devices.iter().map(|(n, _)| n.clone()).collect();
    let hash = config_hash(&config, &devices);
    let snapshot = VmSnapshot {
        config_hash: hash,
        vcpus: vec![Default::default(), Default::default()],
        memory: vec![],
        devices: vec![("serial".into(), vec![])],
    };

    assert!(snapshot.verify(&hash, 2, &[], &names).is_ok());
    let mut other = hash;
    other[0] ^= 1;
    assert!(matches!(
        snapshot.verify(&other, 2, &[], &names),
        Err(Error::SnapshotMismatch)
    ));
}

#[test]
fn cancel_token_is_sticky_and_shared() {
    let token = CancelToken::new();
    let clone = token.clone();
    clone.cancel();
    assert!(token.is_cancelled());
    assert!(clone.is_cancelled());
}

mod kvm {
    //! Everything below needs /dev/kvm.

    use super::*;
    use cradle::chipset::ChipsetBuilder;
    use cradle::hv::{KvmHypervisor, RunConfig, RunOutcome};
    use std::sync::Arc;

    fn open_or_skip() -> Option<KvmHypervisor> {
        match KvmHypervisor::open() {
            Ok(hv) => Some(hv),
            Err(Error::HypervisorUnavailable(reason)) => {
                eprintln!("skipping: {}", reason);
                None
            }
            Err(other) => panic!("wrong error kind: {}", other),
        }
    }

    #[test]
    #[ignore] // Requires KVM
    fn triple_fault_is_guest_fault_not_host_crash() {
        let Some(hv) = open_or_skip() else { return };
        let mut vm = hv
            .new_vm(VmConfig::new(Architecture::X86_64, 32 << 20, 1))
            .unwrap();
        vm.create_vcpus().unwrap();
        vm.attach_chipset(Arc::new(ChipsetBuilder::new().build().unwrap()))
            .unwrap();

        // Tiny guest: ud2 with no IDT -> triple fault.
        vm.ram().write_at(0x1000, &[0x0F, 0x0B]).unwrap();
        vm.setup_boot(0x1000).unwrap();

        let err = vm
            .run(CancelToken::new(), RunConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::GuestFault { .. }));
    }

    #[test]
    #[ignore] // Requires KVM
    fn cancellation_returns_promptly() {
        let Some(hv) = open_or_skip() else { return };
        let mut vm = hv
            .new_vm(VmConfig::new(Architecture::X86_64, 32 << 20, 1))
            .unwrap();
        vm.create_vcpus().unwrap();
        vm.attach_chipset(Arc::new(ChipsetBuilder::new().build().unwrap()))
            .unwrap();

        // Spin forever: jmp $.
        vm.ram().write_at(0x1000, &[0xEB, 0xFE]).unwrap();
        vm.setup_boot(0x1000).unwrap();

        let token = CancelToken::new();
        let canceller = {
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(200));
                token.cancel();
            })
        };
        let started = std::time::Instant::now();
        let outcome = vm.run(token, RunConfig::default()).unwrap();
        canceller.join().unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    #[ignore] // Requires KVM
    fn snapshot_round_trip_restores_memory_and_registers() {
        let Some(hv) = open_or_skip() else { return };
        let config = VmConfig::new(Architecture::X86_64, 32 << 20, 1);

        let mut vm = hv.new_vm(config.clone()).unwrap();
        vm.create_vcpus().unwrap();
        vm.attach_chipset(Arc::new(ChipsetBuilder::new().build().unwrap()))
            .unwrap();
        vm.setup_boot(0x2000).unwrap();
        vm.ram().write_at(0x9_0000, b"state to carry").unwrap();
        let snapshot = vm.capture_snapshot().unwrap();
        let bytes = snapshot.to_bytes().unwrap();

        let mut restored = hv.new_vm(config).unwrap();
        restored.create_vcpus().unwrap();
        restored
            .attach_chipset(Arc::new(ChipsetBuilder::new().build().unwrap()))
            .unwrap();
        restored
            .restore_snapshot(&VmSnapshot::from_bytes(&bytes).unwrap())
            .unwrap();

        let mut buf = [0u8; 14];
        restored.ram().read_at(0x9_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"state to carry");
        let rip = restored.vcpu_call(0, |v| v.get_regs().unwrap().rip).unwrap();
        assert_eq!(rip, 0x2000);
    }

    #[test]
    #[ignore] // Requires KVM
    fn restore_against_different_ram_size_is_mismatch() {
        let Some(hv) = open_or_skip() else { return };
        let mut vm = hv
            .new_vm(VmConfig::new(Architecture::X86_64, 32 << 20, 1))
            .unwrap();
        vm.create_vcpus().unwrap();
        vm.attach_chipset(Arc::new(ChipsetBuilder::new().build().unwrap()))
            .unwrap();
        let snapshot = vm.capture_snapshot().unwrap();

        let mut other = hv
            .new_vm(VmConfig::new(Architecture::X86_64, 64 << 20, 1))
            .unwrap();
        other.create_vcpus().unwrap();
        other
            .attach_chipset(Arc::new(ChipsetBuilder::new().build().unwrap()))
            .unwrap();
        assert!(matches!(
            other.restore_snapshot(&snapshot),
            Err(Error::SnapshotMismatch)
        ));
    }
}
