//! KVM virtual machine backend
//!
//! One VM: guest RAM slots registered with KVM, a split irqchip (in-kernel
//! LAPIC, userspace PIC/IOAPIC), vCPUs pinned to named host threads, and an
//! exit dispatcher that routes port I/O and MMIO into the chipset. EOI
//! broadcasts from the in-kernel LAPIC arrive as IOAPIC-EOI exits and are
//! forwarded to the interrupt fabric.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::time::Instant;

use kvm_bindings::{
    kvm_enable_cap, kvm_msi, kvm_regs, kvm_userspace_memory_region, CpuId,
    KVM_CAP_SPLIT_IRQCHIP, KVM_MAX_CPUID_ENTRIES,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use tracing::{debug, error, info, trace, warn};

use crate::arch::x86_64 as arch_x86;
use crate::arch::Architecture;
use crate::chipset::{Chipset, VectorInjector};
use crate::error::DeviceError;
use crate::hv::memory::GuestRam;
use crate::hv::snapshot::{pod_from_bytes, pod_to_bytes, VcpuSnapshot, VmSnapshot};
use crate::hv::{config_hash, CancelToken, RunConfig, RunOutcome, VmConfig};
use crate::{Error, Result};

/// Empty SIGUSR1 handler so pthread_kill forces EINTR out of KVM_RUN.
extern "C" fn kick_handler(_sig: libc::c_int) {}

fn install_kick_handler() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = kick_handler as usize;
        libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut());
    });
}

/// Delivers interrupt vectors through `KVM_SIGNAL_MSI` into the in-kernel
/// LAPIC (the "LAPIC helper" seam the interrupt controllers inject through).
pub struct KvmInjector {
    vm_fd: Arc<VmFd>,
}

impl VectorInjector for KvmInjector {
    fn signal(&self, address: u64, data: u32) -> Result<()> {
        let msi = kvm_msi {
            address_lo: address as u32,
            address_hi: (address >> 32) as u32,
            data,
            ..Default::default()
        };
        self.vm_fd.signal_msi(msi).map_err(Error::Kvm)?;
        Ok(())
    }
}

/// A KVM-backed virtual machine.
pub struct KvmVm {
    vm_fd: Arc<VmFd>,
    ram: Arc<GuestRam>,
    config: VmConfig,
    chipset: OnceLock<Arc<Chipset>>,
    hash: OnceLock<[u8; 32]>,
    vcpus: Vec<Arc<Mutex<VcpuFd>>>,
    /// pthread ids of running vCPU threads, for cancellation kicks.
    vcpu_threads: Arc<Mutex<Vec<libc::pthread_t>>>,
    /// Raised by the i8042 (pulse reset) to request a guest reboot.
    reset_flag: Arc<AtomicBool>,
    supported_cpuid: CpuId,
    next_slot: AtomicU32,
}

impl KvmVm {
    pub fn new(kvm: &Kvm, config: VmConfig) -> Result<Self> {
        if config.arch != Architecture::X86_64 {
            return Err(Error::HypervisorUnavailable(format!(
                "KVM backend currently drives x86_64 guests only, not {}",
                config.arch
            )));
        }
        install_kick_handler();

        let vm_fd = kvm.create_vm().map_err(Error::Kvm)?;
        vm_fd.set_tss_address(0xFFFB_D000).map_err(Error::Kvm)?;

        // Split irqchip: LAPIC in kernel, PIC/IOAPIC emulated here.
        let mut cap = kvm_enable_cap {
            cap: KVM_CAP_SPLIT_IRQCHIP,
            ..Default::default()
        };
        cap.args[0] = crate::devices::ioapic::NUM_PINS as u64;
        vm_fd.enable_cap(&cap).map_err(|e| {
            Error::HypervisorUnavailable(format!("KVM split irqchip unavailable: {}", e))
        })?;
        debug!("created KVM VM with split irqchip");

        let ram = Arc::new(GuestRam::new(config.ram_base, config.ram_size)?);
        let vm = Self {
            vm_fd: Arc::new(vm_fd),
            ram,
            supported_cpuid: kvm
                .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
                .map_err(Error::Kvm)?,
            config,
            chipset: OnceLock::new(),
            hash: OnceLock::new(),
            vcpus: Vec::new(),
            vcpu_threads: Arc::new(Mutex::new(Vec::new())),
            reset_flag: Arc::new(AtomicBool::new(false)),
            next_slot: AtomicU32::new(0),
        };
        vm.register_ram_with_kvm()?;

        Ok(vm)
    }

    fn register_ram_with_kvm(&self) -> Result<()> {
        for (gpa, host, size) in self.ram.kvm_regions() {
            let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
            let region = kvm_userspace_memory_region {
                slot,
                guest_phys_addr: gpa,
                memory_size: size,
                userspace_addr: host,
                flags: 0,
            };
            // SAFETY: the backing mmap stays alive for the VM's lifetime and
            // regions never move once established.
            unsafe {
                self.vm_fd
                    .set_user_memory_region(region)
                    .map_err(Error::Kvm)?;
            }
            debug!(slot, gpa = format_args!("{:#x}", gpa), size, "registered memory slot");
        }
        Ok(())
    }

    /// Map an additional memory slot into the running layout.
    pub fn allocate_memory(&self, gpa: u64, size: u64) -> Result<()> {
        let slot_info = self.ram.allocate(gpa, size)?;
        let host = self.ram.host_address(slot_info.gpa)?;
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: gpa,
            memory_size: size,
            userspace_addr: host,
            flags: 0,
        };
        // SAFETY: as above.
        unsafe {
            self.vm_fd
                .set_user_memory_region(region)
                .map_err(Error::Kvm)?;
        }
        Ok(())
    }

    pub fn ram(&self) -> &Arc<GuestRam> {
        &self.ram
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The MSI injector the interrupt controllers deliver through.
    pub fn injector(&self) -> Arc<dyn VectorInjector> {
        Arc::new(KvmInjector {
            vm_fd: self.vm_fd.clone(),
        })
    }

    /// The flag the i8042 raises on a pulse-reset command.
    pub fn reset_flag(&self) -> Arc<AtomicBool> {
        self.reset_flag.clone()
    }

    /// Attach the built chipset. Must happen before `run`; fixes the config
    /// hash.
    pub fn attach_chipset(&self, chipset: Arc<Chipset>) -> Result<()> {
        let hash = config_hash(&self.config, &chipset.device_signatures());
        self.chipset
            .set(chipset)
            .map_err(|_| Error::InvalidConfig("chipset already attached".into()))?;
        let _ = self.hash.set(hash);
        Ok(())
    }

    fn chipset_ref(&self) -> Result<&Arc<Chipset>> {
        self.chipset
            .get()
            .ok_or_else(|| Error::InvalidConfig("no chipset attached".into()))
    }

    pub fn vm_config_hash(&self) -> Result<[u8; 32]> {
        self.hash
            .get()
            .copied()
            .ok_or_else(|| Error::InvalidConfig("no chipset attached".into()))
    }

    /// Create the vCPUs. Called once, before `run`.
    pub fn create_vcpus(&mut self) -> Result<()> {
        if !self.vcpus.is_empty() {
            return Err(Error::InvalidConfig("vCPUs already created".into()));
        }
        for id in 0..self.config.vcpu_count {
            let vcpu = self.vm_fd.create_vcpu(id as u64).map_err(Error::Kvm)?;
            vcpu.set_cpuid2(&self.supported_cpuid).map_err(Error::Kvm)?;
            self.vcpus.push(Arc::new(Mutex::new(vcpu)));
        }
        debug!(count = self.config.vcpu_count, "created vCPUs");
        Ok(())
    }

    /// Run a closure against one vCPU's fd (register setup, debugging).
    /// Must not be called while `run` is active.
    pub fn vcpu_call<R>(&self, index: usize, f: impl FnOnce(&mut VcpuFd) -> R) -> Result<R> {
        let vcpu = self
            .vcpus
            .get(index)
            .ok_or_else(|| Error::InvalidConfig(format!("no vCPU {}", index)))?;
        let mut guard = vcpu.lock().unwrap();
        Ok(f(&mut guard))
    }

    /// Program boot state: long mode, identity page tables, entry registers.
    pub fn setup_boot(&self, entry_point: u64) -> Result<()> {
        let mem = self.ram.view();
        let cr3 = arch_x86::write_identity_page_tables(
            &mem,
            arch_x86::identity_map_limit(self.config.ram_size),
        )?;

        for vcpu in &self.vcpus {
            let vcpu = vcpu.lock().unwrap();
            let mut sregs = vcpu.get_sregs().map_err(Error::Kvm)?;

            sregs.cs.base = 0;
            sregs.cs.limit = 0xFFFF_FFFF;
            sregs.cs.selector = arch_x86::segment::CODE_SELECTOR;
            sregs.cs.type_ = arch_x86::segment::CODE_TYPE;
            sregs.cs.present = 1;
            sregs.cs.dpl = 0;
            sregs.cs.db = 0;
            sregs.cs.s = 1;
            sregs.cs.l = 1;
            sregs.cs.g = 1;

            sregs.ds.base = 0;
            sregs.ds.limit = 0xFFFF_FFFF;
            sregs.ds.selector = arch_x86::segment::DATA_SELECTOR;
            sregs.ds.type_ = arch_x86::segment::DATA_TYPE;
            sregs.ds.present = 1;
            sregs.ds.dpl = 0;
            sregs.ds.db = 1;
            sregs.ds.s = 1;
            sregs.ds.l = 0;
            sregs.ds.g = 1;
            sregs.es = sregs.ds;
            sregs.fs = sregs.ds;
            sregs.gs = sregs.ds;
            sregs.ss = sregs.ds;

            sregs.cr0 = arch_x86::cr::CR0_PE | arch_x86::cr::CR0_PG;
            sregs.cr4 = arch_x86::cr::CR4_PAE;
            sregs.efer = arch_x86::cr::EFER_LME | arch_x86::cr::EFER_LMA;
            sregs.cr3 = cr3;
            vcpu.set_sregs(&sregs).map_err(Error::Kvm)?;

            let boot = arch_x86::boot_regs(entry_point);
            let mut regs = kvm_regs::default();
            regs.rip = boot.rip;
            regs.rsi = boot.rsi;
            regs.rsp = boot.rsp;
            regs.rflags = boot.rflags;
            vcpu.set_regs(&regs).map_err(Error::Kvm)?;
        }
        debug!(entry = format_args!("{:#x}", entry_point), "boot state programmed");
        Ok(())
    }

    /// Drive a named interrupt line from outside the chipset.
    pub fn set_irq(&self, pin: u32, high: bool) -> Result<()> {
        let chipset = self.chipset_ref()?;
        if !chipset.lines().set_level(pin, high) {
            return Err(Error::InvalidConfig(format!("no line on pin {}", pin)));
        }
        Ok(())
    }

    /// Inject a fixed-mode vector directly (x86).
    pub fn inject_interrupt(&self, vector: u8) -> Result<()> {
        self.injector().signal(0xFEE0_0000, vector as u32)
    }

    /// Run the VM until the guest halts, reboots, a device yields, the
    /// context is cancelled, or an internal error occurs. Blocks.
    pub fn run(&self, token: CancelToken, run_config: RunConfig) -> Result<RunOutcome> {
        let chipset = self.chipset_ref()?.clone();
        self.reset_flag.store(false, Ordering::SeqCst);

        let stop = Arc::new(AtomicBool::new(false));
        let (outcome_tx, outcome_rx) = mpsc::channel::<Result<RunOutcome>>();

        // Poll thread: time-driven device work between vCPU quanta.
        let poll_handle = {
            let chipset = chipset.clone();
            let mem = self.ram.view();
            let stop = stop.clone();
            let interval = run_config.poll_interval;
            std::thread::Builder::new()
                .name("poll".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        chipset.poll(Instant::now(), &mem);
                        std::thread::sleep(interval);
                    }
                })
                .map_err(|e| Error::Device(format!("spawn poll thread: {}", e)))?
        };

        // Watchdog: a vCPU that fails to observe cancellation within
        // 4x the run timeout wedges the whole process; terminate it.
        let watchdog_handle = {
            let token = token.clone();
            let stop = stop.clone();
            let limit = run_config.run_timeout * run_config.watchdog_multiplier;
            std::thread::Builder::new()
                .name("watchdog".into())
                .spawn(move || loop {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    if token.is_cancelled() {
                        let deadline = Instant::now() + limit;
                        while Instant::now() < deadline {
                            if stop.load(Ordering::Acquire) {
                                return;
                            }
                            std::thread::sleep(std::time::Duration::from_millis(10));
                        }
                        error!("vCPU failed to observe cancellation; aborting process");
                        std::process::abort();
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                })
                .map_err(|e| Error::Device(format!("spawn watchdog: {}", e)))?
        };

        // One thread per vCPU, pinned for the run's duration.
        let mut handles = Vec::new();
        for (index, vcpu) in self.vcpus.iter().enumerate() {
            let vcpu = vcpu.clone();
            let chipset = chipset.clone();
            let mem = self.ram.view();
            let token = token.clone();
            let stop = stop.clone();
            let outcome_tx = outcome_tx.clone();
            let reset_flag = self.reset_flag.clone();
            let threads = self.vcpu_threads.clone();
            let handle = std::thread::Builder::new()
                .name(format!("vcpu-{}", index))
                .spawn(move || {
                    threads.lock().unwrap().push(unsafe { libc::pthread_self() });

                    let mut vcpu = vcpu.lock().unwrap();
                    let result =
                        vcpu_loop(&mut vcpu, index, &chipset, &mem, &token, &stop, &reset_flag);
                    let _ = outcome_tx.send(result);
                })
                .map_err(|e| Error::Device(format!("spawn vcpu thread: {}", e)))?;
            handles.push(handle);
        }
        drop(outcome_tx);

        // First terminal outcome wins.
        let outcome = outcome_rx
            .recv()
            .unwrap_or(Err(Error::Device("all vCPU threads exited silently".into())));

        // Wind everything down.
        stop.store(true, Ordering::Release);
        for tid in self.vcpu_threads.lock().unwrap().drain(..) {
            unsafe {
                libc::pthread_kill(tid, libc::SIGUSR1);
            }
        }
        for handle in handles {
            let _ = handle.join();
        }
        let _ = poll_handle.join();
        let _ = watchdog_handle.join();

        // Run the chipset one final time so used-ring work queued by the
        // last exits is visible.
        chipset.poll(Instant::now(), &self.ram.view());

        match &outcome {
            Ok(o) => info!(outcome = ?o, "vm run finished"),
            Err(e) => warn!("vm run failed: {}", e),
        }
        outcome
    }

    /// Capture full VM state. Only valid while the VM is not running.
    pub fn capture_snapshot(&self) -> Result<VmSnapshot> {
        let chipset = self.chipset_ref()?;
        let mut vcpus = Vec::with_capacity(self.vcpus.len());
        for vcpu in &self.vcpus {
            let vcpu = vcpu.lock().unwrap();
            vcpus.push(VcpuSnapshot {
                regs: pod_to_bytes(&vcpu.get_regs().map_err(Error::Kvm)?),
                sregs: pod_to_bytes(&vcpu.get_sregs().map_err(Error::Kvm)?),
                fpu: pod_to_bytes(&vcpu.get_fpu().map_err(Error::Kvm)?),
                lapic: pod_to_bytes(&vcpu.get_lapic().map_err(Error::Kvm)?),
                mp_state: vcpu.get_mp_state().map_err(Error::Kvm)?.mp_state,
            });
        }

        let memory = self
            .ram
            .capture()?
            .into_iter()
            .map(|(slot, data)| crate::hv::snapshot::MemoryRegionSnapshot {
                gpa: slot.gpa,
                size: slot.size,
                data,
            })
            .collect();

        Ok(VmSnapshot {
            config_hash: self.vm_config_hash()?,
            vcpus,
            memory,
            devices: chipset.save_device_states()?,
        })
    }

    /// Two-phase restore: verify against the current configuration, then
    /// commit memory, device blobs, and vCPU state.
    pub fn restore_snapshot(&self, snapshot: &VmSnapshot) -> Result<()> {
        let chipset = self.chipset_ref()?;
        let device_names: Vec<String> = chipset
            .device_signatures()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        snapshot.verify(
            &self.vm_config_hash()?,
            self.vcpus.len(),
            &self.ram.slots(),
            &device_names,
        )?;

        // Commit.
        let regions: Vec<_> = snapshot
            .memory
            .iter()
            .map(|r| {
                (
                    crate::hv::memory::MemorySlot {
                        gpa: r.gpa,
                        size: r.size,
                    },
                    r.data.clone(),
                )
            })
            .collect();
        self.ram.restore(&regions)?;
        chipset.restore_device_states(&snapshot.devices)?;

        for (vcpu, state) in self.vcpus.iter().zip(&snapshot.vcpus) {
            let vcpu = vcpu.lock().unwrap();
            vcpu.set_regs(&pod_from_bytes(&state.regs)?).map_err(Error::Kvm)?;
            vcpu.set_sregs(&pod_from_bytes(&state.sregs)?)
                .map_err(Error::Kvm)?;
            vcpu.set_fpu(&pod_from_bytes(&state.fpu)?).map_err(Error::Kvm)?;
            vcpu.set_lapic(&pod_from_bytes(&state.lapic)?)
                .map_err(Error::Kvm)?;
            vcpu.set_mp_state(kvm_bindings::kvm_mp_state {
                mp_state: state.mp_state,
            })
            .map_err(Error::Kvm)?;
        }
        info!("snapshot restored");
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn vcpu_loop(
    vcpu: &mut VcpuFd,
    index: usize,
    chipset: &Chipset,
    mem: &vm_memory::GuestMemoryMmap,
    token: &CancelToken,
    stop: &AtomicBool,
    reset_flag: &AtomicBool,
) -> Result<RunOutcome> {
    debug!(vcpu = index, "entering run loop");
    loop {
        if token.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        if stop.load(Ordering::Acquire) {
            return Ok(RunOutcome::Cancelled);
        }
        if reset_flag.load(Ordering::SeqCst) {
            return Ok(RunOutcome::GuestReboot);
        }

        let entered = Instant::now();
        match vcpu.run() {
            Ok(exit) => {
                crate::trace::record_timeslice(
                    index,
                    entered.elapsed().as_micros(),
                    exit_name(&exit),
                );
                match exit {
                    VcpuExit::IoIn(port, data) => {
                        match chipset.handle_pio(port, data, false) {
                            Ok(()) => {}
                            Err(DeviceError::Yield) => return Ok(RunOutcome::DeviceYield),
                            Err(DeviceError::Failed(e)) => return Err(e),
                        }
                    }
                    VcpuExit::IoOut(port, data) => {
                        // The dispatcher mutates only for reads; clone to a
                        // local so both paths share one signature.
                        let mut buf = data.to_vec();
                        match chipset.handle_pio(port, &mut buf, true) {
                            Ok(()) => {}
                            Err(DeviceError::Yield) => return Ok(RunOutcome::DeviceYield),
                            Err(DeviceError::Failed(e)) => return Err(e),
                        }
                    }
                    VcpuExit::MmioRead(addr, data) => {
                        match chipset.handle_mmio(addr, data, false, mem) {
                            Ok(()) => {}
                            Err(DeviceError::Yield) => return Ok(RunOutcome::DeviceYield),
                            Err(DeviceError::Failed(e)) => return Err(e),
                        }
                    }
                    VcpuExit::MmioWrite(addr, data) => {
                        let mut buf = data.to_vec();
                        match chipset.handle_mmio(addr, &mut buf, true, mem) {
                            Ok(()) => {}
                            Err(DeviceError::Yield) => return Ok(RunOutcome::DeviceYield),
                            Err(DeviceError::Failed(e)) => return Err(e),
                        }
                    }
                    VcpuExit::IoapicEoi(vector) => {
                        chipset.lines().broadcast_eoi(vector);
                    }
                    VcpuExit::Hlt => {
                        debug!(vcpu = index, "guest halted");
                        return Ok(RunOutcome::GuestHalt);
                    }
                    VcpuExit::Shutdown => {
                        return Err(Error::GuestFault {
                            exit_reason: "shutdown".into(),
                            context: "triple fault or shutdown condition".into(),
                        });
                    }
                    VcpuExit::SystemEvent(event_type, _) => {
                        // PSCI SYSTEM_OFF / SYSTEM_RESET on arm64.
                        return match event_type {
                            1 => Ok(RunOutcome::GuestHalt),
                            2 => Ok(RunOutcome::GuestReboot),
                            other => Err(Error::GuestFault {
                                exit_reason: format!("system event {}", other),
                                context: String::new(),
                            }),
                        };
                    }
                    VcpuExit::FailEntry(reason, cpu) => {
                        return Err(Error::GuestFault {
                            exit_reason: format!("fail entry {:#x}", reason),
                            context: format!("cpu {}", cpu),
                        });
                    }
                    VcpuExit::InternalError => {
                        return Err(Error::GuestFault {
                            exit_reason: "internal error".into(),
                            context: String::new(),
                        });
                    }
                    other => {
                        trace!(vcpu = index, exit = ?other, "unhandled exit ignored");
                    }
                }
            }
            Err(e) => {
                if e.errno() == libc::EINTR {
                    // Kicked for cancellation; loop re-checks the token.
                    continue;
                }
                return Err(Error::Kvm(e));
            }
        }
    }
}

fn exit_name(exit: &VcpuExit) -> &'static str {
    match exit {
        VcpuExit::IoIn(..) | VcpuExit::IoOut(..) => "pio",
        VcpuExit::MmioRead(..) | VcpuExit::MmioWrite(..) => "mmio",
        VcpuExit::Hlt => "hlt",
        VcpuExit::IoapicEoi(..) => "eoi",
        VcpuExit::Shutdown => "shutdown",
        _ => "other",
    }
}
