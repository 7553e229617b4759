//! Instance: a booted micro-VM driven like a local process
//!
//! Assembles the pieces: a KVM VM, the legacy chipset, the virtio device
//! set (vsock control plane, virtio-fs root, optional net/block/gpu/input),
//! the Linux loader, and the RPC session to the guest init program.
//! `Instance::new` returns once the guest reports boot-complete, so the
//! caller can immediately exec, read files, or capture a warm-boot
//! snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::arch::x86_64 as arch_x86;
use crate::chipset::{Chipset, ChipsetBuilder};
use crate::config::InstanceConfig;
use crate::devices::{
    FwCfgDevice, HpetDevice, I8042Device, IoapicDevice, PicDevice, PitDevice, RtcDevice,
    SerialDevice, SpeakerPort,
};
use crate::hv::{self, CancelToken, KvmVm, RunConfig, RunOutcome, VmConfig, VmSnapshot};
use crate::loader::{self, BootSetup};
use crate::rpc::exec::Command;
use crate::rpc::session::RpcSession;
use crate::source::{InstanceSource, RuntimeConfig};
use crate::virtio::block::{Block, FileBackend};
use crate::virtio::fs::{DirBackend, Fs};
use crate::virtio::gpu::{Display, Gpu};
use crate::virtio::input::Input;
use crate::virtio::mmio::VirtioMmio;
use crate::virtio::net::{Net, PacketQueue, PacketQueueHandle};
use crate::virtio::vsock::{Vsock, VsockSwitch};
use crate::{Error, Result};

/// A running micro-VM instance.
pub struct Instance {
    vm: Arc<KvmVm>,
    chipset: Arc<Chipset>,
    session: Option<Arc<RpcSession>>,
    switch: VsockSwitch,
    cancel: CancelToken,
    run_handle: Option<std::thread::JoinHandle<Result<RunOutcome>>>,
    running: Arc<AtomicBool>,
    console_rx: mpsc::Receiver<u8>,
    serial: SerialDevice,
    net: Option<PacketQueueHandle>,
    display: Option<Display>,
    cid: u32,
    runtime: RuntimeConfig,
    config: InstanceConfig,
}

impl Instance {
    /// Boot a fresh instance from `source`.
    pub async fn new_with_source(
        config: InstanceConfig,
        source: &dyn InstanceSource,
    ) -> Result<Self> {
        let mut instance = Self::assemble(config, source)?;
        instance.start_run_thread();
        instance.connect_session().await?;
        Ok(instance)
    }

    /// Boot using the kernel/initramfs from the config and an empty-ish
    /// root (the initramfs carries the init program). Convenience for
    /// kernels bundled with their own userspace.
    pub async fn new(config: InstanceConfig) -> Result<Self> {
        let root = config.snapshot_cache.join("empty-root");
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::io("mkdir", root.display().to_string(), e))?;
        let source = crate::source::DirSource::new(root);
        Self::new_with_source(config, &source).await
    }

    /// Restore a previously captured snapshot into a freshly assembled VM
    /// of identical configuration, then resume and reconnect. Fails with
    /// [`Error::SnapshotMismatch`] when the config hash differs.
    pub async fn new_restored(
        config: InstanceConfig,
        source: &dyn InstanceSource,
        snapshot: &VmSnapshot,
    ) -> Result<Self> {
        let mut instance = Self::assemble(config, source)?;
        instance.vm.restore_snapshot(snapshot)?;
        instance.start_run_thread();
        instance.connect_session().await?;
        Ok(instance)
    }

    /// Build the VM, chipset, devices, and load the kernel. No vCPU runs
    /// yet.
    fn assemble(config: InstanceConfig, source: &dyn InstanceSource) -> Result<Self> {
        config.validate()?;
        let runtime = source.runtime_config()?;
        info!(
            source = %source.identity(),
            memory_mib = config.memory_mib,
            vcpus = config.vcpus,
            "assembling instance"
        );

        let hypervisor = hv::open_for_architecture(config.arch)?;
        let mut vm = hypervisor.new_vm(VmConfig::new(
            config.arch,
            config.ram_size(),
            config.vcpus,
        ))?;
        vm.create_vcpus()?;

        let mut builder = ChipsetBuilder::new();
        let lines = builder.lines();
        let injector = vm.injector();

        // Interrupt controllers first; they are the line routers.
        let pic = PicDevice::new(injector.clone());
        lines.attach_router(pic.router());
        builder.register_device("pic", Arc::new(Mutex::new(pic)))?;

        let ioapic = IoapicDevice::new(injector);
        lines.attach_router(ioapic.router());
        builder.register_device("ioapic", Arc::new(Mutex::new(ioapic)))?;

        // Timers and legacy peripherals.
        let pit = PitDevice::new(lines.allocate("pit", 0));
        let speaker = SpeakerPort::new(pit.handle());
        builder.register_device("pit", Arc::new(Mutex::new(pit)))?;
        builder.register_device("port61", Arc::new(Mutex::new(speaker)))?;

        let hpet = HpetDevice::new(vec![
            lines.allocate("hpet0", 20),
            lines.allocate("hpet1", 21),
            lines.allocate("hpet2", 22),
        ]);
        builder.register_device("hpet", Arc::new(Mutex::new(hpet)))?;

        let rtc = RtcDevice::new(lines.allocate("rtc", 8));
        builder.register_device("rtc", Arc::new(Mutex::new(rtc)))?;

        let (console_tx, console_rx) = mpsc::channel(4096);
        let serial = SerialDevice::new(console_tx, lines.allocate("serial", 4));
        builder.register_device("serial", Arc::new(Mutex::new(serial.clone())))?;

        let i8042 = I8042Device::with_reset_flag(
            lines.allocate("kbd", 1),
            lines.allocate("aux", 12),
            vm.reset_flag(),
        );
        builder.register_device("i8042", Arc::new(Mutex::new(i8042)))?;

        let fw_cfg = FwCfgDevice::new();
        fw_cfg.add_file(
            "etc/cradle/runtime",
            serde_json::to_vec(&runtime)?,
            false,
        );
        builder.register_device("fw-cfg", Arc::new(Mutex::new(fw_cfg)))?;

        // Virtio bus. Slot/IRQ assignment is positional; the cmdline
        // stanzas tell the guest where each device lives.
        let mut slot = 0usize;
        let mut stanzas = Vec::new();
        let mut next_slot = |builder: &mut ChipsetBuilder,
                             name: String,
                             device: Box<dyn crate::virtio::VirtioDevice>|
         -> Result<()> {
            let base = arch_x86::virtio_mmio_slot(slot);
            let pin = arch_x86::layout::VIRTIO_IRQ_BASE + slot as u32;
            let irq = lines.allocate(&name, pin);
            let mmio = VirtioMmio::new(device, base, irq);
            stanzas.push(mmio.cmdline_stanza());
            builder.register_device(&name, Arc::new(Mutex::new(mmio)))?;
            slot += 1;
            Ok(())
        };

        // vsock carries the control plane; always present.
        let cid = match config.cid {
            Some(cid) => cid,
            None => {
                let mut seed = [0u8; 4];
                getrandom::fill(&mut seed)
                    .map_err(|e| Error::Device(format!("cid entropy: {}", e)))?;
                3 + (u32::from_le_bytes(seed) % 0xFFFF_FFF0)
            }
        };
        let vsock = Vsock::new(cid as u64)?;
        let switch = vsock.switch();
        next_slot(&mut builder, "virtio0-vsock".into(), Box::new(vsock))?;

        // virtio-fs root from the instance source; always present.
        let rootfs = source.rootfs()?;
        let fs = Fs::new("cradle-root", Box::new(DirBackend::new(&rootfs)))?;
        next_slot(&mut builder, "virtio1-fs".into(), Box::new(fs))?;

        let net = if config.network {
            let queue = PacketQueue::new();
            let handle = queue.handle();
            let net = Net::new(Box::new(queue), [0x52, 0x54, 0x00, 0xC4, 0x0A, 0x01]);
            next_slot(&mut builder, "virtio2-net".into(), Box::new(net))?;
            Some(handle)
        } else {
            None
        };

        if let Some(ref disk) = config.disk {
            let backend = FileBackend::open(disk, false)?;
            let block = Block::new(Box::new(backend), "cradle-disk");
            next_slot(&mut builder, "virtio3-blk".into(), Box::new(block))?;
        }

        let display = if config.graphics {
            let display = Display::new(1280, 800);
            let gpu = Gpu::new(display.clone());
            next_slot(&mut builder, "virtio4-gpu".into(), Box::new(gpu))?;
            let input = Input::new("cradle-tablet");
            next_slot(&mut builder, "virtio5-input".into(), Box::new(input))?;
            Some(display)
        } else {
            None
        };
        drop(next_slot);

        let chipset = Arc::new(builder.build()?);
        vm.attach_chipset(chipset.clone())?;

        // Load kernel + initramfs and program boot state.
        let kernel = std::fs::read(&config.kernel)
            .map_err(|e| Error::io("read", config.kernel.display().to_string(), e))?;
        let initramfs = match &config.initramfs {
            Some(path) => Some(
                std::fs::read(path)
                    .map_err(|e| Error::io("read", path.display().to_string(), e))?,
            ),
            None => None,
        };
        let cmdline = config.kernel_cmdline(&stanzas);
        let memory = vm.ram().view();
        let device_nodes = chipset.device_tree_nodes();
        let loaded = loader::load(
            config.arch,
            &BootSetup {
                memory: &memory,
                ram_base: config.arch.ram_base(),
                ram_size: config.ram_size(),
                vcpu_count: config.vcpus,
                kernel: &kernel,
                initramfs: initramfs.as_deref(),
                cmdline: &cmdline,
                device_nodes: &device_nodes,
            },
        )?;
        vm.setup_boot(loaded.entry_point)?;
        debug!(cid, entry = format_args!("{:#x}", loaded.entry_point), "instance assembled");

        Ok(Self {
            vm: Arc::new(vm),
            chipset,
            session: None,
            switch,
            cancel: CancelToken::new(),
            run_handle: None,
            running: Arc::new(AtomicBool::new(false)),
            console_rx,
            serial,
            net,
            display,
            cid,
            runtime,
            config,
        })
    }

    /// Start (or restart) the VM run thread.
    fn start_run_thread(&mut self) {
        let vm = self.vm.clone();
        let chipset = self.chipset.clone();
        let cancel = CancelToken::new();
        self.cancel = cancel.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);
        let enable_seccomp = self.config.seccomp;

        let handle = std::thread::Builder::new()
            .name("vm-run".into())
            .spawn(move || {
                if enable_seccomp {
                    if let Err(e) = install_seccomp_filter() {
                        error!("seccomp filter install failed: {} (continuing)", e);
                    }
                }
                chipset.start();
                let result = loop {
                    match vm.run(cancel.clone(), RunConfig::default()) {
                        Ok(RunOutcome::DeviceYield) => {
                            // Deferred device work; drain and re-enter.
                            chipset.poll(Instant::now(), &vm.ram().view());
                            continue;
                        }
                        other => break other,
                    }
                };
                chipset.stop();
                running.store(false, Ordering::SeqCst);
                result
            })
            .expect("spawn vm-run thread");
        self.run_handle = Some(handle);
    }

    /// Wait for the init program to dial in and report boot-complete.
    async fn connect_session(&mut self) -> Result<()> {
        let session = RpcSession::accept(self.switch.clone(), self.config.boot_timeout).await?;
        session.wait_boot_complete(self.config.boot_timeout).await?;
        info!(cid = self.cid, "guest boot complete");
        self.session = Some(Arc::new(session));
        Ok(())
    }

    /// The control-plane session (file/net surface lives on it).
    pub fn rpc(&self) -> Result<&RpcSession> {
        self.session
            .as_deref()
            .filter(|_| self.is_running())
            .ok_or(Error::NotRunning)
    }

    /// Build a guest command.
    pub fn command(&self, program: &str) -> Result<Command<'_>> {
        let session = self.rpc()?;
        let mut command = Command::new(session, program).envs(&self.runtime.env_pairs());
        if !self.runtime.working_dir.is_empty() {
            command = command.current_dir(self.runtime.working_dir.clone());
        }
        Ok(command)
    }

    /// Run the image's default command (entrypoint + cmd).
    pub async fn run_default(&self) -> Result<crate::rpc::exec::ExecOutput> {
        let argv = self.runtime.full_command();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidConfig("image has no entrypoint or cmd".into()))?;
        self.command(program)?
            .args(args.iter().cloned())
            .run()
            .await
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Packet I/O handle when networking is enabled (plug a user-space
    /// TCP/IP stack in here).
    pub fn packet_io(&self) -> Option<&PacketQueueHandle> {
        self.net.as_ref()
    }

    /// Display surface when graphics are enabled.
    pub fn display(&self) -> Option<&Display> {
        self.display.as_ref()
    }

    /// Drain buffered serial console output.
    pub fn read_console_output(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(byte) = self.console_rx.try_recv() {
            out.push(byte);
        }
        out
    }

    /// Inject console input (keystrokes to a shell on ttyS0).
    pub fn write_console_input(&self, data: &[u8]) {
        self.serial.queue_input(data);
    }

    /// Stop vCPU execution, keeping all VM state. Returns the run outcome.
    pub fn pause(&mut self) -> Result<RunOutcome> {
        let handle = self.run_handle.take().ok_or(Error::NotRunning)?;
        self.cancel.cancel();
        let outcome = handle
            .join()
            .map_err(|_| Error::Device("vm-run thread panicked".into()))?;
        outcome
    }

    /// Resume a paused instance.
    pub fn resume(&mut self) -> Result<()> {
        if self.run_handle.is_some() {
            return Err(Error::InvalidConfig("instance already running".into()));
        }
        self.start_run_thread();
        Ok(())
    }

    /// Capture full VM state. The instance must be paused.
    pub fn capture_snapshot(&self) -> Result<VmSnapshot> {
        if self.run_handle.is_some() {
            return Err(Error::InvalidConfig(
                "pause the instance before capturing a snapshot".into(),
            ));
        }
        self.vm.capture_snapshot()
    }

    /// Pause, capture a warm-boot snapshot, and resume. Intended to be
    /// called right after `new` returns (boot-complete just fired).
    pub fn capture_warm_snapshot(&mut self) -> Result<VmSnapshot> {
        self.pause()?;
        let snapshot = self.vm.capture_snapshot()?;
        self.resume()?;
        Ok(snapshot)
    }

    /// Shut the guest down and join the run thread.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            if self.is_running() {
                let _ = session
                    .shutdown(cradle_protocol::ShutdownKind::PowerOff)
                    .await;
            }
        }
        if let Some(handle) = self.run_handle.take() {
            self.cancel.cancel();
            match handle.join() {
                Ok(Ok(outcome)) => info!(?outcome, "instance stopped"),
                Ok(Err(e)) => warn!("instance stopped with error: {}", e),
                Err(_) => return Err(Error::Device("vm-run thread panicked".into())),
            }
        }
        Ok(())
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.run_handle.is_some() {
            self.cancel.cancel();
            if let Some(handle) = self.run_handle.take() {
                let _ = handle.join();
            }
            warn!("instance dropped while running; vCPUs cancelled");
        }
    }
}

/// Restrict the VM run thread to the syscalls KVM operation needs,
/// limiting the blast radius of a hypothetical guest escape. Kills only
/// the offending thread so embedding daemons survive VM teardown.
fn install_seccomp_filter() -> Result<()> {
    use seccompiler::{SeccompAction, SeccompFilter};
    use std::convert::TryInto;

    let allowed: &[i64] = &[
        libc::SYS_read,
        libc::SYS_write,
        libc::SYS_ioctl,
        libc::SYS_close,
        libc::SYS_clock_gettime,
        libc::SYS_clock_nanosleep,
        libc::SYS_nanosleep,
        libc::SYS_futex,
        libc::SYS_mmap,
        libc::SYS_munmap,
        libc::SYS_mprotect,
        libc::SYS_madvise,
        libc::SYS_exit,
        libc::SYS_exit_group,
        libc::SYS_rt_sigreturn,
        libc::SYS_rt_sigaction,
        libc::SYS_rt_sigprocmask,
        libc::SYS_sigaltstack,
        libc::SYS_brk,
        libc::SYS_clone,
        libc::SYS_clone3,
        libc::SYS_set_robust_list,
        libc::SYS_rseq,
        libc::SYS_getrandom,
        libc::SYS_eventfd2,
        libc::SYS_openat,
        libc::SYS_newfstatat,
        libc::SYS_fstat,
        libc::SYS_fcntl,
        libc::SYS_lseek,
        libc::SYS_pread64,
        libc::SYS_pwrite64,
        libc::SYS_readv,
        libc::SYS_writev,
        libc::SYS_prctl,
        libc::SYS_seccomp,
        libc::SYS_getpid,
        libc::SYS_gettid,
        libc::SYS_tgkill,
        libc::SYS_tkill,
        libc::SYS_sched_yield,
        libc::SYS_sched_getaffinity,
    ];

    let mut rules: std::collections::BTreeMap<i64, Vec<seccompiler::SeccompRule>> =
        std::collections::BTreeMap::new();
    for &syscall in allowed {
        rules.insert(syscall, Vec::new());
    }

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::KillThread,
        SeccompAction::Allow,
        std::env::consts::ARCH
            .try_into()
            .map_err(|_| Error::InvalidConfig("unsupported seccomp architecture".into()))?,
    )
    .map_err(|e| Error::InvalidConfig(format!("seccomp filter: {:?}", e)))?;

    let program: seccompiler::BpfProgram = filter
        .try_into()
        .map_err(|e| Error::InvalidConfig(format!("seccomp compile: {:?}", e)))?;
    seccompiler::apply_filter(&program)
        .map_err(|e| Error::InvalidConfig(format!("seccomp apply: {:?}", e)))?;
    debug!("seccomp filter installed");
    Ok(())
}
