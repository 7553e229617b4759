//! Guest init program for cradle VMs
//!
//! Runs as PID 1 inside the micro-VM:
//! - mounts /proc, /sys, /dev, and the virtio-fs root, then pivots into it
//! - dials the host control plane at CID 2 port 1 and serves the RPC loop
//! - spawns children with stdio routed over dedicated vsock streams,
//!   reaps them, and reports exit status or killing signal
//! - executes the shutdown op via reboot(2)
//!
//! The first frame after mounts finish is the boot-complete ping; the host
//! may hook it to capture a warm-boot snapshot.

#[cfg(not(target_os = "linux"))]
compile_error!("cradle-init is Linux-only (runs as PID 1 inside the micro-VM)");

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use cradle_protocol::{
    AcceptRequest, AcceptResponse, ChmodRequest, ChownRequest, ChtimesRequest,
    CloseRequest, ConnCloseRequest, ConnReadRequest, ConnReadResponse, ConnWriteRequest,
    ConnWriteResponse, DialRequest, DialResponse, DirEntry, FileStat, Frame, ListenRequest,
    ListenResponse, MkdirRequest, OpTag, OpenRequest, OpenResponse, PathRequest, PingBody,
    ReadRequest, ReadResponse, ReaddirResponse, ReadlinkResponse, RenameRequest, ShutdownKind,
    ShutdownRequest, SignalRequest, SpawnRequest, SpawnResponse, SymlinkRequest, WaitRequest,
    WaitResponse, WriteRequest, CONTROL_PORT, HOST_CID,
};

/// Mount tag of the virtio-fs root.
const ROOT_TAG: &str = "cradle-root";

/// Write a message to stderr and /dev/kmsg so it lands on the serial
/// console even before the console is set up.
fn kmsg(msg: &str) {
    eprintln!("cradle-init: {}", msg);
    if let Ok(mut f) = std::fs::OpenOptions::new().write(true).open("/dev/kmsg") {
        let _ = writeln!(f, "cradle-init: {}", msg);
    }
}

fn main() {
    kmsg("starting");

    if std::process::id() == 1 {
        init_system();
        sync_clock_from_cmdline();
    }

    // Reap stray zombies (double-forked daemons) in the background; direct
    // children are reaped by their wait handlers.
    install_child_reaper();

    // The host may restore a snapshot at any point, which drops the control
    // connection; reconnect forever.
    let mut first_connect = true;
    loop {
        let stream = connect_control(30);
        let Some(stream) = stream else {
            kmsg("control connect failed after retries; idling (PID 1 must not exit)");
            std::thread::sleep(std::time::Duration::from_secs(5));
            continue;
        };
        kmsg(if first_connect {
            "control channel connected"
        } else {
            "control channel reconnected"
        });
        first_connect = false;
        serve(stream);
        kmsg("control channel lost; reconnecting");
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
}

/// Mount the pseudo-filesystems and the virtio-fs root, then pivot into it.
fn init_system() {
    use nix::mount::{mount, MsFlags};

    let none: Option<&str> = None;
    let _ = std::fs::create_dir_all("/proc");
    let _ = mount(Some("proc"), "/proc", Some("proc"), MsFlags::empty(), none);
    let _ = std::fs::create_dir_all("/sys");
    let _ = mount(Some("sysfs"), "/sys", Some("sysfs"), MsFlags::empty(), none);
    let _ = std::fs::create_dir_all("/dev");
    let _ = mount(
        Some("devtmpfs"),
        "/dev",
        Some("devtmpfs"),
        MsFlags::empty(),
        none,
    );
    kmsg("pseudo filesystems mounted");

    // Mount the virtio-fs root and pivot into it. Retry while the device
    // probes.
    let _ = std::fs::create_dir_all("/newroot");
    let mut mounted = false;
    for attempt in 0..50 {
        match mount(
            Some(ROOT_TAG),
            "/newroot",
            Some("virtiofs"),
            MsFlags::empty(),
            none,
        ) {
            Ok(()) => {
                mounted = true;
                kmsg(&format!("root mounted on attempt {}", attempt + 1));
                break;
            }
            Err(_) => std::thread::sleep(std::time::Duration::from_millis(100)),
        }
    }
    if !mounted {
        kmsg("virtio-fs root did not mount; continuing on initramfs");
        return;
    }

    if let Err(e) = pivot_into("/newroot") {
        kmsg(&format!("pivot_root failed: {}; continuing on initramfs", e));
    }
}

fn pivot_into(new_root: &str) -> nix::Result<()> {
    use nix::mount::{mount, MsFlags};
    use nix::unistd::{chdir, pivot_root};

    let put_old = format!("{}/.oldroot", new_root);
    let _ = std::fs::create_dir_all(&put_old);
    pivot_root(new_root, put_old.as_str())?;
    chdir("/")?;

    // Re-mount the pseudo filesystems inside the new root.
    let none: Option<&str> = None;
    let _ = std::fs::create_dir_all("/proc");
    let _ = mount(Some("proc"), "/proc", Some("proc"), MsFlags::empty(), none);
    let _ = std::fs::create_dir_all("/sys");
    let _ = mount(Some("sysfs"), "/sys", Some("sysfs"), MsFlags::empty(), none);
    let _ = std::fs::create_dir_all("/dev");
    let _ = mount(
        Some("devtmpfs"),
        "/dev",
        Some("devtmpfs"),
        MsFlags::empty(),
        none,
    );
    // Drop the old root out of the tree.
    let _ = nix::mount::umount2("/.oldroot", nix::mount::MntFlags::MNT_DETACH);
    let _ = std::fs::remove_dir("/.oldroot");
    kmsg("pivoted into virtio-fs root");
    Ok(())
}

/// Set the wall clock from the `cradle.clock=<epoch_secs>` kernel
/// parameter. Without it the guest starts at 1970 and TLS fails.
fn sync_clock_from_cmdline() {
    let Ok(cmdline) = std::fs::read_to_string("/proc/cmdline") else {
        return;
    };
    for param in cmdline.split_whitespace() {
        if let Some(secs) = param.strip_prefix("cradle.clock=") {
            if let Ok(secs) = secs.parse::<i64>() {
                let ts = libc::timespec {
                    tv_sec: secs,
                    tv_nsec: 0,
                };
                if unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &ts) } == 0 {
                    kmsg(&format!("clock set to epoch {}", secs));
                }
            }
            return;
        }
    }
}

/// Ignore-and-reap SIGCHLD for children nobody waits on.
fn install_child_reaper() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_IGN;
        action.sa_flags = libc::SA_NOCLDSTOP;
        libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut());
    }
}

/// Open an AF_VSOCK stream to the host.
fn vsock_connect(cid: u32, port: u32) -> Option<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return None;
    }
    #[repr(C)]
    struct SockaddrVm {
        svm_family: libc::sa_family_t,
        svm_reserved1: u16,
        svm_port: u32,
        svm_cid: u32,
        svm_zero: [u8; 4],
    }
    let addr = SockaddrVm {
        svm_family: libc::AF_VSOCK as libc::sa_family_t,
        svm_reserved1: 0,
        svm_port: port,
        svm_cid: cid,
        svm_zero: [0; 4],
    };
    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        unsafe { libc::close(fd) };
        return None;
    }
    Some(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn connect_control(attempts: u32) -> Option<OwnedFd> {
    for attempt in 0..attempts {
        if let Some(fd) = vsock_connect(HOST_CID, CONTROL_PORT) {
            if attempt > 0 {
                kmsg(&format!("control connect succeeded on attempt {}", attempt + 1));
            }
            return Some(fd);
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    None
}

/// Thread-safe frame writer over the control stream.
#[derive(Clone)]
struct FrameWriter {
    fd: Arc<Mutex<RawFd>>,
}

impl FrameWriter {
    fn send(&self, frame: &Frame) -> bool {
        let bytes = frame.serialize();
        let fd = self.fd.lock().unwrap();
        let mut written = 0usize;
        while written < bytes.len() {
            let n = unsafe {
                libc::write(
                    *fd,
                    bytes[written..].as_ptr() as *const libc::c_void,
                    bytes.len() - written,
                )
            };
            if n <= 0 {
                return false;
            }
            written += n as usize;
        }
        true
    }
}

/// Everything the dispatch loop mutates.
struct State {
    /// Open file handles.
    files: HashMap<u32, std::fs::File>,
    /// Live children by pid (taken by the wait handler).
    children: HashMap<u32, Child>,
    /// Guest-side TCP/UDP listeners.
    tcp_listeners: HashMap<u32, TcpListener>,
    udp_sockets: HashMap<u32, UdpSocket>,
    /// Accepted/dialed connections.
    conns: HashMap<u32, TcpStream>,
}

static NEXT_HANDLE: AtomicU32 = AtomicU32::new(1);

fn next_handle() -> u32 {
    NEXT_HANDLE.fetch_add(1, Ordering::SeqCst)
}

/// Serve one control connection until it drops.
fn serve(stream: OwnedFd) {
    let raw = stream.as_raw_fd();
    let writer = FrameWriter {
        fd: Arc::new(Mutex::new(raw)),
    };
    let state = Arc::new(Mutex::new(State {
        files: HashMap::new(),
        children: HashMap::new(),
        tcp_listeners: HashMap::new(),
        udp_sockets: HashMap::new(),
        conns: HashMap::new(),
    }));

    // Boot-complete notification: request id 0, sent exactly once per
    // connection (the host gates on the first one).
    let boot = Frame::ok(
        0,
        OpTag::Ping,
        &PingBody {
            boot_complete: true,
        },
    )
    .expect("encode ping");
    if !writer.send(&boot) {
        return;
    }

    let mut reader = unsafe { std::fs::File::from_raw_fd(raw) };
    loop {
        let frame = match Frame::read_from_sync(&mut reader) {
            Ok(frame) => frame,
            Err(_) => break,
        };
        dispatch(frame, &writer, &state);
    }
    // The File must not close the fd the OwnedFd also owns.
    std::mem::forget(reader);
    drop(stream);
}

fn dispatch(frame: Frame, writer: &FrameWriter, state: &Arc<Mutex<State>>) {
    let id = frame.request_id;
    let op = frame.op;
    let result = match op {
        OpTag::Ping => Frame::ok(
            id,
            op,
            &PingBody {
                boot_complete: false,
            },
        )
        .map_err(|_| libc::EIO),
        OpTag::Open => handle_open(&frame, state),
        OpTag::Read => handle_read(&frame, state),
        OpTag::Write => handle_write(&frame, state),
        OpTag::Close => handle_close(&frame, state),
        OpTag::Stat => handle_stat(&frame, false),
        OpTag::Lstat => handle_stat(&frame, true),
        OpTag::Mkdir => handle_mkdir(&frame),
        OpTag::Rmdir => frame
            .body::<PathRequest>()
            .map_err(|_| libc::EINVAL)
            .and_then(|req| {
                std::fs::remove_dir(&req.path).map_err(errno_of)?;
                Frame::ok(id, op, &()).map_err(|_| libc::EIO)
            }),
        OpTag::Unlink => frame
            .body::<PathRequest>()
            .map_err(|_| libc::EINVAL)
            .and_then(|req| {
                std::fs::remove_file(&req.path).map_err(errno_of)?;
                Frame::ok(id, op, &()).map_err(|_| libc::EIO)
            }),
        OpTag::Rename => frame
            .body::<RenameRequest>()
            .map_err(|_| libc::EINVAL)
            .and_then(|req| {
                std::fs::rename(&req.from, &req.to).map_err(errno_of)?;
                Frame::ok(id, op, &()).map_err(|_| libc::EIO)
            }),
        OpTag::Symlink => frame
            .body::<SymlinkRequest>()
            .map_err(|_| libc::EINVAL)
            .and_then(|req| {
                std::os::unix::fs::symlink(&req.target, &req.link).map_err(errno_of)?;
                Frame::ok(id, op, &()).map_err(|_| libc::EIO)
            }),
        OpTag::Readlink => frame
            .body::<PathRequest>()
            .map_err(|_| libc::EINVAL)
            .and_then(|req| {
                let target = std::fs::read_link(&req.path).map_err(errno_of)?;
                Frame::ok(
                    id,
                    op,
                    &ReadlinkResponse {
                        target: target.to_string_lossy().into_owned(),
                    },
                )
                .map_err(|_| libc::EIO)
            }),
        OpTag::Chmod => frame
            .body::<ChmodRequest>()
            .map_err(|_| libc::EINVAL)
            .and_then(|req| {
                std::fs::set_permissions(
                    &req.path,
                    std::fs::Permissions::from_mode(req.mode & 0o7777),
                )
                .map_err(errno_of)?;
                Frame::ok(id, op, &()).map_err(|_| libc::EIO)
            }),
        OpTag::Chown => handle_chown(&frame),
        OpTag::Chtimes => handle_chtimes(&frame),
        OpTag::Readdir => handle_readdir(&frame),
        OpTag::Spawn => handle_spawn(&frame, state),
        OpTag::Signal => handle_signal(&frame),
        OpTag::Wait => {
            // Blocking: reap in a thread so the dispatch loop keeps serving
            // and responses go out of order.
            handle_wait_async(frame, writer.clone(), state.clone());
            return;
        }
        OpTag::ListenTcp => handle_listen_tcp(&frame, state),
        OpTag::ListenUdp => handle_listen_udp(&frame, state),
        OpTag::Accept => {
            handle_accept_async(frame, writer.clone(), state.clone());
            return;
        }
        OpTag::Dial => handle_dial(&frame, state),
        OpTag::ConnRead => handle_conn_read(&frame, state),
        OpTag::ConnWrite => handle_conn_write(&frame, state),
        OpTag::ConnClose => frame
            .body::<ConnCloseRequest>()
            .map_err(|_| libc::EINVAL)
            .and_then(|req| {
                state.lock().unwrap().conns.remove(&req.conn);
                Frame::ok(id, op, &()).map_err(|_| libc::EIO)
            }),
        OpTag::SetConsole => Frame::ok(id, op, &()).map_err(|_| libc::EIO),
        OpTag::EnableNet => handle_enable_net(&frame),
        OpTag::Shutdown => {
            let kind = frame
                .body::<ShutdownRequest>()
                .map(|r| r.kind)
                .unwrap_or(ShutdownKind::PowerOff);
            let _ = writer.send(&Frame::ok(id, op, &()).expect("encode"));
            do_shutdown(kind);
            return;
        }
        OpTag::StdioChunk => Err(libc::EINVAL),
    };

    let response = match result {
        Ok(frame) => frame,
        Err(errno) => Frame::err(id, op, errno, op.name()),
    };
    let _ = writer.send(&response);
}

fn errno_of(e: std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn stat_of(meta: &std::fs::Metadata) -> FileStat {
    FileStat {
        mode: meta.mode(),
        size: meta.len(),
        uid: meta.uid(),
        gid: meta.gid(),
        mtime_unix: meta.mtime(),
        is_dir: meta.is_dir(),
        is_symlink: meta.file_type().is_symlink(),
    }
}

fn handle_open(frame: &Frame, state: &Arc<Mutex<State>>) -> Result<Frame, i32> {
    let req: OpenRequest = frame.body().map_err(|_| libc::EINVAL)?;
    let mut options = std::fs::OpenOptions::new();
    options.read(req.flags & libc::O_WRONLY == 0);
    options.write(req.flags & (libc::O_WRONLY | libc::O_RDWR) != 0);
    options.append(req.flags & libc::O_APPEND != 0);
    options.truncate(req.flags & libc::O_TRUNC != 0);
    if req.flags & libc::O_CREAT != 0 {
        options.create(true);
        options.mode(req.mode);
    }
    use std::os::unix::fs::OpenOptionsExt;
    let file = options.open(&req.path).map_err(errno_of)?;
    let handle = next_handle();
    state.lock().unwrap().files.insert(handle, file);
    Frame::ok(frame.request_id, frame.op, &OpenResponse { handle }).map_err(|_| libc::EIO)
}

fn handle_read(frame: &Frame, state: &Arc<Mutex<State>>) -> Result<Frame, i32> {
    use std::os::unix::fs::FileExt;
    let req: ReadRequest = frame.body().map_err(|_| libc::EINVAL)?;
    let state = state.lock().unwrap();
    let file = state.files.get(&req.handle).ok_or(libc::EBADF)?;
    let mut buf = vec![0u8; req.len as usize];
    let n = file.read_at(&mut buf, req.offset).map_err(errno_of)?;
    buf.truncate(n);
    Frame::ok(
        frame.request_id,
        frame.op,
        &ReadResponse {
            eof: n == 0 || (n as u32) < req.len,
            data: buf,
        },
    )
    .map_err(|_| libc::EIO)
}

fn handle_write(frame: &Frame, state: &Arc<Mutex<State>>) -> Result<Frame, i32> {
    use std::os::unix::fs::FileExt;
    let req: WriteRequest = frame.body().map_err(|_| libc::EINVAL)?;
    let state = state.lock().unwrap();
    let file = state.files.get(&req.handle).ok_or(libc::EBADF)?;
    file.write_all_at(&req.data, req.offset).map_err(errno_of)?;
    Frame::ok(
        frame.request_id,
        frame.op,
        &cradle_protocol::WriteResponse {
            written: req.data.len() as u32,
        },
    )
    .map_err(|_| libc::EIO)
}

fn handle_close(frame: &Frame, state: &Arc<Mutex<State>>) -> Result<Frame, i32> {
    let req: CloseRequest = frame.body().map_err(|_| libc::EINVAL)?;
    state
        .lock()
        .unwrap()
        .files
        .remove(&req.handle)
        .ok_or(libc::EBADF)?;
    Frame::ok(frame.request_id, frame.op, &()).map_err(|_| libc::EIO)
}

fn handle_stat(frame: &Frame, follow_symlink_not: bool) -> Result<Frame, i32> {
    let req: PathRequest = frame.body().map_err(|_| libc::EINVAL)?;
    let meta = if follow_symlink_not {
        std::fs::symlink_metadata(&req.path)
    } else {
        std::fs::metadata(&req.path)
    }
    .map_err(errno_of)?;
    Frame::ok(frame.request_id, frame.op, &stat_of(&meta)).map_err(|_| libc::EIO)
}

fn handle_mkdir(frame: &Frame) -> Result<Frame, i32> {
    let req: MkdirRequest = frame.body().map_err(|_| libc::EINVAL)?;
    if req.parents {
        std::fs::create_dir_all(&req.path).map_err(errno_of)?;
    } else {
        std::fs::create_dir(&req.path).map_err(errno_of)?;
    }
    std::fs::set_permissions(&req.path, std::fs::Permissions::from_mode(req.mode & 0o7777))
        .map_err(errno_of)?;
    Frame::ok(frame.request_id, frame.op, &()).map_err(|_| libc::EIO)
}

fn handle_chown(frame: &Frame) -> Result<Frame, i32> {
    let req: ChownRequest = frame.body().map_err(|_| libc::EINVAL)?;
    let c_path =
        std::ffi::CString::new(req.path.as_bytes()).map_err(|_| libc::EINVAL)?;
    if unsafe { libc::chown(c_path.as_ptr(), req.uid, req.gid) } != 0 {
        return Err(std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO));
    }
    Frame::ok(frame.request_id, frame.op, &()).map_err(|_| libc::EIO)
}

fn handle_chtimes(frame: &Frame) -> Result<Frame, i32> {
    let req: ChtimesRequest = frame.body().map_err(|_| libc::EINVAL)?;
    let c_path =
        std::ffi::CString::new(req.path.as_bytes()).map_err(|_| libc::EINVAL)?;
    let times = [
        libc::timespec {
            tv_sec: req.atime_unix,
            tv_nsec: 0,
        },
        libc::timespec {
            tv_sec: req.mtime_unix,
            tv_nsec: 0,
        },
    ];
    if unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) } != 0 {
        return Err(std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO));
    }
    Frame::ok(frame.request_id, frame.op, &()).map_err(|_| libc::EIO)
}

fn handle_readdir(frame: &Frame) -> Result<Frame, i32> {
    let req: PathRequest = frame.body().map_err(|_| libc::EINVAL)?;
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&req.path).map_err(errno_of)? {
        let entry = entry.map_err(errno_of)?;
        let meta = entry.metadata().map_err(errno_of)?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            stat: stat_of(&meta),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Frame::ok(frame.request_id, frame.op, &ReaddirResponse { entries })
        .map_err(|_| libc::EIO)
}

/// Pump bytes between a child pipe and a vsock stream until EOF.
fn pump_reader_to_vsock(mut reader: impl Read + Send + 'static, port: u32) {
    std::thread::spawn(move || {
        let Some(fd) = vsock_connect(HOST_CID, port) else {
            return;
        };
        let raw = fd.as_raw_fd();
        let mut buf = [0u8; 64 * 1024];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut written = 0usize;
                    while written < n {
                        let w = unsafe {
                            libc::write(
                                raw,
                                buf[written..n].as_ptr() as *const libc::c_void,
                                n - written,
                            )
                        };
                        if w <= 0 {
                            return;
                        }
                        written += w as usize;
                    }
                }
            }
        }
        // OwnedFd drop closes the stream; the host sees EOF.
    });
}

fn pump_vsock_to_writer(port: u32, mut writer: impl Write + Send + 'static) {
    std::thread::spawn(move || {
        let Some(fd) = vsock_connect(HOST_CID, port) else {
            return;
        };
        let raw = fd.as_raw_fd();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = unsafe {
                libc::read(raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
            if writer.write_all(&buf[..n as usize]).is_err() {
                break;
            }
        }
        // Dropping the writer closes the child's stdin.
    });
}

fn handle_spawn(frame: &Frame, state: &Arc<Mutex<State>>) -> Result<Frame, i32> {
    let req: SpawnRequest = frame.body().map_err(|_| libc::EINVAL)?;

    let mut command = Command::new(&req.program);
    command
        .args(&req.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &req.env {
        command.env(key, value);
    }
    if let Some(dir) = &req.working_dir {
        if Path::new(dir).is_dir() {
            command.current_dir(dir);
        }
    }
    if let Some(uid) = req.uid {
        command.uid(uid);
    }
    if let Some(gid) = req.gid {
        command.gid(gid);
    }

    let mut child = command.spawn().map_err(errno_of)?;
    let pid = child.id();

    // Wire stdio to the dedicated streams the host is listening on.
    let [stdin_port, stdout_port, stderr_port] = req.stdio_ports;
    if let Some(stdin) = child.stdin.take() {
        if stdin_port != 0 {
            pump_vsock_to_writer(stdin_port, stdin);
        }
    }
    if let Some(stdout) = child.stdout.take() {
        if stdout_port != 0 {
            pump_reader_to_vsock(stdout, stdout_port);
        }
    }
    if let Some(stderr) = child.stderr.take() {
        if stderr_port != 0 {
            pump_reader_to_vsock(stderr, stderr_port);
        }
    }

    state.lock().unwrap().children.insert(pid, child);
    Frame::ok(frame.request_id, frame.op, &SpawnResponse { pid }).map_err(|_| libc::EIO)
}

fn handle_signal(frame: &Frame) -> Result<Frame, i32> {
    let req: SignalRequest = frame.body().map_err(|_| libc::EINVAL)?;
    if unsafe { libc::kill(req.pid as libc::pid_t, req.signal) } != 0 {
        return Err(std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::ESRCH));
    }
    Frame::ok(frame.request_id, frame.op, &()).map_err(|_| libc::EIO)
}

fn handle_wait_async(frame: Frame, writer: FrameWriter, state: Arc<Mutex<State>>) {
    std::thread::spawn(move || {
        let response = (|| -> Result<Frame, i32> {
            let req: WaitRequest = frame.body().map_err(|_| libc::EINVAL)?;
            let mut child = state
                .lock()
                .unwrap()
                .children
                .remove(&req.pid)
                .ok_or(libc::ESRCH)?;
            let status = child.wait().map_err(errno_of)?;
            Frame::ok(
                frame.request_id,
                frame.op,
                &WaitResponse {
                    exit_code: status.code(),
                    signal: status.signal(),
                },
            )
            .map_err(|_| libc::EIO)
        })();
        let response = response
            .unwrap_or_else(|errno| Frame::err(frame.request_id, frame.op, errno, "wait"));
        let _ = writer.send(&response);
    });
}

fn handle_listen_tcp(frame: &Frame, state: &Arc<Mutex<State>>) -> Result<Frame, i32> {
    let req: ListenRequest = frame.body().map_err(|_| libc::EINVAL)?;
    let address = normalize_bind_addr(&req.address);
    let listener = TcpListener::bind(&address).map_err(errno_of)?;
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or(address);
    let handle = next_handle();
    state.lock().unwrap().tcp_listeners.insert(handle, listener);
    Frame::ok(
        frame.request_id,
        frame.op,
        &ListenResponse {
            listener: handle,
            address: local,
        },
    )
    .map_err(|_| libc::EIO)
}

fn handle_listen_udp(frame: &Frame, state: &Arc<Mutex<State>>) -> Result<Frame, i32> {
    let req: ListenRequest = frame.body().map_err(|_| libc::EINVAL)?;
    let address = normalize_bind_addr(&req.address);
    let socket = UdpSocket::bind(&address).map_err(errno_of)?;
    let local = socket
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or(address);
    let handle = next_handle();
    state.lock().unwrap().udp_sockets.insert(handle, socket);
    Frame::ok(
        frame.request_id,
        frame.op,
        &ListenResponse {
            listener: handle,
            address: local,
        },
    )
    .map_err(|_| libc::EIO)
}

fn normalize_bind_addr(address: &str) -> String {
    // ":8080" means every interface.
    if let Some(port) = address.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        address.to_string()
    }
}

fn handle_accept_async(frame: Frame, writer: FrameWriter, state: Arc<Mutex<State>>) {
    std::thread::spawn(move || {
        let response = (|| -> Result<Frame, i32> {
            let req: AcceptRequest = frame.body().map_err(|_| libc::EINVAL)?;
            let listener = {
                let state = state.lock().unwrap();
                state
                    .tcp_listeners
                    .get(&req.listener)
                    .ok_or(libc::EBADF)?
                    .try_clone()
                    .map_err(errno_of)?
            };
            let (conn, peer) = listener.accept().map_err(errno_of)?;
            let handle = next_handle();
            state.lock().unwrap().conns.insert(handle, conn);
            Frame::ok(
                frame.request_id,
                frame.op,
                &AcceptResponse {
                    conn: handle,
                    peer: peer.to_string(),
                },
            )
            .map_err(|_| libc::EIO)
        })();
        let response = response
            .unwrap_or_else(|errno| Frame::err(frame.request_id, frame.op, errno, "accept"));
        let _ = writer.send(&response);
    });
}

fn handle_dial(frame: &Frame, state: &Arc<Mutex<State>>) -> Result<Frame, i32> {
    let req: DialRequest = frame.body().map_err(|_| libc::EINVAL)?;
    if req.network != "tcp" {
        return Err(libc::EAFNOSUPPORT);
    }
    let conn = TcpStream::connect(&req.address).map_err(errno_of)?;
    let handle = next_handle();
    state.lock().unwrap().conns.insert(handle, conn);
    Frame::ok(frame.request_id, frame.op, &DialResponse { conn: handle })
        .map_err(|_| libc::EIO)
}

fn handle_conn_read(frame: &Frame, state: &Arc<Mutex<State>>) -> Result<Frame, i32> {
    let req: ConnReadRequest = frame.body().map_err(|_| libc::EINVAL)?;
    let mut conn = {
        let state = state.lock().unwrap();
        state
            .conns
            .get(&req.conn)
            .ok_or(libc::EBADF)?
            .try_clone()
            .map_err(errno_of)?
    };
    let mut buf = vec![0u8; (req.max_len as usize).min(1 << 20)];
    let n = conn.read(&mut buf).map_err(errno_of)?;
    buf.truncate(n);
    Frame::ok(
        frame.request_id,
        frame.op,
        &ConnReadResponse {
            eof: n == 0,
            data: buf,
        },
    )
    .map_err(|_| libc::EIO)
}

fn handle_conn_write(frame: &Frame, state: &Arc<Mutex<State>>) -> Result<Frame, i32> {
    let req: ConnWriteRequest = frame.body().map_err(|_| libc::EINVAL)?;
    let mut conn = {
        let state = state.lock().unwrap();
        state
            .conns
            .get(&req.conn)
            .ok_or(libc::EBADF)?
            .try_clone()
            .map_err(errno_of)?
    };
    conn.write_all(&req.data).map_err(errno_of)?;
    Frame::ok(
        frame.request_id,
        frame.op,
        &ConnWriteResponse {
            written: req.data.len() as u32,
        },
    )
    .map_err(|_| libc::EIO)
}

fn handle_enable_net(frame: &Frame) -> Result<Frame, i32> {
    let req: cradle_protocol::EnableNetRequest = frame.body().map_err(|_| libc::EINVAL)?;
    // Static configuration via /sbin/ip if present; errors are reported,
    // not fatal (busybox layouts vary).
    let script = [
        vec!["link", "set", "lo", "up"],
        vec!["link", "set", "eth0", "up"],
        vec!["addr", "add", &req.address, "dev", "eth0"],
        vec!["route", "add", "default", "via", &req.gateway],
    ];
    for args in &script {
        let status = Command::new("ip").args(args).status();
        if !matches!(status, Ok(s) if s.success()) {
            kmsg(&format!("ip {:?} failed", args));
        }
    }
    let resolv = format!("nameserver {}\n", req.nameserver);
    let _ = std::fs::write("/etc/resolv.conf", resolv);
    Frame::ok(frame.request_id, frame.op, &()).map_err(|_| libc::EIO)
}

fn do_shutdown(kind: ShutdownKind) -> ! {
    kmsg("shutting down");
    unsafe {
        libc::sync();
        match kind {
            ShutdownKind::Reboot => {
                libc::reboot(libc::LINUX_REBOOT_CMD_RESTART);
            }
            ShutdownKind::PowerOff => {
                libc::reboot(libc::LINUX_REBOOT_CMD_POWER_OFF);
            }
        }
    }
    // reboot(2) only returns on error; PID 1 must not exit.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_of_maps_metadata() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"12345").unwrap();
        let meta = std::fs::metadata(tmp.path()).unwrap();
        let stat = stat_of(&meta);
        assert_eq!(stat.size, 5);
        assert!(!stat.is_dir);
        assert!(!stat.is_symlink);
    }

    #[test]
    fn normalize_bind_addr_expands_bare_port() {
        assert_eq!(normalize_bind_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr("127.0.0.1:80"), "127.0.0.1:80");
    }

    #[test]
    fn handle_mkdir_sets_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("made");
        let frame = Frame::request(
            1,
            OpTag::Mkdir,
            &MkdirRequest {
                path: path.to_string_lossy().into_owned(),
                mode: 0o700,
                parents: false,
            },
        )
        .unwrap();
        let response = handle_mkdir(&frame).unwrap();
        assert!(response.is_ok());
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o700);
    }

    #[test]
    fn open_read_write_close_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        let state = Arc::new(Mutex::new(State {
            files: HashMap::new(),
            children: HashMap::new(),
            tcp_listeners: HashMap::new(),
            udp_sockets: HashMap::new(),
            conns: HashMap::new(),
        }));

        let open = Frame::request(
            1,
            OpTag::Open,
            &OpenRequest {
                path: path.to_string_lossy().into_owned(),
                flags: libc::O_RDWR | libc::O_CREAT,
                mode: 0o644,
            },
        )
        .unwrap();
        let response = handle_open(&open, &state).unwrap();
        let opened: OpenResponse = response.body().unwrap();

        let payload: Vec<u8> = (0u8..=255).collect();
        let write = Frame::request(
            2,
            OpTag::Write,
            &WriteRequest {
                handle: opened.handle,
                offset: 0,
                data: payload.clone(),
            },
        )
        .unwrap();
        handle_write(&write, &state).unwrap();

        let read = Frame::request(
            3,
            OpTag::Read,
            &ReadRequest {
                handle: opened.handle,
                offset: 0,
                len: 1024,
            },
        )
        .unwrap();
        let response = handle_read(&read, &state).unwrap();
        let body: ReadResponse = response.body().unwrap();
        assert_eq!(body.data, payload);
        assert!(body.eof);

        let close = Frame::request(
            4,
            OpTag::Close,
            &CloseRequest {
                handle: opened.handle,
            },
        )
        .unwrap();
        handle_close(&close, &state).unwrap();
        assert!(state.lock().unwrap().files.is_empty());
    }

    #[test]
    fn read_bad_handle_is_ebadf() {
        let state = Arc::new(Mutex::new(State {
            files: HashMap::new(),
            children: HashMap::new(),
            tcp_listeners: HashMap::new(),
            udp_sockets: HashMap::new(),
            conns: HashMap::new(),
        }));
        let read = Frame::request(
            1,
            OpTag::Read,
            &ReadRequest {
                handle: 999,
                offset: 0,
                len: 16,
            },
        )
        .unwrap();
        assert_eq!(handle_read(&read, &state).unwrap_err(), libc::EBADF);
    }

    #[test]
    fn listen_and_dial_loopback() {
        let state = Arc::new(Mutex::new(State {
            files: HashMap::new(),
            children: HashMap::new(),
            tcp_listeners: HashMap::new(),
            udp_sockets: HashMap::new(),
            conns: HashMap::new(),
        }));

        let listen = Frame::request(
            1,
            OpTag::ListenTcp,
            &ListenRequest {
                address: "127.0.0.1:0".into(),
            },
        )
        .unwrap();
        let response = handle_listen_tcp(&listen, &state).unwrap();
        let bound: ListenResponse = response.body().unwrap();

        let dial = Frame::request(
            2,
            OpTag::Dial,
            &DialRequest {
                network: "tcp".into(),
                address: bound.address.clone(),
            },
        )
        .unwrap();
        let response = handle_dial(&dial, &state).unwrap();
        let dialed: DialResponse = response.body().unwrap();
        assert!(dialed.conn > 0);
    }
}
