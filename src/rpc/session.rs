//! Control-plane session: framed request/response over vsock port 1
//!
//! The guest init program dials the host at CID 2 port 1 once its mounts
//! are up; its first frame is a boot-complete ping notification
//! (request id 0). From then on the host issues framed requests and the
//! init answers, possibly out of order; correlation is by request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cradle_protocol::{ErrnoBody, Frame, OpTag, PingBody, CONTROL_PORT, HEADER_SIZE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

use crate::virtio::vsock::{VsockSwitch, VsockWriter};
use crate::{Error, Result};

/// Default per-call deadline.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<u32, oneshot::Sender<Frame>>>>;

/// A live control-plane session with the guest init program.
pub struct RpcSession {
    writer: VsockWriter,
    pending: Pending,
    next_id: AtomicU32,
    switch: VsockSwitch,
    reader: Option<tokio::task::JoinHandle<()>>,
    boot_complete: watch::Receiver<bool>,
    /// Next host port handed to auxiliary (stdio, socket) listeners.
    next_aux_port: AtomicU32,
    timeout: Duration,
}

impl RpcSession {
    /// Wait for the init program to dial in on the control port.
    pub async fn accept(switch: VsockSwitch, deadline: Duration) -> Result<Self> {
        let mut listener = switch.listen(CONTROL_PORT);
        let mut stream = match tokio::time::timeout(deadline, listener.recv()).await {
            Ok(Some(stream)) => stream,
            Ok(None) => return Err(Error::Device("vsock switch closed".into())),
            Err(_) => return Err(Error::Timeout("control channel accept")),
        };
        debug!(guest_port = stream.peer_port, "control channel established");

        let writer = stream.writer();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (boot_tx, boot_rx) = watch::channel(false);

        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                // Parse every complete frame in the buffer.
                while buffer.len() >= HEADER_SIZE {
                    let len = u32::from_le_bytes(buffer[8..12].try_into().unwrap()) as usize;
                    if buffer.len() < HEADER_SIZE + len {
                        break;
                    }
                    match Frame::deserialize(&buffer[..HEADER_SIZE + len]) {
                        Ok(frame) => {
                            buffer.drain(..HEADER_SIZE + len);
                            trace!(
                                request_id = frame.request_id,
                                op = frame.op.name(),
                                "frame from guest"
                            );
                            if frame.request_id == 0 {
                                // Unsolicited notification: boot complete.
                                if frame.op == OpTag::Ping {
                                    let complete = frame
                                        .body::<PingBody>()
                                        .map(|b| b.boot_complete)
                                        .unwrap_or(false);
                                    if complete {
                                        let _ = boot_tx.send(true);
                                    }
                                }
                                continue;
                            }
                            let waiter =
                                reader_pending.lock().unwrap().remove(&frame.request_id);
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(frame);
                                }
                                None => {
                                    warn!(
                                        request_id = frame.request_id,
                                        "response without a waiter dropped"
                                    );
                                }
                            }
                        }
                        Err(e) => {
                            warn!("control stream framing error: {}", e);
                            buffer.clear();
                            break;
                        }
                    }
                }
                match stream.read().await {
                    Some(chunk) => buffer.extend_from_slice(&chunk),
                    None => {
                        debug!("control stream closed by guest");
                        // Outstanding calls observe the drop as ECONNRESET.
                        reader_pending.lock().unwrap().clear();
                        return;
                    }
                }
            }
        });

        Ok(Self {
            writer,
            pending,
            next_id: AtomicU32::new(1),
            switch,
            reader: Some(reader),
            boot_complete: boot_rx,
            next_aux_port: AtomicU32::new(10_000),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The vsock fabric, for auxiliary streams.
    pub fn switch(&self) -> &VsockSwitch {
        &self.switch
    }

    /// Allocate a host port for an auxiliary stream listener.
    pub fn alloc_aux_port(&self) -> u32 {
        self.next_aux_port.fetch_add(1, Ordering::SeqCst)
    }

    /// Resolve once the init program has reported boot complete.
    pub async fn wait_boot_complete(&self, deadline: Duration) -> Result<()> {
        let mut rx = self.boot_complete.clone();
        if *rx.borrow() {
            return Ok(());
        }
        match tokio::time::timeout(deadline, rx.changed()).await {
            Ok(Ok(())) if *rx.borrow() => Ok(()),
            Ok(_) => Err(Error::Device("boot-complete watch dropped".into())),
            Err(_) => Err(Error::Timeout("boot complete")),
        }
    }

    /// Issue one request and await its response frame.
    pub async fn call<B: Serialize>(&self, op: OpTag, body: &B) -> Result<Frame> {
        self.call_with_timeout(op, body, self.timeout).await
    }

    pub async fn call_with_timeout<B: Serialize>(
        &self,
        op: OpTag,
        body: &B,
        timeout: Duration,
    ) -> Result<Frame> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::request(request_id, op, body)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id, tx);
        self.writer.write_all(&frame.serialize())?;
        trace!(request_id, op = op.name(), "request frame");

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => {
                return Err(Error::Rpc {
                    op: op.name(),
                    errno: libc::ECONNRESET,
                })
            }
            Err(_) => {
                self.pending.lock().unwrap().remove(&request_id);
                return Err(Error::Timeout(op.name()));
            }
        };

        if response.is_err() {
            let errno = response
                .body::<ErrnoBody>()
                .map(|b| b.errno)
                .unwrap_or(libc::EIO);
            return Err(Error::Rpc {
                op: op.name(),
                errno,
            });
        }
        Ok(response)
    }

    /// Issue a request and decode the OK body as `T`.
    pub async fn call_decode<B: Serialize, T: DeserializeOwned>(
        &self,
        op: OpTag,
        body: &B,
    ) -> Result<T> {
        let frame = self.call(op, body).await?;
        Ok(postcard::from_bytes(&frame.payload)
            .map_err(cradle_protocol::ProtocolError::from)?)
    }

    /// Health check round-trip.
    pub async fn ping(&self) -> Result<()> {
        let _: PingBody = self
            .call_decode(
                OpTag::Ping,
                &PingBody {
                    boot_complete: false,
                },
            )
            .await?;
        Ok(())
    }

    /// Ask the init program to power off or reboot the guest.
    pub async fn shutdown(&self, kind: cradle_protocol::ShutdownKind) -> Result<()> {
        // The guest may die before answering; tolerate a lost response.
        match self
            .call_with_timeout(
                OpTag::Shutdown,
                &cradle_protocol::ShutdownRequest { kind },
                Duration::from_secs(2),
            )
            .await
        {
            Ok(_) | Err(Error::Timeout(_)) => Ok(()),
            Err(Error::Rpc { errno, .. }) if errno == libc::ECONNRESET => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer.close();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A fake guest init living on the in-process vsock fabric.

    use super::*;
    use crate::virtio::vsock::guest_emu::GuestEmulator;

    /// Parse concatenated frames out of a byte chunk stream.
    pub(crate) struct FrameAssembler {
        buffer: Vec<u8>,
    }

    impl FrameAssembler {
        pub(crate) fn new() -> Self {
            Self { buffer: Vec::new() }
        }

        pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
            self.buffer.extend_from_slice(chunk);
            let mut frames = Vec::new();
            while self.buffer.len() >= HEADER_SIZE {
                let len =
                    u32::from_le_bytes(self.buffer[8..12].try_into().unwrap()) as usize;
                if self.buffer.len() < HEADER_SIZE + len {
                    break;
                }
                frames.push(Frame::deserialize(&self.buffer[..HEADER_SIZE + len]).unwrap());
                self.buffer.drain(..HEADER_SIZE + len);
            }
            frames
        }
    }

    /// Start a fake init that answers control frames with `handler`, dial
    /// the host control port, and accept the session.
    pub(crate) async fn session_with_fake_init<F>(handler: F) -> (RpcSession, GuestEmulator)
    where
        F: FnMut(&Frame) -> Vec<Frame> + Send + 'static,
    {
        let (emu, switch) = GuestEmulator::new(3);
        emu.spawn_pump();

        let accept = tokio::spawn({
            let switch = switch.clone();
            async move { RpcSession::accept(switch, Duration::from_secs(5)).await }
        });
        // Let the accept task register its listener before the init dials.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut assembler = FrameAssembler::new();
        let mut handler = handler;
        emu.dial_host(CONTROL_PORT, move |bytes| {
            let mut out = Vec::new();
            for frame in assembler.push(bytes) {
                for reply in handler(&frame) {
                    out.push(reply.serialize());
                }
            }
            out
        });

        let session = accept.await.unwrap().unwrap();
        (session, emu)
    }

    /// A handler implementing ping + shutdown, enough for lifecycle tests.
    pub(crate) fn minimal_init(frame: &Frame) -> Vec<Frame> {
        match frame.op {
            OpTag::Ping => vec![Frame::ok(
                frame.request_id,
                OpTag::Ping,
                &PingBody {
                    boot_complete: false,
                },
            )
            .unwrap()],
            OpTag::Shutdown => {
                let _body: cradle_protocol::ShutdownRequest = frame.body().unwrap();
                vec![Frame::ok(frame.request_id, OpTag::Shutdown, &()).unwrap()]
            }
            _ => vec![Frame::err(
                frame.request_id,
                frame.op,
                libc::ENOSYS,
                "not implemented in fake init",
            )],
        }
    }
}
