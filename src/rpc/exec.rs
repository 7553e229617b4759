//! Process execution mirroring `std::process::Command`
//!
//! A spawn opens three dedicated vsock streams for stdio: the host registers
//! listeners on freshly-allocated ports, hands the port numbers to the init
//! program in the spawn request, and the guest connects back before wiring
//! them to the child. Bulk bytes never ride the control stream; credit-based
//! flow control on the streams provides backpressure.

use std::time::Duration;

use cradle_protocol::{OpTag, SignalRequest, SpawnRequest, SpawnResponse, WaitRequest, WaitResponse};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::rpc::session::RpcSession;
use crate::{Error, Result};

/// Output from executing a command in the guest.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code, or 128+signal when the child was killed.
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One chunk of streamed child output.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    /// 1 = stdout, 2 = stderr.
    pub stream: u8,
    pub data: Vec<u8>,
}

/// Builder for a guest process.
pub struct Command<'a> {
    session: &'a RpcSession,
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<String>,
    uid: Option<u32>,
    gid: Option<u32>,
    stdin: Vec<u8>,
    timeout: Option<Duration>,
}

impl<'a> Command<'a> {
    pub fn new(session: &'a RpcSession, program: &str) -> Self {
        Self {
            session,
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            uid: None,
            gid: None,
            stdin: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn uid_gid(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    pub fn stdin_data(mut self, data: &[u8]) -> Self {
        self.stdin = data.to_vec();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Spawn, feed stdin, collect stdout/stderr to completion.
    pub async fn run(self) -> Result<ExecOutput> {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<OutputChunk>(256);
        let wait = self.spawn_streaming(chunk_tx).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = chunk_rx.recv().await {
            match chunk.stream {
                1 => stdout.extend_from_slice(&chunk.data),
                _ => stderr.extend_from_slice(&chunk.data),
            }
        }
        let status = wait.await?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: status,
        })
    }

    /// Spawn with streamed output. Chunks flow into `chunk_tx` as the child
    /// produces them; the returned future resolves with the exit code.
    pub async fn spawn_streaming(
        self,
        chunk_tx: mpsc::Sender<OutputChunk>,
    ) -> Result<impl std::future::Future<Output = Result<i32>> + 'a> {
        let session = self.session;
        let stdin_port = session.alloc_aux_port();
        let stdout_port = session.alloc_aux_port();
        let stderr_port = session.alloc_aux_port();

        let mut stdin_listener = session.switch().listen(stdin_port);
        let mut stdout_listener = session.switch().listen(stdout_port);
        let mut stderr_listener = session.switch().listen(stderr_port);

        let request = SpawnRequest {
            program: self.program.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
            uid: self.uid,
            gid: self.gid,
            stdio_ports: [stdin_port, stdout_port, stderr_port],
        };
        let spawned: SpawnResponse = session.call_decode(OpTag::Spawn, &request).await?;
        let pid = spawned.pid;
        debug!(pid, program = %self.program, "guest process spawned");

        // The init connects each stdio stream back to us.
        let accept_deadline = Duration::from_secs(10);
        let stdin_stream = tokio::time::timeout(accept_deadline, stdin_listener.recv())
            .await
            .map_err(|_| Error::Timeout("stdin stream accept"))?
            .ok_or_else(|| Error::Device("vsock switch closed".into()))?;
        let mut stdout_stream = tokio::time::timeout(accept_deadline, stdout_listener.recv())
            .await
            .map_err(|_| Error::Timeout("stdout stream accept"))?
            .ok_or_else(|| Error::Device("vsock switch closed".into()))?;
        let mut stderr_stream = tokio::time::timeout(accept_deadline, stderr_listener.recv())
            .await
            .map_err(|_| Error::Timeout("stderr stream accept"))?
            .ok_or_else(|| Error::Device("vsock switch closed".into()))?;

        // stdin: write everything, then half-close so the child sees EOF.
        if !self.stdin.is_empty() {
            stdin_stream.write_all(&self.stdin)?;
        }
        stdin_stream.close();

        // Output pumps.
        let out_tx = chunk_tx.clone();
        let stdout_pump = tokio::spawn(async move {
            while let Some(data) = stdout_stream.read().await {
                trace!(len = data.len(), "stdout chunk");
                if out_tx.send(OutputChunk { stream: 1, data }).await.is_err() {
                    break;
                }
            }
        });
        let err_tx = chunk_tx;
        let stderr_pump = tokio::spawn(async move {
            while let Some(data) = stderr_stream.read().await {
                if err_tx.send(OutputChunk { stream: 2, data }).await.is_err() {
                    break;
                }
            }
        });

        let timeout = self.timeout;
        Ok(async move {
            let wait_result: Result<WaitResponse> = match timeout {
                Some(t) => {
                    match session
                        .call_with_timeout(OpTag::Wait, &WaitRequest { pid }, t)
                        .await
                    {
                        Ok(frame) => Ok(postcard::from_bytes(&frame.payload)
                            .map_err(cradle_protocol::ProtocolError::from)?),
                        Err(Error::Timeout(_)) => {
                            // Deadline passed: kill the child, then reap it.
                            let _ = session
                                .call(
                                    OpTag::Signal,
                                    &SignalRequest {
                                        pid,
                                        signal: libc::SIGKILL,
                                    },
                                )
                                .await;
                            session.call_decode(OpTag::Wait, &WaitRequest { pid }).await
                        }
                        Err(e) => Err(e),
                    }
                }
                None => session.call_decode(OpTag::Wait, &WaitRequest { pid }).await,
            };
            // Drain the pumps so all output is delivered before returning.
            let _ = stdout_pump.await;
            let _ = stderr_pump.await;

            let status = wait_result?;
            Ok(match (status.exit_code, status.signal) {
                (Some(code), _) => code,
                (None, Some(signal)) => 128 + signal,
                (None, None) => -1,
            })
        })
    }

    /// Send a signal to a previously spawned pid.
    pub async fn signal(session: &RpcSession, pid: u32, signal: i32) -> Result<()> {
        session
            .call(OpTag::Signal, &SignalRequest { pid, signal })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::session::testing::session_with_fake_init;
    use cradle_protocol::Frame;
    use std::sync::{Arc, Mutex};

    /// The spawn future resolves only after the guest connects the three
    /// stdio streams, so the test dials them concurrently with the spawn.
    async fn dial_stdio(
        emu: &crate::virtio::vsock::guest_emu::GuestEmulator,
        recorded: &Arc<Mutex<Option<SpawnRequest>>>,
    ) -> (SpawnRequest, [u32; 3]) {
        let req = loop {
            if let Some(req) = recorded.lock().unwrap().clone() {
                break req;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        };
        let [in_port, out_port, err_port] = req.stdio_ports;
        let g_in = emu.dial_host(in_port, |_| Vec::new());
        let g_out = emu.dial_host(out_port, |_| Vec::new());
        let g_err = emu.dial_host(err_port, |_| Vec::new());
        (req, [g_in, g_out, g_err])
    }

    #[tokio::test]
    async fn spawn_wait_reports_exit_code_and_streams_stdout() {
        let recorded: Arc<Mutex<Option<SpawnRequest>>> = Arc::new(Mutex::new(None));
        let recorded_clone = recorded.clone();

        let (session, emu) = session_with_fake_init(move |frame: &Frame| {
            let reply = match frame.op {
                OpTag::Spawn => {
                    let req: SpawnRequest = frame.body().unwrap();
                    *recorded_clone.lock().unwrap() = Some(req);
                    Frame::ok(frame.request_id, frame.op, &SpawnResponse { pid: 42 }).unwrap()
                }
                OpTag::Wait => {
                    let req: WaitRequest = frame.body().unwrap();
                    assert_eq!(req.pid, 42);
                    Frame::ok(
                        frame.request_id,
                        frame.op,
                        &WaitResponse {
                            exit_code: Some(0),
                            signal: None,
                        },
                    )
                    .unwrap()
                }
                _ => Frame::err(frame.request_id, frame.op, libc::ENOSYS, "nope"),
            };
            vec![reply]
        })
        .await;

        let command = Command::new(&session, "/bin/echo")
            .arg("hello")
            .env("LANG", "C");
        let (chunk_tx, mut chunk_rx) = mpsc::channel(16);

        let (spawn_result, (req, guest_ports)) = tokio::join!(
            command.spawn_streaming(chunk_tx),
            dial_stdio(&emu, &recorded)
        );
        let wait = spawn_result.unwrap();
        assert_eq!(req.program, "/bin/echo");
        assert_eq!(req.args, vec!["hello"]);
        let [in_port, out_port, err_port] = req.stdio_ports;
        assert!(in_port != out_port && out_port != err_port);

        // Guest child writes its stdout, then every stream closes.
        emu.send_from_guest(out_port, guest_ports[1], b"hello\n".to_vec());
        emu.shutdown_from_guest(out_port, guest_ports[1]);
        emu.shutdown_from_guest(err_port, guest_ports[2]);
        emu.shutdown_from_guest(in_port, guest_ports[0]);

        let code = wait.await.unwrap();
        assert_eq!(code, 0);

        let mut stdout = Vec::new();
        while let Some(chunk) = chunk_rx.recv().await {
            if chunk.stream == 1 {
                stdout.extend_from_slice(&chunk.data);
            }
        }
        assert_eq!(stdout, b"hello\n");
    }

    #[tokio::test]
    async fn killed_child_maps_to_128_plus_signal() {
        let recorded: Arc<Mutex<Option<SpawnRequest>>> = Arc::new(Mutex::new(None));
        let recorded_clone = recorded.clone();
        let (session, emu) = session_with_fake_init(move |frame: &Frame| {
            let reply = match frame.op {
                OpTag::Spawn => {
                    let req: SpawnRequest = frame.body().unwrap();
                    *recorded_clone.lock().unwrap() = Some(req);
                    Frame::ok(frame.request_id, frame.op, &SpawnResponse { pid: 7 }).unwrap()
                }
                OpTag::Wait => Frame::ok(
                    frame.request_id,
                    frame.op,
                    &WaitResponse {
                        exit_code: None,
                        signal: Some(libc::SIGKILL),
                    },
                )
                .unwrap(),
                _ => Frame::err(frame.request_id, frame.op, libc::ENOSYS, "nope"),
            };
            vec![reply]
        })
        .await;

        let command = Command::new(&session, "/bin/sleep").arg("100");
        let (chunk_tx, _chunk_rx) = mpsc::channel(16);
        let (spawn_result, (req, guest_ports)) = tokio::join!(
            command.spawn_streaming(chunk_tx),
            dial_stdio(&emu, &recorded)
        );
        let wait = spawn_result.unwrap();
        for (i, port) in req.stdio_ports.iter().enumerate() {
            emu.shutdown_from_guest(*port, guest_ports[i]);
        }

        let code = wait.await.unwrap();
        assert_eq!(code, 128 + libc::SIGKILL);
    }
}
