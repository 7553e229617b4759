//! Guest socket operations mirroring `std::net`
//!
//! Listeners and connections live inside the guest; the host drives them by
//! handle through the control plane. `dial` opens an outbound connection
//! from the guest's network namespace, `listen_tcp`/`listen_udp` bind
//! inside the guest and accept from the host.

use cradle_protocol::{
    AcceptRequest, AcceptResponse, ConnCloseRequest, ConnReadRequest, ConnReadResponse,
    ConnWriteRequest, ConnWriteResponse, DialRequest, DialResponse, EnableNetRequest,
    ListenRequest, ListenResponse, OpTag, SetConsoleRequest,
};
use tracing::debug;

use crate::rpc::session::RpcSession;
use crate::Result;

/// A listener bound inside the guest.
pub struct GuestListener<'a> {
    session: &'a RpcSession,
    handle: u32,
    /// The resolved bind address (port filled in when 0 was requested).
    pub local_addr: String,
}

impl<'a> GuestListener<'a> {
    /// Accept one guest-side connection.
    pub async fn accept(&self) -> Result<GuestConn<'a>> {
        let response: AcceptResponse = self
            .session
            .call_decode(
                OpTag::Accept,
                &AcceptRequest {
                    listener: self.handle,
                },
            )
            .await?;
        debug!(peer = %response.peer, "guest listener accepted");
        Ok(GuestConn {
            session: self.session,
            handle: response.conn,
            peer: response.peer,
        })
    }
}

/// A connected guest-side socket.
pub struct GuestConn<'a> {
    session: &'a RpcSession,
    handle: u32,
    pub peer: String,
}

impl std::fmt::Debug for GuestConn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestConn")
            .field("handle", &self.handle)
            .field("peer", &self.peer)
            .finish()
    }
}

impl GuestConn<'_> {
    /// Read up to `max_len` bytes; empty result means EOF.
    pub async fn read(&self, max_len: u32) -> Result<Vec<u8>> {
        let response: ConnReadResponse = self
            .session
            .call_decode(
                OpTag::ConnRead,
                &ConnReadRequest {
                    conn: self.handle,
                    max_len,
                },
            )
            .await?;
        Ok(response.data)
    }

    /// Write the whole buffer.
    pub async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let response: ConnWriteResponse = self
                .session
                .call_decode(
                    OpTag::ConnWrite,
                    &ConnWriteRequest {
                        conn: self.handle,
                        data: data.to_vec(),
                    },
                )
                .await?;
            data = &data[(response.written as usize).min(data.len())..];
        }
        Ok(())
    }

    pub async fn close(self) -> Result<()> {
        self.session
            .call(OpTag::ConnClose, &ConnCloseRequest { conn: self.handle })
            .await?;
        Ok(())
    }
}

impl RpcSession {
    /// Bind a TCP listener inside the guest (`address` like ":8080").
    pub async fn listen_tcp(&self, address: &str) -> Result<GuestListener<'_>> {
        let response: ListenResponse = self
            .call_decode(
                OpTag::ListenTcp,
                &ListenRequest {
                    address: address.to_string(),
                },
            )
            .await?;
        Ok(GuestListener {
            session: self,
            handle: response.listener,
            local_addr: response.address,
        })
    }

    /// Bind a UDP socket inside the guest.
    pub async fn listen_udp(&self, address: &str) -> Result<GuestListener<'_>> {
        let response: ListenResponse = self
            .call_decode(
                OpTag::ListenUdp,
                &ListenRequest {
                    address: address.to_string(),
                },
            )
            .await?;
        Ok(GuestListener {
            session: self,
            handle: response.listener,
            local_addr: response.address,
        })
    }

    /// Open an outbound connection from inside the guest.
    pub async fn dial(&self, network: &str, address: &str) -> Result<GuestConn<'_>> {
        let response: DialResponse = self
            .call_decode(
                OpTag::Dial,
                &DialRequest {
                    network: network.to_string(),
                    address: address.to_string(),
                },
            )
            .await?;
        Ok(GuestConn {
            session: self,
            handle: response.conn,
            peer: address.to_string(),
        })
    }

    /// Route guest console output to the named device.
    pub async fn set_console(&self, device: &str) -> Result<()> {
        self.call(
            OpTag::SetConsole,
            &SetConsoleRequest {
                device: device.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Bring up guest networking with a static configuration.
    pub async fn enable_net(
        &self,
        address: &str,
        gateway: &str,
        nameserver: &str,
    ) -> Result<()> {
        self.call(
            OpTag::EnableNet,
            &EnableNetRequest {
                address: address.to_string(),
                gateway: gateway.to_string(),
                nameserver: nameserver.to_string(),
            },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::session::testing::session_with_fake_init;
    use cradle_protocol::Frame;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Fake init with one guest TCP service: a listener on :8080 whose
    /// accepted connection answers "pong" after reading "ping".
    fn net_init() -> impl FnMut(&Frame) -> Vec<Frame> + Send + 'static {
        let conns: Arc<Mutex<HashMap<u32, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
        move |frame: &Frame| -> Vec<Frame> {
            let reply = match frame.op {
                OpTag::ListenTcp => {
                    let req: ListenRequest = frame.body().unwrap();
                    assert_eq!(req.address, ":8080");
                    Frame::ok(
                        frame.request_id,
                        frame.op,
                        &ListenResponse {
                            listener: 1,
                            address: "0.0.0.0:8080".into(),
                        },
                    )
                    .unwrap()
                }
                OpTag::Accept => {
                    conns.lock().unwrap().insert(9, Vec::new());
                    Frame::ok(
                        frame.request_id,
                        frame.op,
                        &AcceptResponse {
                            conn: 9,
                            peer: "127.0.0.1:55000".into(),
                        },
                    )
                    .unwrap()
                }
                OpTag::ConnWrite => {
                    let req: ConnWriteRequest = frame.body().unwrap();
                    let mut conns = conns.lock().unwrap();
                    let buffered = conns.get_mut(&req.conn).unwrap();
                    // The guest handler answers "ping" with "pong".
                    if req.data == b"ping" {
                        buffered.extend_from_slice(b"pong");
                    }
                    Frame::ok(
                        frame.request_id,
                        frame.op,
                        &ConnWriteResponse {
                            written: req.data.len() as u32,
                        },
                    )
                    .unwrap()
                }
                OpTag::ConnRead => {
                    let req: ConnReadRequest = frame.body().unwrap();
                    let mut conns = conns.lock().unwrap();
                    let buffered = conns.get_mut(&req.conn).unwrap();
                    let take = buffered.len().min(req.max_len as usize);
                    let data: Vec<u8> = buffered.drain(..take).collect();
                    Frame::ok(
                        frame.request_id,
                        frame.op,
                        &ConnReadResponse { data, eof: false },
                    )
                    .unwrap()
                }
                OpTag::ConnClose => Frame::ok(frame.request_id, frame.op, &()).unwrap(),
                _ => Frame::err(frame.request_id, frame.op, libc::ENOSYS, "nope"),
            };
            vec![reply]
        }
    }

    #[tokio::test]
    async fn listen_accept_ping_pong() {
        let (session, _emu) = session_with_fake_init(net_init()).await;

        let listener = session.listen_tcp(":8080").await.unwrap();
        assert_eq!(listener.local_addr, "0.0.0.0:8080");

        let conn = listener.accept().await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let answer = conn.read(64).await.unwrap();
        assert_eq!(answer, b"pong");
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn dial_refused_surfaces_errno() {
        let (session, _emu) = session_with_fake_init(|frame: &Frame| {
            vec![Frame::err(
                frame.request_id,
                frame.op,
                libc::ECONNREFUSED,
                "nothing listening",
            )]
        })
        .await;

        let err = session.dial("tcp", "10.0.0.1:1").await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Rpc {
                errno: libc::ECONNREFUSED,
                ..
            }
        ));
    }
}
