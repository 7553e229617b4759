//! Host RPC client: drive the guest like a local process
//!
//! A multiplexed session over vsock port 1: one control stream plus
//! per-request auxiliary streams for bulk stdio. Responses are correlated
//! by request id and may arrive out of order; guest errnos surface as
//! typed [`crate::Error::Rpc`] values. The public surface mirrors the
//! standard library: files ([`session::RpcSession`] file methods), exec
//! ([`exec::Command`]), and sockets ([`net`]).

pub mod exec;
pub mod files;
pub mod net;
pub mod session;

pub use exec::{Command, ExecOutput};
pub use net::{GuestConn, GuestListener};
pub use session::RpcSession;
