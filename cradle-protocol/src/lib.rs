//! Shared wire-format types for cradle host ↔ guest communication.
//!
//! This crate is the single source of truth for the control-plane protocol
//! spoken between the host VMM (`cradle`) and the guest init program
//! (`cradle-init`) over vsock port 1. Both crates depend on this to avoid
//! struct duplication.
//!
//! ## Wire Format
//!
//! Every message is framed as:
//!
//! ```text
//! ┌────────────────┬────────────┬────────────┬────────────────┬───────────┐
//! │ request_id (4B)│ op_tag (2B)│ flags (2B) │ payload_len(4B)│ payload…  │
//! └────────────────┴────────────┴────────────┴────────────────┴───────────┘
//! ```
//!
//! All header fields are little-endian. Responses mirror the `request_id` of
//! the request they answer; responses may arrive out of order. `flags`
//! carries [`flags::OK`], [`flags::ERR`] (payload is an [`ErrnoBody`]) and
//! [`flags::EOF`]. Payloads are postcard-encoded structs from this crate.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Header size in bytes: 4 (request id) + 2 (op tag) + 2 (flags) + 4 (len).
pub const HEADER_SIZE: usize = 12;

/// vsock port the guest init program listens on.
pub const CONTROL_PORT: u32 = 1;

/// CID the host side answers on.
pub const HOST_CID: u32 = 2;

/// Upper bound for a single frame payload. Larger transfers are chunked.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Initial credit (bytes in flight) granted to each bulk stdio/socket stream.
pub const STREAM_CREDIT: u32 = 256 * 1024;

/// Frame flag bits.
pub mod flags {
    /// Request completed successfully.
    pub const OK: u16 = 1 << 0;
    /// Request failed; payload is an `ErrnoBody`.
    pub const ERR: u16 = 1 << 1;
    /// No more data will follow on this stream (half-close).
    pub const EOF: u16 = 1 << 2;
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur during protocol frame parsing.
#[derive(Debug)]
pub enum ProtocolError {
    /// Frame buffer too short or incomplete.
    InvalidFrame(String),
    /// The op tag does not map to a known [`OpTag`].
    UnknownOpTag(u16),
    /// Payload exceeds [`MAX_PAYLOAD`].
    Oversized(usize),
    /// An I/O error occurred while reading or writing.
    Io(std::io::Error),
    /// Postcard (de)serialization failed.
    Encoding(postcard::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            ProtocolError::UnknownOpTag(t) => write!(f, "Unknown op tag: {}", t),
            ProtocolError::Oversized(n) => write!(f, "Payload too large: {} bytes", n),
            ProtocolError::Io(e) => write!(f, "IO error: {}", e),
            ProtocolError::Encoding(e) => write!(f, "Encoding error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl From<postcard::Error> for ProtocolError {
    fn from(e: postcard::Error) -> Self {
        ProtocolError::Encoding(e)
    }
}

// ---------------------------------------------------------------------------
// OpTag
// ---------------------------------------------------------------------------

/// Operation tags for control-plane requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum OpTag {
    Open = 1,
    Read = 2,
    Write = 3,
    Close = 4,
    Stat = 5,
    Lstat = 6,
    Mkdir = 7,
    Rmdir = 8,
    Unlink = 9,
    Rename = 10,
    Symlink = 11,
    Readlink = 12,
    Chmod = 13,
    Chown = 14,
    Chtimes = 15,
    Readdir = 16,
    Spawn = 17,
    Signal = 18,
    Wait = 19,
    StdioChunk = 20,
    ListenTcp = 21,
    ListenUdp = 22,
    Accept = 23,
    Dial = 24,
    ConnRead = 25,
    ConnWrite = 26,
    ConnClose = 27,
    SetConsole = 28,
    EnableNet = 29,
    Shutdown = 30,
    Ping = 31,
}

impl TryFrom<u16> for OpTag {
    type Error = ProtocolError;

    fn try_from(tag: u16) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => OpTag::Open,
            2 => OpTag::Read,
            3 => OpTag::Write,
            4 => OpTag::Close,
            5 => OpTag::Stat,
            6 => OpTag::Lstat,
            7 => OpTag::Mkdir,
            8 => OpTag::Rmdir,
            9 => OpTag::Unlink,
            10 => OpTag::Rename,
            11 => OpTag::Symlink,
            12 => OpTag::Readlink,
            13 => OpTag::Chmod,
            14 => OpTag::Chown,
            15 => OpTag::Chtimes,
            16 => OpTag::Readdir,
            17 => OpTag::Spawn,
            18 => OpTag::Signal,
            19 => OpTag::Wait,
            20 => OpTag::StdioChunk,
            21 => OpTag::ListenTcp,
            22 => OpTag::ListenUdp,
            23 => OpTag::Accept,
            24 => OpTag::Dial,
            25 => OpTag::ConnRead,
            26 => OpTag::ConnWrite,
            27 => OpTag::ConnClose,
            28 => OpTag::SetConsole,
            29 => OpTag::EnableNet,
            30 => OpTag::Shutdown,
            31 => OpTag::Ping,
            other => return Err(ProtocolError::UnknownOpTag(other)),
        })
    }
}

impl OpTag {
    /// Stable lower-case name, used in error context and log fields.
    pub fn name(&self) -> &'static str {
        match self {
            OpTag::Open => "open",
            OpTag::Read => "read",
            OpTag::Write => "write",
            OpTag::Close => "close",
            OpTag::Stat => "stat",
            OpTag::Lstat => "lstat",
            OpTag::Mkdir => "mkdir",
            OpTag::Rmdir => "rmdir",
            OpTag::Unlink => "unlink",
            OpTag::Rename => "rename",
            OpTag::Symlink => "symlink",
            OpTag::Readlink => "readlink",
            OpTag::Chmod => "chmod",
            OpTag::Chown => "chown",
            OpTag::Chtimes => "chtimes",
            OpTag::Readdir => "readdir",
            OpTag::Spawn => "spawn",
            OpTag::Signal => "signal",
            OpTag::Wait => "wait",
            OpTag::StdioChunk => "stdio_chunk",
            OpTag::ListenTcp => "listen_tcp",
            OpTag::ListenUdp => "listen_udp",
            OpTag::Accept => "accept",
            OpTag::Dial => "dial",
            OpTag::ConnRead => "conn_read",
            OpTag::ConnWrite => "conn_write",
            OpTag::ConnClose => "conn_close",
            OpTag::SetConsole => "set_console",
            OpTag::EnableNet => "enable_net",
            OpTag::Shutdown => "shutdown",
            OpTag::Ping => "ping",
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A framed control-plane message.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing per-session request id; responses echo it.
    pub request_id: u32,
    /// Operation this frame belongs to.
    pub op: OpTag,
    /// Bit union of [`flags`] values.
    pub flags: u16,
    /// Postcard-encoded body (may be empty).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a request frame with a postcard-encoded body.
    pub fn request<T: Serialize>(
        request_id: u32,
        op: OpTag,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_id,
            op,
            flags: 0,
            payload: postcard::to_stdvec(body)?,
        })
    }

    /// Build a successful response frame.
    pub fn ok<T: Serialize>(request_id: u32, op: OpTag, body: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_id,
            op,
            flags: flags::OK,
            payload: postcard::to_stdvec(body)?,
        })
    }

    /// Build an error response carrying a guest errno.
    pub fn err(request_id: u32, op: OpTag, errno: i32, context: &str) -> Self {
        let body = ErrnoBody {
            errno,
            context: context.to_string(),
        };
        Self {
            request_id,
            op,
            flags: flags::ERR,
            // ErrnoBody encoding cannot fail: two plain fields.
            payload: postcard::to_stdvec(&body).unwrap_or_default(),
        }
    }

    /// Decode the payload as `T`.
    pub fn body<'a, T: Deserialize<'a>>(&'a self) -> Result<T, ProtocolError> {
        Ok(postcard::from_bytes(&self.payload)?)
    }

    pub fn is_ok(&self) -> bool {
        self.flags & flags::OK != 0
    }

    pub fn is_err(&self) -> bool {
        self.flags & flags::ERR != 0
    }

    pub fn is_eof(&self) -> bool {
        self.flags & flags::EOF != 0
    }

    /// Serialize this frame into a byte buffer (header + payload).
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&(self.op as u16).to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialize a frame from a contiguous byte slice.
    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidFrame("frame too short".into()));
        }
        let request_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let op = OpTag::try_from(u16::from_le_bytes([data[4], data[5]]))?;
        let frame_flags = u16::from_le_bytes([data[6], data[7]]);
        let len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(ProtocolError::Oversized(len));
        }
        if data.len() < HEADER_SIZE + len {
            return Err(ProtocolError::InvalidFrame("incomplete frame".into()));
        }
        Ok(Self {
            request_id,
            op,
            flags: frame_flags,
            payload: data[HEADER_SIZE..HEADER_SIZE + len].to_vec(),
        })
    }

    /// Read one frame from a synchronous stream.
    pub fn read_from_sync<R: std::io::Read>(reader: &mut R) -> Result<Self, ProtocolError> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let request_id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let op = OpTag::try_from(u16::from_le_bytes([header[4], header[5]]))?;
        let frame_flags = u16::from_le_bytes([header[6], header[7]]);
        let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(ProtocolError::Oversized(len));
        }

        let mut payload = vec![0u8; len];
        if len > 0 {
            reader.read_exact(&mut payload)?;
        }

        Ok(Self {
            request_id,
            op,
            flags: frame_flags,
            payload,
        })
    }

    /// Write this frame to a synchronous stream.
    pub fn write_to_sync<W: std::io::Write>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        writer.write_all(&self.serialize())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Common bodies
// ---------------------------------------------------------------------------

/// Error payload: a guest errno plus human-readable context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrnoBody {
    pub errno: i32,
    pub context: String,
}

/// File metadata, mirroring the interesting parts of `struct stat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileStat {
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mtime_unix: i64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

/// One entry returned by `Readdir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

// --- file ops ---

/// `Open` request. `flags`/`mode` use Linux open(2) encodings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    pub path: String,
    pub flags: i32,
    pub mode: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenResponse {
    pub handle: u32,
}

/// `Read` from an open handle; `len == 0` means "to EOF, chunked".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    pub handle: u32,
    pub offset: u64,
    pub len: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    pub data: Vec<u8>,
    pub eof: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub handle: u32,
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    pub written: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseRequest {
    pub handle: u32,
}

/// Request carrying only a path (`Stat`, `Lstat`, `Rmdir`, `Unlink`,
/// `Readlink`, `Readdir`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MkdirRequest {
    pub path: String,
    pub mode: u32,
    /// Create missing parents (mkdir -p).
    pub parents: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameRequest {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymlinkRequest {
    pub target: String,
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadlinkResponse {
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChmodRequest {
    pub path: String,
    pub mode: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChownRequest {
    pub path: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChtimesRequest {
    pub path: String,
    pub atime_unix: i64,
    pub mtime_unix: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaddirResponse {
    pub entries: Vec<DirEntry>,
}

// --- process ops ---

/// `Spawn` a child process in the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Ports for the three dedicated stdio vsock streams the host has opened
    /// (stdin, stdout, stderr). Zero means "inherit /dev/null or console".
    pub stdio_ports: [u32; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResponse {
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    pub pid: u32,
    pub signal: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitRequest {
    pub pid: u32,
}

/// Terminal status of a child: either an exit code or a killing signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResponse {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// Bulk stdio bytes flowing on an auxiliary stream. `stream` is 0/1/2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioChunk {
    pub pid: u32,
    pub stream: u8,
    pub data: Vec<u8>,
}

// --- net ops ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenRequest {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenResponse {
    pub listener: u32,
    /// Actual bound address (port resolved when 0 was requested).
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub listener: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptResponse {
    pub conn: u32,
    pub peer: String,
}

/// `Dial` opens an outbound connection from inside the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialRequest {
    pub network: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialResponse {
    pub conn: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnReadRequest {
    pub conn: u32,
    pub max_len: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnReadResponse {
    pub data: Vec<u8>,
    pub eof: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnWriteRequest {
    pub conn: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnWriteResponse {
    pub written: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnCloseRequest {
    pub conn: u32,
}

// --- control ops ---

/// Route guest console output to the named device ("ttyS0", "hvc0").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetConsoleRequest {
    pub device: String,
}

/// Bring up guest networking with the given static configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnableNetRequest {
    pub address: String,
    pub gateway: String,
    pub nameserver: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownKind {
    PowerOff,
    Reboot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub kind: ShutdownKind,
}

/// First request the init program sends after mounts finish. The host may
/// hook it to capture a warm-boot snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingBody {
    pub boot_complete: bool,
}
