//! File operations mirroring `std::fs` against the guest root

use cradle_protocol::{
    ChmodRequest, ChownRequest, ChtimesRequest, CloseRequest, DirEntry, FileStat, MkdirRequest,
    OpenRequest, OpenResponse, OpTag, PathRequest, ReadRequest, ReadResponse, ReaddirResponse,
    ReadlinkResponse, RenameRequest, SymlinkRequest, WriteRequest, WriteResponse,
};
use tracing::trace;

use crate::rpc::session::RpcSession;
use crate::Result;

/// Bulk transfer chunk size.
const CHUNK: u32 = 1 << 20;

impl RpcSession {
    /// Read an entire guest file.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let open: OpenResponse = self
            .call_decode(
                OpTag::Open,
                &OpenRequest {
                    path: path.to_string(),
                    flags: libc::O_RDONLY,
                    mode: 0,
                },
            )
            .await?;

        let mut out = Vec::new();
        let mut offset = 0u64;
        loop {
            let chunk: ReadResponse = self
                .call_decode(
                    OpTag::Read,
                    &ReadRequest {
                        handle: open.handle,
                        offset,
                        len: CHUNK,
                    },
                )
                .await?;
            offset += chunk.data.len() as u64;
            out.extend_from_slice(&chunk.data);
            if chunk.eof || chunk.data.is_empty() {
                break;
            }
        }

        self.call(OpTag::Close, &CloseRequest { handle: open.handle })
            .await?;
        trace!(path, len = out.len(), "read_file");
        Ok(out)
    }

    /// Write an entire guest file, creating or truncating it.
    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let open: OpenResponse = self
            .call_decode(
                OpTag::Open,
                &OpenRequest {
                    path: path.to_string(),
                    flags: libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                    mode: 0o644,
                },
            )
            .await?;

        let mut offset = 0u64;
        for chunk in contents.chunks(CHUNK as usize) {
            let written: WriteResponse = self
                .call_decode(
                    OpTag::Write,
                    &WriteRequest {
                        handle: open.handle,
                        offset,
                        data: chunk.to_vec(),
                    },
                )
                .await?;
            offset += written.written as u64;
        }

        self.call(OpTag::Close, &CloseRequest { handle: open.handle })
            .await?;
        trace!(path, len = contents.len(), "write_file");
        Ok(())
    }

    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        self.call_decode(
            OpTag::Stat,
            &PathRequest {
                path: path.to_string(),
            },
        )
        .await
    }

    /// `stat` without following a trailing symlink.
    pub async fn lstat(&self, path: &str) -> Result<FileStat> {
        self.call_decode(
            OpTag::Lstat,
            &PathRequest {
                path: path.to_string(),
            },
        )
        .await
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.call(
            OpTag::Mkdir,
            &MkdirRequest {
                path: path.to_string(),
                mode,
                parents: false,
            },
        )
        .await?;
        Ok(())
    }

    /// `mkdir -p`.
    pub async fn mkdir_all(&self, path: &str) -> Result<()> {
        self.call(
            OpTag::Mkdir,
            &MkdirRequest {
                path: path.to_string(),
                mode: 0o755,
                parents: true,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn remove_file(&self, path: &str) -> Result<()> {
        self.call(
            OpTag::Unlink,
            &PathRequest {
                path: path.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn remove_dir(&self, path: &str) -> Result<()> {
        self.call(
            OpTag::Rmdir,
            &PathRequest {
                path: path.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.call(
            OpTag::Rename,
            &RenameRequest {
                from: from.to_string(),
                to: to.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn symlink(&self, target: &str, link: &str) -> Result<()> {
        self.call(
            OpTag::Symlink,
            &SymlinkRequest {
                target: target.to_string(),
                link: link.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn read_link(&self, path: &str) -> Result<String> {
        let response: ReadlinkResponse = self
            .call_decode(
                OpTag::Readlink,
                &PathRequest {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(response.target)
    }

    pub async fn set_permissions(&self, path: &str, mode: u32) -> Result<()> {
        self.call(
            OpTag::Chmod,
            &ChmodRequest {
                path: path.to_string(),
                mode,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.call(
            OpTag::Chown,
            &ChownRequest {
                path: path.to_string(),
                uid,
                gid,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn set_times(&self, path: &str, atime_unix: i64, mtime_unix: i64) -> Result<()> {
        self.call(
            OpTag::Chtimes,
            &ChtimesRequest {
                path: path.to_string(),
                atime_unix,
                mtime_unix,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let response: ReaddirResponse = self
            .call_decode(
                OpTag::Readdir,
                &PathRequest {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(response.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::session::testing::session_with_fake_init;
    use crate::Error;
    use cradle_protocol::Frame;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Fake init with a tiny in-memory filesystem.
    fn fs_init() -> impl FnMut(&Frame) -> Vec<Frame> + Send + 'static {
        let files: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
        let handles: Arc<Mutex<HashMap<u32, String>>> = Arc::new(Mutex::new(HashMap::new()));
        let next_handle = Arc::new(Mutex::new(1u32));

        move |frame: &Frame| -> Vec<Frame> {
            let reply = match frame.op {
                OpTag::Open => {
                    let req: OpenRequest = frame.body().unwrap();
                    if req.flags & libc::O_CREAT == 0
                        && !files.lock().unwrap().contains_key(&req.path)
                    {
                        Frame::err(frame.request_id, frame.op, libc::ENOENT, "missing")
                    } else {
                        files
                            .lock()
                            .unwrap()
                            .entry(req.path.clone())
                            .or_default();
                        let mut next = next_handle.lock().unwrap();
                        let handle = *next;
                        *next += 1;
                        handles.lock().unwrap().insert(handle, req.path);
                        Frame::ok(frame.request_id, frame.op, &OpenResponse { handle })
                            .unwrap()
                    }
                }
                OpTag::Read => {
                    let req: ReadRequest = frame.body().unwrap();
                    let path = handles.lock().unwrap()[&req.handle].clone();
                    let data = files.lock().unwrap()[&path].clone();
                    let start = (req.offset as usize).min(data.len());
                    let end = (start + req.len as usize).min(data.len());
                    Frame::ok(
                        frame.request_id,
                        frame.op,
                        &ReadResponse {
                            data: data[start..end].to_vec(),
                            eof: end == data.len(),
                        },
                    )
                    .unwrap()
                }
                OpTag::Write => {
                    let req: WriteRequest = frame.body().unwrap();
                    let path = handles.lock().unwrap()[&req.handle].clone();
                    let mut files = files.lock().unwrap();
                    let file = files.get_mut(&path).unwrap();
                    let end = req.offset as usize + req.data.len();
                    if file.len() < end {
                        file.resize(end, 0);
                    }
                    file[req.offset as usize..end].copy_from_slice(&req.data);
                    Frame::ok(
                        frame.request_id,
                        frame.op,
                        &WriteResponse {
                            written: req.data.len() as u32,
                        },
                    )
                    .unwrap()
                }
                OpTag::Close => Frame::ok(frame.request_id, frame.op, &()).unwrap(),
                OpTag::Stat => {
                    let req: PathRequest = frame.body().unwrap();
                    match files.lock().unwrap().get(&req.path) {
                        Some(data) => Frame::ok(
                            frame.request_id,
                            frame.op,
                            &FileStat {
                                mode: 0o100644,
                                size: data.len() as u64,
                                ..Default::default()
                            },
                        )
                        .unwrap(),
                        None => {
                            Frame::err(frame.request_id, frame.op, libc::ENOENT, "missing")
                        }
                    }
                }
                _ => Frame::err(frame.request_id, frame.op, libc::ENOSYS, "unsupported"),
            };
            vec![reply]
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let (session, _emu) = session_with_fake_init(fs_init()).await;
        let payload: Vec<u8> = (0u8..=255).collect();
        session.write_file("/tmp/blob", &payload).await.unwrap();
        let back = session.read_file("/tmp/blob").await.unwrap();
        assert_eq!(back, payload);
    }

    #[tokio::test]
    async fn stat_reports_size() {
        let (session, _emu) = session_with_fake_init(fs_init()).await;
        session.write_file("/etc/hostname", b"guest\n").await.unwrap();
        let stat = session.stat("/etc/hostname").await.unwrap();
        assert_eq!(stat.size, 6);
    }

    #[tokio::test]
    async fn missing_file_is_enoent() {
        let (session, _emu) = session_with_fake_init(fs_init()).await;
        let err = session.read_file("/does/not/exist").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Rpc {
                errno: libc::ENOENT,
                ..
            }
        ));
    }
}
