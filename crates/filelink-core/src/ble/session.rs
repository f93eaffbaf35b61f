//! BLE 文件传输会话
//!
//! 在任意 [`FrameLink`] 上实现 [`protocol`](crate::transfer::protocol) 的命令交互。
//! 同一时刻只有一条命令在链路上；命令被取消（future 被 drop）时，
//! 下一条命令开始前会丢弃残留的通知，连接本身保持不变。

use async_trait::async_trait;
use log::{debug, trace, warn};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::codec;
use crate::error::{Result, TransferError};
use crate::path;
use crate::peripheral::now_millis;
use crate::transfer::protocol::{FLAG_DIRECTORY, Request, Response, ResponseDecoder, status};
use crate::transfer::{DirectoryEntry, FileTransport, WriteReceipt};

/// 取消后清理残留通知时，连续无数据多久视为清空
const DRAIN_QUIET_PERIOD: Duration = Duration::from_millis(100);

/// 面向帧的字节链路
#[async_trait]
pub trait FrameLink: Send + Sync {
    /// 发送一次写入，长度不超过 [`FrameLink::mtu`]
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// 等待下一条通知
    async fn recv(&self) -> Result<Vec<u8>>;

    fn mtu(&self) -> usize;

    async fn close(&self) -> Result<()>;
}

struct SessionIo {
    decoder: ResponseDecoder,
    /// 上一条命令未完整结束
    dirty: bool,
}

pub struct BleFileSession<L> {
    link: L,
    io: Mutex<SessionIo>,
    read_chunk_size: u32,
}

fn check(op: &'static str, response: &Response) -> Result<()> {
    if response.status() == status::OK {
        Ok(())
    } else {
        Err(rejected(op, response))
    }
}

fn rejected(op: &'static str, response: &Response) -> TransferError {
    TransferError::Status {
        op,
        status: response.status(),
    }
}

fn unexpected(op: &'static str, response: &Response) -> TransferError {
    TransferError::Protocol(format!("unexpected response to {op}: {response:?}"))
}

fn now_ns() -> u64 {
    now_millis().saturating_mul(1_000_000)
}

impl<L: FrameLink> BleFileSession<L> {
    pub fn new(link: L, read_chunk_size: u32) -> Self {
        Self {
            link,
            io: Mutex::new(SessionIo {
                decoder: ResponseDecoder::new(),
                dirty: false,
            }),
            read_chunk_size: read_chunk_size.max(1),
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    async fn begin(&self, io: &mut SessionIo) {
        if !io.dirty {
            return;
        }
        let mut discarded = 0usize;
        while let Ok(Ok(bytes)) = tokio::time::timeout(DRAIN_QUIET_PERIOD, self.link.recv()).await {
            discarded += bytes.len();
        }
        discarded += io.decoder.pending();
        io.decoder.clear();
        warn!(
            "Discarded {} stale byte(s) left by a cancelled command",
            discarded
        );
        io.dirty = false;
    }

    async fn send(&self, io: &mut SessionIo, request: &Request<'_>) -> Result<()> {
        let frame = request.encode()?;
        io.dirty = true;
        trace!("-> {} {}", request.name(), codec::to_hex(&frame));
        for piece in frame.chunks(self.link.mtu().max(1)) {
            self.link.send(piece).await?;
        }
        Ok(())
    }

    async fn receive(&self, io: &mut SessionIo) -> Result<Response> {
        loop {
            if let Some(response) = io.decoder.next_response()? {
                return Ok(response);
            }
            let bytes = self.link.recv().await?;
            trace!("<- {}", codec::to_hex(&bytes));
            io.decoder.push(&bytes);
        }
    }

    /// 发送单帧命令并等待单帧响应
    async fn exchange(&self, request: &Request<'_>) -> Result<Response> {
        let mut io = self.io.lock().await;
        self.begin(&mut io).await;
        self.send(&mut io, request).await?;
        let response = self.receive(&mut io).await?;
        io.dirty = false;
        Ok(response)
    }
}

#[async_trait]
impl<L: FrameLink> FileTransport for BleFileSession<L> {
    async fn list_directory(&self, path: &str) -> Result<Vec<DirectoryEntry>> {
        let mut io = self.io.lock().await;
        self.begin(&mut io).await;
        self.send(&mut io, &Request::ListDirectory { path }).await?;

        let mut entries = Vec::new();
        loop {
            match self.receive(&mut io).await? {
                response if response.status() != status::OK => {
                    io.dirty = false;
                    return Err(rejected("list", &response));
                }
                Response::ListEntry {
                    entry_index,
                    total_entries,
                    ..
                } if entry_index >= total_entries => break,
                Response::ListEntry {
                    flags,
                    modified_ns,
                    file_size,
                    path: name,
                    ..
                } => entries.push(DirectoryEntry {
                    name,
                    is_directory: flags & FLAG_DIRECTORY != 0,
                    size: file_size.into(),
                    modified_ns: Some(modified_ns),
                }),
                other => return Err(unexpected("list", &other)),
            }
        }
        io.dirty = false;
        debug!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut io = self.io.lock().await;
        self.begin(&mut io).await;
        let chunk_size = self.read_chunk_size;
        self.send(
            &mut io,
            &Request::Read {
                path,
                offset: 0,
                chunk_size,
            },
        )
        .await?;

        let mut contents = Vec::new();
        loop {
            let (offset, total_length, data) = match self.receive(&mut io).await? {
                response if response.status() != status::OK => {
                    io.dirty = false;
                    return Err(rejected("read", &response));
                }
                Response::ReadChunk {
                    offset,
                    total_length,
                    data,
                    ..
                } => (offset, total_length, data),
                other => return Err(unexpected("read", &other)),
            };
            if u64::from(offset) != contents.len() as u64 {
                return Err(TransferError::Protocol(format!(
                    "read chunk at offset {offset}, expected {}",
                    contents.len()
                )));
            }
            contents.extend_from_slice(&data);
            let received = u32::try_from(contents.len()).unwrap_or(u32::MAX);
            if received >= total_length {
                break;
            }
            if data.is_empty() {
                return Err(TransferError::Protocol(
                    "peripheral sent an empty chunk before end of file".to_string(),
                ));
            }
            self.send(
                &mut io,
                &Request::ReadPacing {
                    offset: received,
                    chunk_size,
                },
            )
            .await?;
        }
        io.dirty = false;
        debug!("Read {} byte(s) from {}", contents.len(), path);
        Ok(contents)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<WriteReceipt> {
        let total_size = u32::try_from(data.len())
            .map_err(|_| TransferError::Protocol(format!("{} is too large", path)))?;

        let mut io = self.io.lock().await;
        self.begin(&mut io).await;
        self.send(
            &mut io,
            &Request::Write {
                path,
                offset: 0,
                modified_ns: now_ns(),
                total_size,
            },
        )
        .await?;

        loop {
            let (offset, modified_ns, free_space) = match self.receive(&mut io).await? {
                response if response.status() != status::OK => {
                    io.dirty = false;
                    return Err(rejected("write", &response));
                }
                Response::WritePacing {
                    offset,
                    modified_ns,
                    free_space,
                    ..
                } => (offset, modified_ns, free_space),
                other => return Err(unexpected("write", &other)),
            };
            if offset >= total_size {
                io.dirty = false;
                debug!("Wrote {} byte(s) to {}", total_size, path);
                return Ok(WriteReceipt {
                    bytes_written: total_size.into(),
                    modified_ns: Some(modified_ns),
                });
            }
            let start = offset as usize;
            let len = (free_space as usize).min(data.len() - start);
            if len == 0 {
                return Err(TransferError::Protocol(
                    "peripheral reported no free buffer space".to_string(),
                ));
            }
            self.send(
                &mut io,
                &Request::WriteData {
                    offset,
                    data: &data[start..start + len],
                },
            )
            .await?;
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.exchange(&Request::Delete { path }).await? {
            response @ Response::Deleted { .. } => check("delete", &response),
            other => Err(unexpected("delete", &other)),
        }
    }

    async fn make_directory(&self, path: &str) -> Result<()> {
        // 外设以结尾 `/` 识别目录
        let dir = if path.ends_with(path::SEPARATOR) {
            path.to_string()
        } else {
            format!("{path}{}", path::SEPARATOR)
        };
        let request = Request::MakeDirectory {
            path: &dir,
            modified_ns: now_ns(),
        };
        match self.exchange(&request).await? {
            response @ Response::DirectoryCreated { .. } => check("mkdir", &response),
            other => Err(unexpected("mkdir", &other)),
        }
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        match self.exchange(&Request::Move { from, to }).await? {
            response @ Response::Moved { .. } => check("move", &response),
            other => Err(unexpected("move", &other)),
        }
    }

    async fn close(&self) -> Result<()> {
        self.link.close().await
    }
}
