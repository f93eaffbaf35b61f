//! BLE 文件传输协议帧格式
//!
//! 所有整数均为小端，路径为 UTF-8 且不带结尾 NUL。
//!
//! | 命令 | 请求 | 响应 |
//! |------|------|------|
//! | 0x10 读 | op, 0, path_len u16, offset u32, chunk_size u32, path | 0x11 |
//! | 0x12 读续传 | op, 0x01, 0, 0, offset u32, chunk_size u32 | 0x11 |
//! | 0x20 写 | op, 0, path_len u16, offset u32, time_ns u64, total u32, path | 0x21 |
//! | 0x22 写数据 | op, 0x01, 0, 0, offset u32, len u32, data | 0x21 |
//! | 0x30 删除 | op, 0, path_len u16, path | 0x31 |
//! | 0x40 建目录 | op, 0, path_len u16, 0 x4, time_ns u64, path | 0x41 |
//! | 0x50 列目录 | op, 0, path_len u16, path | 0x51（每个条目一帧） |
//! | 0x60 移动 | op, 0, old_len u16, new_len u16, old, 0, new | 0x61 |
//!
//! 外设的响应通过 notify 分片到达，[`ResponseDecoder`] 负责按需拼接。

use crate::codec::{
    read_u8, read_u16_le, read_u32_le, read_u64_le, to_bytes_16, to_bytes_32, to_bytes_64,
};
use crate::error::{DecodeError, Result, TransferError};

pub mod opcode {
    pub const READ: u8 = 0x10;
    pub const READ_RESPONSE: u8 = 0x11;
    pub const READ_PACING: u8 = 0x12;
    pub const WRITE: u8 = 0x20;
    pub const WRITE_PACING: u8 = 0x21;
    pub const WRITE_DATA: u8 = 0x22;
    pub const DELETE: u8 = 0x30;
    pub const DELETE_RESPONSE: u8 = 0x31;
    pub const MKDIR: u8 = 0x40;
    pub const MKDIR_RESPONSE: u8 = 0x41;
    pub const LIST_DIRECTORY: u8 = 0x50;
    pub const LIST_DIRECTORY_RESPONSE: u8 = 0x51;
    pub const MOVE: u8 = 0x60;
    pub const MOVE_RESPONSE: u8 = 0x61;
}

pub mod status {
    pub const OK: u8 = 0x01;
    pub const ERROR: u8 = 0x02;
    pub const ERROR_NO_FILE: u8 = 0x05;
    pub const ERROR_READ_ONLY: u8 = 0x07;
}

/// 目录条目 flags 的第 0 位
pub const FLAG_DIRECTORY: u32 = 0x01;

const READ_HEADER: usize = 16;
const WRITE_PACING_LEN: usize = 20;
const STATUS_ONLY_LEN: usize = 2;
const MKDIR_RESPONSE_LEN: usize = 16;
const LIST_HEADER: usize = 28;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    Read {
        path: &'a str,
        offset: u32,
        chunk_size: u32,
    },
    ReadPacing {
        offset: u32,
        chunk_size: u32,
    },
    Write {
        path: &'a str,
        offset: u32,
        modified_ns: u64,
        total_size: u32,
    },
    WriteData {
        offset: u32,
        data: &'a [u8],
    },
    Delete {
        path: &'a str,
    },
    MakeDirectory {
        path: &'a str,
        modified_ns: u64,
    },
    ListDirectory {
        path: &'a str,
    },
    Move {
        from: &'a str,
        to: &'a str,
    },
}

/// 路径长度前缀，超出 u16 的路径无法编码
fn path_len(path: &str) -> Result<[u8; 2]> {
    match u16::try_from(path.len()) {
        Ok(len) => Ok(to_bytes_16(len.into())),
        Err(_) => Err(TransferError::Protocol(format!(
            "path of {} bytes exceeds the {} byte limit",
            path.len(),
            u16::MAX
        ))),
    }
}

impl Request<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Read { .. } | Request::ReadPacing { .. } => "read",
            Request::Write { .. } | Request::WriteData { .. } => "write",
            Request::Delete { .. } => "delete",
            Request::MakeDirectory { .. } => "mkdir",
            Request::ListDirectory { .. } => "list",
            Request::Move { .. } => "move",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match *self {
            Request::Read {
                path,
                offset,
                chunk_size,
            } => {
                out.extend_from_slice(&[opcode::READ, 0]);
                out.extend_from_slice(&path_len(path)?);
                out.extend_from_slice(&to_bytes_32(offset.into()));
                out.extend_from_slice(&to_bytes_32(chunk_size.into()));
                out.extend_from_slice(path.as_bytes());
            }
            Request::ReadPacing { offset, chunk_size } => {
                out.extend_from_slice(&[opcode::READ_PACING, status::OK, 0, 0]);
                out.extend_from_slice(&to_bytes_32(offset.into()));
                out.extend_from_slice(&to_bytes_32(chunk_size.into()));
            }
            Request::Write {
                path,
                offset,
                modified_ns,
                total_size,
            } => {
                out.extend_from_slice(&[opcode::WRITE, 0]);
                out.extend_from_slice(&path_len(path)?);
                out.extend_from_slice(&to_bytes_32(offset.into()));
                out.extend_from_slice(&to_bytes_64(modified_ns));
                out.extend_from_slice(&to_bytes_32(total_size.into()));
                out.extend_from_slice(path.as_bytes());
            }
            Request::WriteData { offset, data } => {
                out.extend_from_slice(&[opcode::WRITE_DATA, status::OK, 0, 0]);
                out.extend_from_slice(&to_bytes_32(offset.into()));
                out.extend_from_slice(&to_bytes_32(data.len() as u64));
                out.extend_from_slice(data);
            }
            Request::Delete { path } => {
                out.extend_from_slice(&[opcode::DELETE, 0]);
                out.extend_from_slice(&path_len(path)?);
                out.extend_from_slice(path.as_bytes());
            }
            Request::MakeDirectory { path, modified_ns } => {
                out.extend_from_slice(&[opcode::MKDIR, 0]);
                out.extend_from_slice(&path_len(path)?);
                out.extend_from_slice(&[0; 4]);
                out.extend_from_slice(&to_bytes_64(modified_ns));
                out.extend_from_slice(path.as_bytes());
            }
            Request::ListDirectory { path } => {
                out.extend_from_slice(&[opcode::LIST_DIRECTORY, 0]);
                out.extend_from_slice(&path_len(path)?);
                out.extend_from_slice(path.as_bytes());
            }
            Request::Move { from, to } => {
                out.extend_from_slice(&[opcode::MOVE, 0]);
                out.extend_from_slice(&path_len(from)?);
                out.extend_from_slice(&path_len(to)?);
                out.extend_from_slice(from.as_bytes());
                out.push(0);
                out.extend_from_slice(to.as_bytes());
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadChunk {
        status: u8,
        offset: u32,
        total_length: u32,
        data: Vec<u8>,
    },
    WritePacing {
        status: u8,
        offset: u32,
        modified_ns: u64,
        free_space: u32,
    },
    Deleted {
        status: u8,
    },
    DirectoryCreated {
        status: u8,
        modified_ns: u64,
    },
    ListEntry {
        status: u8,
        entry_index: u32,
        total_entries: u32,
        flags: u32,
        modified_ns: u64,
        file_size: u32,
        path: String,
    },
    Moved {
        status: u8,
    },
}

impl Response {
    pub fn status(&self) -> u8 {
        match self {
            Response::ReadChunk { status, .. }
            | Response::WritePacing { status, .. }
            | Response::Deleted { status }
            | Response::DirectoryCreated { status, .. }
            | Response::ListEntry { status, .. }
            | Response::Moved { status } => *status,
        }
    }

    /// 尝试从缓冲区开头解码一个完整响应
    ///
    /// 数据不足时返回 `Ok(None)`；成功时同时返回消耗的字节数。
    pub fn decode(buf: &[u8]) -> Result<Option<(Response, usize)>, DecodeError> {
        let Some(&op) = buf.first() else {
            return Ok(None);
        };
        let fixed = match op {
            opcode::READ_RESPONSE => READ_HEADER,
            opcode::WRITE_PACING => WRITE_PACING_LEN,
            opcode::DELETE_RESPONSE | opcode::MOVE_RESPONSE => STATUS_ONLY_LEN,
            opcode::MKDIR_RESPONSE => MKDIR_RESPONSE_LEN,
            opcode::LIST_DIRECTORY_RESPONSE => LIST_HEADER,
            other => return Err(DecodeError::UnknownOpcode(other)),
        };
        if buf.len() < fixed {
            return Ok(None);
        }
        let status = read_u8(buf, 1)?;

        let decoded = match op {
            opcode::READ_RESPONSE => {
                let chunk_len = read_u32_le(buf, 12)? as usize;
                let Some(data) = buf.get(READ_HEADER..READ_HEADER + chunk_len) else {
                    return Ok(None);
                };
                (
                    Response::ReadChunk {
                        status,
                        offset: read_u32_le(buf, 4)?,
                        total_length: read_u32_le(buf, 8)?,
                        data: data.to_vec(),
                    },
                    READ_HEADER + chunk_len,
                )
            }
            opcode::WRITE_PACING => (
                Response::WritePacing {
                    status,
                    offset: read_u32_le(buf, 4)?,
                    modified_ns: read_u64_le(buf, 8)?,
                    free_space: read_u32_le(buf, 16)?,
                },
                WRITE_PACING_LEN,
            ),
            opcode::DELETE_RESPONSE => (Response::Deleted { status }, STATUS_ONLY_LEN),
            opcode::MOVE_RESPONSE => (Response::Moved { status }, STATUS_ONLY_LEN),
            opcode::MKDIR_RESPONSE => (
                Response::DirectoryCreated {
                    status,
                    modified_ns: read_u64_le(buf, 8)?,
                },
                MKDIR_RESPONSE_LEN,
            ),
            _ => {
                let name_len = usize::from(read_u16_le(buf, 2)?);
                let Some(raw) = buf.get(LIST_HEADER..LIST_HEADER + name_len) else {
                    return Ok(None);
                };
                let path =
                    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidPath)?;
                (
                    Response::ListEntry {
                        status,
                        entry_index: read_u32_le(buf, 4)?,
                        total_entries: read_u32_le(buf, 8)?,
                        flags: read_u32_le(buf, 12)?,
                        modified_ns: read_u64_le(buf, 16)?,
                        file_size: read_u32_le(buf, 24)?,
                        path,
                    },
                    LIST_HEADER + name_len,
                )
            }
        };
        Ok(Some(decoded))
    }

    /// 外设侧编码，供模拟外设和测试使用
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Response::ReadChunk {
                status,
                offset,
                total_length,
                data,
            } => {
                out.extend_from_slice(&[opcode::READ_RESPONSE, *status, 0, 0]);
                out.extend_from_slice(&to_bytes_32((*offset).into()));
                out.extend_from_slice(&to_bytes_32((*total_length).into()));
                out.extend_from_slice(&to_bytes_32(data.len() as u64));
                out.extend_from_slice(data);
            }
            Response::WritePacing {
                status,
                offset,
                modified_ns,
                free_space,
            } => {
                out.extend_from_slice(&[opcode::WRITE_PACING, *status, 0, 0]);
                out.extend_from_slice(&to_bytes_32((*offset).into()));
                out.extend_from_slice(&to_bytes_64(*modified_ns));
                out.extend_from_slice(&to_bytes_32((*free_space).into()));
            }
            Response::Deleted { status } => out.extend_from_slice(&[opcode::DELETE_RESPONSE, *status]),
            Response::Moved { status } => out.extend_from_slice(&[opcode::MOVE_RESPONSE, *status]),
            Response::DirectoryCreated {
                status,
                modified_ns,
            } => {
                out.extend_from_slice(&[opcode::MKDIR_RESPONSE, *status, 0, 0, 0, 0, 0, 0]);
                out.extend_from_slice(&to_bytes_64(*modified_ns));
            }
            Response::ListEntry {
                status,
                entry_index,
                total_entries,
                flags,
                modified_ns,
                file_size,
                path,
            } => {
                out.extend_from_slice(&[opcode::LIST_DIRECTORY_RESPONSE, *status]);
                out.extend_from_slice(&to_bytes_16(path.len() as u64));
                out.extend_from_slice(&to_bytes_32((*entry_index).into()));
                out.extend_from_slice(&to_bytes_32((*total_entries).into()));
                out.extend_from_slice(&to_bytes_32((*flags).into()));
                out.extend_from_slice(&to_bytes_64(*modified_ns));
                out.extend_from_slice(&to_bytes_32((*file_size).into()));
                out.extend_from_slice(path.as_bytes());
            }
        }
        out
    }
}

fn path_at(buf: &[u8], start: usize, len: usize) -> Result<Option<&str>, DecodeError> {
    match buf.get(start..start + len) {
        Some(raw) => std::str::from_utf8(raw)
            .map(Some)
            .map_err(|_| DecodeError::InvalidPath),
        None => Ok(None),
    }
}

/// 请求解码，供模拟外设使用
pub fn decode_request(buf: &[u8]) -> Result<Option<(Request<'_>, usize)>, DecodeError> {
    let Some(&op) = buf.first() else {
        return Ok(None);
    };
    let need = |len: usize| buf.len() >= len;

    let decoded = match op {
        opcode::READ if need(12) => {
            let len = usize::from(read_u16_le(buf, 2)?);
            let offset = read_u32_le(buf, 4)?;
            let chunk_size = read_u32_le(buf, 8)?;
            path_at(buf, 12, len)?.map(|path| {
                (
                    Request::Read {
                        path,
                        offset,
                        chunk_size,
                    },
                    12 + len,
                )
            })
        }
        opcode::READ_PACING if need(12) => Some((
            Request::ReadPacing {
                offset: read_u32_le(buf, 4)?,
                chunk_size: read_u32_le(buf, 8)?,
            },
            12,
        )),
        opcode::WRITE if need(20) => {
            let len = usize::from(read_u16_le(buf, 2)?);
            let offset = read_u32_le(buf, 4)?;
            let modified_ns = read_u64_le(buf, 8)?;
            let total_size = read_u32_le(buf, 16)?;
            path_at(buf, 20, len)?.map(|path| {
                (
                    Request::Write {
                        path,
                        offset,
                        modified_ns,
                        total_size,
                    },
                    20 + len,
                )
            })
        }
        opcode::WRITE_DATA if need(12) => {
            let offset = read_u32_le(buf, 4)?;
            let len = read_u32_le(buf, 8)? as usize;
            buf.get(12..12 + len)
                .map(|data| (Request::WriteData { offset, data }, 12 + len))
        }
        opcode::DELETE | opcode::LIST_DIRECTORY if need(4) => {
            let len = usize::from(read_u16_le(buf, 2)?);
            path_at(buf, 4, len)?.map(|path| {
                let request = if op == opcode::DELETE {
                    Request::Delete { path }
                } else {
                    Request::ListDirectory { path }
                };
                (request, 4 + len)
            })
        }
        opcode::MKDIR if need(16) => {
            let len = usize::from(read_u16_le(buf, 2)?);
            let modified_ns = read_u64_le(buf, 8)?;
            path_at(buf, 16, len)?
                .map(|path| (Request::MakeDirectory { path, modified_ns }, 16 + len))
        }
        opcode::MOVE if need(6) => {
            let from_len = usize::from(read_u16_le(buf, 2)?);
            let to_len = usize::from(read_u16_le(buf, 4)?);
            let to_start = 6 + from_len + 1;
            match (path_at(buf, 6, from_len)?, path_at(buf, to_start, to_len)?) {
                (Some(from), Some(to)) => Some((Request::Move { from, to }, to_start + to_len)),
                _ => None,
            }
        }
        opcode::READ
        | opcode::READ_PACING
        | opcode::WRITE
        | opcode::WRITE_DATA
        | opcode::DELETE
        | opcode::LIST_DIRECTORY
        | opcode::MKDIR
        | opcode::MOVE => None,
        other => return Err(DecodeError::UnknownOpcode(other)),
    };
    Ok(decoded)
}

/// 增量响应解码器
///
/// notify 的边界与帧边界无关，这里缓存未消耗的字节。
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    buf: Vec<u8>,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_response(&mut self) -> Result<Option<Response>, DecodeError> {
        match Response::decode(&self.buf) {
            Ok(Some((response, consumed))) => {
                self.buf.drain(..consumed);
                Ok(Some(response))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.buf.clear();
                Err(e)
            }
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
