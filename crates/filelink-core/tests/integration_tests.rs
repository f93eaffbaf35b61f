//! 集成测试 - BLE 文件传输会话
//!
//! 用内存中的模拟外设驱动 `BleFileSession`：外设解码真实的请求帧，
//! 并把响应按很小的通知长度拆分后回送，覆盖分片拼接和 MTU 拆分。

use async_trait::async_trait;
use filelink_core::ble::{BleFileSession, FrameLink};
use filelink_core::path;
use filelink_core::transfer::protocol::{FLAG_DIRECTORY, Request, Response, decode_request, status};
use filelink_core::{FileTransport, TransferError};
use std::collections::BTreeMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

const MTU: usize = 20;
const NOTIFY_SIZE: usize = 7;
const DEVICE_BUFFER: u32 = 256;

enum Node {
    File(Vec<u8>),
    Dir,
}

struct PendingWrite {
    path: String,
    total: u32,
    data: Vec<u8>,
    modified_ns: u64,
}

#[derive(Default)]
struct DeviceState {
    nodes: BTreeMap<String, Node>,
    reading: Option<String>,
    writing: Option<PendingWrite>,
}

/// 内存模拟外设
struct FakeDevice {
    inbound: StdMutex<Vec<u8>>,
    state: StdMutex<DeviceState>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    read_only: AtomicBool,
    hold: AtomicBool,
    held: StdMutex<Vec<Vec<u8>>>,
    writes: StdMutex<Vec<usize>>,
}

fn strip_dir(path: &str) -> String {
    match path.strip_suffix('/') {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => path.to_string(),
    }
}

impl FakeDevice {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inbound: StdMutex::new(Vec::new()),
            state: StdMutex::new(DeviceState::default()),
            tx,
            rx: Mutex::new(rx),
            read_only: AtomicBool::new(false),
            hold: AtomicBool::new(false),
            held: StdMutex::new(Vec::new()),
            writes: StdMutex::new(Vec::new()),
        }
    }

    fn with_file(self, path: &str, contents: &[u8]) -> Self {
        self.state
            .lock()
            .unwrap()
            .nodes
            .insert(path.to_string(), Node::File(contents.to_vec()));
        self
    }

    fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().unwrap().nodes.get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.state.lock().unwrap().nodes.get(path), Some(Node::Dir))
    }

    fn notify(&self, response: &Response) {
        for piece in response.encode().chunks(NOTIFY_SIZE) {
            if self.hold.load(Ordering::SeqCst) {
                self.held.lock().unwrap().push(piece.to_vec());
            } else {
                self.tx.send(piece.to_vec()).unwrap();
            }
        }
    }

    fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
        for piece in self.held.lock().unwrap().drain(..) {
            self.tx.send(piece).unwrap();
        }
    }

    fn read_chunk(state: &DeviceState, path: &str, offset: u32, chunk_size: u32) -> Response {
        match state.nodes.get(path) {
            Some(Node::File(data)) => {
                let start = (offset as usize).min(data.len());
                let end = (start + chunk_size as usize).min(data.len());
                Response::ReadChunk {
                    status: status::OK,
                    offset,
                    total_length: data.len() as u32,
                    data: data[start..end].to_vec(),
                }
            }
            _ => Response::ReadChunk {
                status: status::ERROR_NO_FILE,
                offset,
                total_length: 0,
                data: Vec::new(),
            },
        }
    }

    fn handle(&self, request: Request<'_>) -> Vec<Response> {
        let mut state = self.state.lock().unwrap();
        match request {
            Request::Read {
                path,
                offset,
                chunk_size,
            } => {
                state.reading = Some(path.to_string());
                vec![Self::read_chunk(&state, path, offset, chunk_size)]
            }
            Request::ReadPacing { offset, chunk_size } => {
                let path = state.reading.clone().unwrap_or_default();
                vec![Self::read_chunk(&state, &path, offset, chunk_size)]
            }
            Request::Write {
                path,
                modified_ns,
                total_size,
                ..
            } => {
                if self.read_only.load(Ordering::SeqCst) {
                    return vec![Response::WritePacing {
                        status: status::ERROR_READ_ONLY,
                        offset: 0,
                        modified_ns: 0,
                        free_space: 0,
                    }];
                }
                if total_size == 0 {
                    state.nodes.insert(path.to_string(), Node::File(Vec::new()));
                } else {
                    state.writing = Some(PendingWrite {
                        path: path.to_string(),
                        total: total_size,
                        data: Vec::new(),
                        modified_ns,
                    });
                }
                vec![Response::WritePacing {
                    status: status::OK,
                    offset: 0,
                    modified_ns,
                    free_space: DEVICE_BUFFER.min(total_size),
                }]
            }
            Request::WriteData { offset, data } => {
                let Some(mut pending) = state.writing.take() else {
                    return vec![Response::WritePacing {
                        status: status::ERROR,
                        offset,
                        modified_ns: 0,
                        free_space: 0,
                    }];
                };
                assert_eq!(offset as usize, pending.data.len());
                pending.data.extend_from_slice(data);
                let written = pending.data.len() as u32;
                let modified_ns = pending.modified_ns;
                let remaining = pending.total - written;
                if remaining == 0 {
                    state
                        .nodes
                        .insert(pending.path.clone(), Node::File(pending.data));
                } else {
                    state.writing = Some(pending);
                }
                vec![Response::WritePacing {
                    status: status::OK,
                    offset: written,
                    modified_ns,
                    free_space: DEVICE_BUFFER.min(remaining),
                }]
            }
            Request::Delete { path } => {
                let status = match state.nodes.remove(&strip_dir(path)) {
                    Some(_) => status::OK,
                    None => status::ERROR_NO_FILE,
                };
                vec![Response::Deleted { status }]
            }
            Request::MakeDirectory { path, modified_ns } => {
                state.nodes.insert(strip_dir(path), Node::Dir);
                vec![Response::DirectoryCreated {
                    status: status::OK,
                    modified_ns,
                }]
            }
            Request::ListDirectory { path: dir } => {
                let children: Vec<(String, u32, u32)> = state
                    .nodes
                    .iter()
                    .filter(|(key, _)| path::path_removing_filename(key) == dir)
                    .map(|(key, node)| {
                        let name = path::filename_from_path(key).to_string();
                        match node {
                            Node::File(data) => (name, 0, data.len() as u32),
                            Node::Dir => (name, FLAG_DIRECTORY, 0),
                        }
                    })
                    .collect();
                let total = children.len() as u32;
                let mut responses: Vec<Response> = children
                    .into_iter()
                    .enumerate()
                    .map(|(i, (name, flags, size))| Response::ListEntry {
                        status: status::OK,
                        entry_index: i as u32,
                        total_entries: total,
                        flags,
                        modified_ns: 1_700_000_000_000_000_000,
                        file_size: size,
                        path: name,
                    })
                    .collect();
                responses.push(Response::ListEntry {
                    status: status::OK,
                    entry_index: total,
                    total_entries: total,
                    flags: 0,
                    modified_ns: 0,
                    file_size: 0,
                    path: String::new(),
                });
                responses
            }
            Request::Move { from, to } => {
                let status = match state.nodes.remove(from) {
                    Some(node) => {
                        state.nodes.insert(to.to_string(), node);
                        status::OK
                    }
                    None => status::ERROR_NO_FILE,
                };
                vec![Response::Moved { status }]
            }
        }
    }
}

#[async_trait]
impl FrameLink for FakeDevice {
    async fn send(&self, frame: &[u8]) -> filelink_core::Result<()> {
        assert!(frame.len() <= MTU, "frame of {} exceeds mtu", frame.len());
        self.writes.lock().unwrap().push(frame.len());

        let mut inbound = self.inbound.lock().unwrap();
        inbound.extend_from_slice(frame);
        loop {
            let (responses, used) = match decode_request(&inbound)? {
                Some((request, used)) => (self.handle(request), used),
                None => break,
            };
            inbound.drain(..used);
            for response in &responses {
                self.notify(response);
            }
        }
        Ok(())
    }

    async fn recv(&self) -> filelink_core::Result<Vec<u8>> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransferError::LinkLost("device gone".to_string()))
    }

    fn mtu(&self) -> usize {
        MTU
    }

    async fn close(&self) -> filelink_core::Result<()> {
        Ok(())
    }
}

fn session(device: FakeDevice) -> BleFileSession<FakeDevice> {
    BleFileSession::new(device, 512)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_write_then_read_large_file() {
    let s = session(FakeDevice::new());
    let data = pattern(5_000);

    let receipt = s.write_file("/lib/blob.bin", &data).await.unwrap();
    assert_eq!(receipt.bytes_written, 5_000);
    assert!(receipt.modified_ns.is_some());
    assert_eq!(s.link().file("/lib/blob.bin").unwrap(), data);

    // 请求被拆成不超过 MTU 的写入
    assert!(s.link().writes.lock().unwrap().iter().all(|&n| n <= MTU));

    let read = s.read_file("/lib/blob.bin").await.unwrap();
    assert_eq!(read, data);
}

#[tokio::test]
async fn test_empty_file() {
    let s = session(FakeDevice::new());
    s.write_file("/empty.txt", b"").await.unwrap();
    assert_eq!(s.link().file("/empty.txt").unwrap(), Vec::<u8>::new());
    assert!(s.read_file("/empty.txt").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_directory() {
    let device = FakeDevice::new()
        .with_file("/code.py", b"print('hello')")
        .with_file("/lib/neopixel.mpy", &[0u8; 300]);
    let s = session(device);
    s.make_directory("/lib").await.unwrap();
    assert!(s.link().is_dir("/lib"));

    let root = s.list_directory("/").await.unwrap();
    assert_eq!(root.len(), 2);
    let code = root.iter().find(|e| e.name == "code.py").unwrap();
    assert!(!code.is_directory);
    assert_eq!(code.size, 14);
    assert!(root.iter().any(|e| e.name == "lib" && e.is_directory));

    let lib = s.list_directory("/lib/").await.unwrap();
    assert_eq!(lib.len(), 1);
    assert_eq!(lib[0].size, 300);

    s.make_directory("/empty/").await.unwrap();
    assert!(s.list_directory("/empty/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_file_reports_status() {
    let s = session(FakeDevice::new());
    let err = s.read_file("/nope.txt").await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::Status {
            op: "read",
            status: status::ERROR_NO_FILE
        }
    ));
    assert!(matches!(
        s.delete("/nope.txt").await,
        Err(TransferError::Status {
            op: "delete",
            status: status::ERROR_NO_FILE
        })
    ));
    // 会话仍然可用
    assert!(s.list_directory("/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_and_move() {
    let device = FakeDevice::new().with_file("/a.txt", b"a");
    let s = session(device);

    s.move_path("/a.txt", "/b.txt").await.unwrap();
    assert!(s.link().file("/a.txt").is_none());
    assert_eq!(s.link().file("/b.txt").unwrap(), b"a");

    s.delete("/b.txt").await.unwrap();
    assert!(s.link().file("/b.txt").is_none());
}

#[tokio::test]
async fn test_read_only_filesystem() {
    let device = FakeDevice::new();
    device.read_only.store(true, Ordering::SeqCst);
    let s = session(device);
    assert!(matches!(
        s.write_file("/code.py", b"x").await,
        Err(TransferError::Status {
            op: "write",
            status: status::ERROR_READ_ONLY
        })
    ));
}

#[tokio::test]
async fn test_stat_through_listing() {
    let device = FakeDevice::new().with_file("/boot_out.txt", b"Adafruit CircuitPython");
    let s = session(device);
    let stat = s.stat("/boot_out.txt").await.unwrap();
    assert_eq!(stat.size, 22);
    assert!(!stat.is_directory);
    assert!(stat.modified_ns.is_some());
}

#[tokio::test]
async fn test_cancelled_command_leaves_session_usable() {
    let device = FakeDevice::new().with_file("/code.py", &pattern(2_000));
    let s = session(device);

    s.link().hold.store(true, Ordering::SeqCst);
    let cancelled = tokio::time::timeout(Duration::from_millis(50), s.read_file("/code.py")).await;
    assert!(cancelled.is_err());

    // 迟到的响应在下一条命令前被丢弃
    s.link().release();
    let entries = s.list_directory("/").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "code.py");
    assert_eq!(s.read_file("/code.py").await.unwrap(), pattern(2_000));
}
