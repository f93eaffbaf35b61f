//! WiFi 文件会话
//!
//! 通过外设自带的 HTTP 文件接口 (`/fs/`) 完成文件操作：
//! - `GET /fs/<dir>/` 列目录（JSON）
//! - `GET` / `PUT` / `DELETE /fs/<file>`
//! - `PUT /fs/<dir>/` 创建目录
//! - `MOVE /fs/<from>` + `X-Destination: /fs/<to>`
//!
//! 路径中的 `#`、`?`、空格等按段编码后再发送。

use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::{ACCEPT, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;

use crate::error::{Result, TransferError};
use crate::path;
use crate::peripheral::now_millis;
use crate::transfer::protocol::status;
use crate::transfer::{DirectoryEntry, FileTransport, WriteReceipt};

const FS_SEGMENT: &str = "fs";
const DESTINATION_HEADER: &str = "X-Destination";
/// 修改时间，单位毫秒
const TIMESTAMP_HEADER: &str = "X-Timestamp";

#[derive(Deserialize)]
#[serde(untagged)]
enum Listing {
    Wrapped { files: Vec<WebEntry> },
    Bare(Vec<WebEntry>),
}

#[derive(Deserialize)]
struct WebEntry {
    name: String,
    #[serde(default)]
    directory: bool,
    #[serde(default)]
    file_size: u64,
    #[serde(default)]
    modified_ns: Option<u64>,
}

impl From<WebEntry> for DirectoryEntry {
    fn from(e: WebEntry) -> Self {
        DirectoryEntry {
            name: e.name,
            is_directory: e.directory,
            size: e.file_size,
            modified_ns: e.modified_ns,
        }
    }
}

/// HTTP 状态码映射为传输状态码
pub fn status_for(code: StatusCode) -> u8 {
    match code {
        StatusCode::NOT_FOUND => status::ERROR_NO_FILE,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::CONFLICT => {
            status::ERROR_READ_ONLY
        }
        _ => status::ERROR,
    }
}

fn parse_listing(body: &[u8]) -> Result<Vec<DirectoryEntry>> {
    let listing: Listing = serde_json::from_slice(body)
        .map_err(|e| TransferError::Protocol(format!("malformed directory listing: {e}")))?;
    let files = match listing {
        Listing::Wrapped { files } | Listing::Bare(files) => files,
    };
    Ok(files.into_iter().map(DirectoryEntry::from).collect())
}

fn as_directory(dir: &str) -> String {
    if dir.ends_with(path::SEPARATOR) {
        dir.to_string()
    } else {
        format!("{dir}{}", path::SEPARATOR)
    }
}

pub struct HttpFileSession {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFileSession {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `/fs` 下的地址，每段路径单独做百分号编码
    fn url(&self, path: &str) -> Result<Url> {
        let invalid = || TransferError::Protocol(format!("invalid base url {}", self.base_url));
        let mut url = Url::parse(&self.base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|()| invalid())?
            .pop_if_empty()
            .push(FS_SEGMENT)
            .extend(path.trim_start_matches(path::SEPARATOR).split(path::SEPARATOR));
        Ok(url)
    }

    /// 确认外设的文件接口可用
    pub async fn probe(&self) -> Result<()> {
        let entries = self.list_directory("/").await?;
        info!(
            "Web workflow ready at {} ({} root entries)",
            self.base_url,
            entries.len()
        );
        Ok(())
    }

    async fn send(
        &self,
        op: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let response = request.send().await?;
        let code = response.status();
        if code.is_success() {
            Ok(response)
        } else {
            debug!("{} rejected by {} with HTTP {}", op, self.base_url, code);
            Err(TransferError::Status {
                op,
                status: status_for(code),
            })
        }
    }
}

#[async_trait]
impl FileTransport for HttpFileSession {
    async fn list_directory(&self, path: &str) -> Result<Vec<DirectoryEntry>> {
        let request = self
            .client
            .get(self.url(&as_directory(path))?)
            .header(ACCEPT, HeaderValue::from_static("application/json"));
        let body = self.send("list", request).await?.bytes().await?;
        let entries = parse_listing(&body)?;
        debug!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let request = self.client.get(self.url(path)?);
        let body = self.send("read", request).await?.bytes().await?;
        debug!("Read {} byte(s) from {}", body.len(), path);
        Ok(body.to_vec())
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<WriteReceipt> {
        let modified = now_millis();
        let request = self
            .client
            .put(self.url(path)?)
            .header(TIMESTAMP_HEADER, modified)
            .body(data.to_vec());
        self.send("write", request).await?;
        debug!("Wrote {} byte(s) to {}", data.len(), path);
        Ok(WriteReceipt {
            bytes_written: data.len() as u64,
            modified_ns: Some(modified.saturating_mul(1_000_000)),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.send("delete", self.client.delete(self.url(path)?)).await?;
        Ok(())
    }

    async fn make_directory(&self, path: &str) -> Result<()> {
        let request = self
            .client
            .put(self.url(&as_directory(path))?)
            .header(TIMESTAMP_HEADER, now_millis());
        self.send("mkdir", request).await?;
        Ok(())
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let method = Method::from_bytes(b"MOVE")
            .map_err(|e| TransferError::Protocol(e.to_string()))?;
        let request = self
            .client
            .request(method, self.url(from)?)
            .header(DESTINATION_HEADER, self.url(to)?.path());
        self.send("move", request).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_listing() {
        let body = br#"[
            {"name": "lib", "directory": true, "modified_ns": 1, "file_size": 0},
            {"name": "code.py", "directory": false, "modified_ns": 2, "file_size": 120}
        ]"#;
        let entries = parse_listing(body).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_directory);
        assert_eq!(entries[1].size, 120);
        assert_eq!(entries[1].modified_ns, Some(2));
    }

    #[test]
    fn test_parse_wrapped_listing() {
        let body = br#"{"free": 10, "total": 20, "files": [{"name": "boot_out.txt", "file_size": 5}]}"#;
        let entries = parse_listing(body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "boot_out.txt");
        assert!(!entries[0].is_directory);
        assert_eq!(entries[0].modified_ns, None);
    }

    #[test]
    fn test_parse_listing_rejects_garbage() {
        assert!(matches!(
            parse_listing(b"<html>"),
            Err(TransferError::Protocol(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(StatusCode::NOT_FOUND), status::ERROR_NO_FILE);
        assert_eq!(status_for(StatusCode::CONFLICT), status::ERROR_READ_ONLY);
        assert_eq!(status_for(StatusCode::FORBIDDEN), status::ERROR_READ_ONLY);
        assert_eq!(status_for(StatusCode::INTERNAL_SERVER_ERROR), status::ERROR);
    }

    #[test]
    fn test_urls() {
        let session = HttpFileSession::new(reqwest::Client::new(), "http://cpy.local/");
        assert_eq!(session.base_url(), "http://cpy.local");
        assert_eq!(
            session.url("/lib/a.py").unwrap().as_str(),
            "http://cpy.local/fs/lib/a.py"
        );
        assert_eq!(session.url("/").unwrap().path(), "/fs/");
        assert_eq!(session.url("/lib/").unwrap().path(), "/fs/lib/");
        assert_eq!(as_directory("/lib"), "/lib/");
        assert_eq!(as_directory("/"), "/");
    }

    #[test]
    fn test_url_escapes_reserved_characters() {
        let session = HttpFileSession::new(reqwest::Client::new(), "http://192.168.1.20:8080");
        let url = session.url("/my notes/#1?.txt").unwrap();
        assert_eq!(url.path(), "/fs/my%20notes/%231%3F.txt");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
        assert_eq!(
            session.url("/100%.py").unwrap().path(),
            "/fs/100%25.py"
        );
    }
}
