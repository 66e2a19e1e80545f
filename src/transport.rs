use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};
use std::fmt;
use url::Url;

use crate::config::TransferConfig;
use crate::error::TransportError;
use crate::utils::parse_content_disposition;

/// Inclusive byte span sent as a `Range: bytes=start-end` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub file_name_hint: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// `Some(false)` only when the server says `Accept-Ranges: none`.
    pub accepts_ranges: Option<bool>,
}

pub struct FetchResponse {
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub content_range_start: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_range_start", &self.content_range_start)
            .finish_non_exhaustive()
    }
}

/// The HTTP capability the transfer engine runs on.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn probe(&self, url: &Url) -> Result<ProbeResponse, TransportError>;

    async fn fetch(
        &self,
        url: &Url,
        range: Option<ByteRange>,
    ) -> Result<FetchResponse, TransportError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &TransferConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, url: &Url) -> Result<ProbeResponse, TransportError> {
        let mut response = self.client.head(url.clone()).send().await?;

        if matches!(
            response.status(),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
        ) {
            log::debug!("HEAD rejected with {}, probing with GET", response.status());
            // Only the headers are needed; the body is dropped unread.
            response = self.client.get(url.clone()).send().await?;
        }

        let headers = response.headers();
        Ok(ProbeResponse {
            status: response.status(),
            content_length: content_length(headers),
            file_name_hint: header_str(headers, header::CONTENT_DISPOSITION)
                .and_then(parse_content_disposition),
            etag: header_str(headers, header::ETAG).map(str::to_string),
            last_modified: header_str(headers, header::LAST_MODIFIED).map(str::to_string),
            accepts_ranges: header_str(headers, header::ACCEPT_RANGES)
                .map(|v| !v.trim().eq_ignore_ascii_case("none")),
        })
    }

    async fn fetch(
        &self,
        url: &Url,
        range: Option<ByteRange>,
    ) -> Result<FetchResponse, TransportError> {
        let mut request = self.client.get(url.clone());
        if let Some(range) = range {
            request = request.header(header::RANGE, range.header_value());
        }

        let response = request.send().await?;
        let status = response.status();
        let content_length = content_length(response.headers());
        let content_range_start =
            header_str(response.headers(), header::CONTENT_RANGE).and_then(parse_content_range_start);

        Ok(FetchResponse {
            status,
            content_length,
            content_range_start,
            body: response.bytes_stream().map_err(TransportError::from).boxed(),
        })
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, header::CONTENT_LENGTH).and_then(|v| v.trim().parse().ok())
}

/// Start offset of a `Content-Range: bytes a-b/n` value.
pub fn parse_content_range_start(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, _total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    start.trim().parse().ok()
}

#[cfg(test)]
pub mod mock {
    //! Scripted in-memory transport for exercising the engine without a network.

    use super::*;
    use std::io;
    use std::sync::Mutex;

    pub struct MockTransport {
        data: Vec<u8>,
        pub honor_ranges: bool,
        pub declare_length: bool,
        pub accepts_ranges: Option<bool>,
        pub probe_status: StatusCode,
        pub chunk_size: usize,
        pub file_name_hint: Option<String>,
        pub etag: Option<String>,
        /// Fail a request whose range starts at `.0` after `.1` bytes of body.
        pub fail_at: Mutex<Vec<(u64, usize)>>,
        /// Report this start in `Content-Range` instead of the real one.
        pub echo_start_override: Option<u64>,
        /// Stream never yields for requests starting here.
        pub stall_at: Option<u64>,
        requests: Mutex<Vec<Option<ByteRange>>>,
    }

    impl MockTransport {
        pub fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                honor_ranges: true,
                declare_length: true,
                accepts_ranges: Some(true),
                probe_status: StatusCode::OK,
                chunk_size: 1000,
                file_name_hint: None,
                etag: Some("\"v1\"".to_string()),
                fail_at: Mutex::new(Vec::new()),
                echo_start_override: None,
                stall_at: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn fail_once_at(&self, start: u64, after: usize) {
            self.fail_at.lock().unwrap().push((start, after));
        }

        pub fn requests(&self) -> Vec<Option<ByteRange>> {
            self.requests.lock().unwrap().clone()
        }
    }

    /// Deterministic, position-dependent payload.
    pub fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn probe(&self, _url: &Url) -> Result<ProbeResponse, TransportError> {
            Ok(ProbeResponse {
                status: self.probe_status,
                content_length: self.declare_length.then_some(self.data.len() as u64),
                file_name_hint: self.file_name_hint.clone(),
                etag: self.etag.clone(),
                last_modified: None,
                accepts_ranges: self.accepts_ranges,
            })
        }

        async fn fetch(
            &self,
            _url: &Url,
            range: Option<ByteRange>,
        ) -> Result<FetchResponse, TransportError> {
            self.requests.lock().unwrap().push(range);

            let (status, body, range_start) = match range {
                Some(r) if self.honor_ranges => {
                    let end = (r.end as usize + 1).min(self.data.len());
                    let body = self.data[r.start as usize..end].to_vec();
                    (StatusCode::PARTIAL_CONTENT, body, Some(r.start))
                }
                _ => (StatusCode::OK, self.data.clone(), None),
            };

            let request_start = range.map(|r| r.start).unwrap_or(0);
            let failure = {
                let mut fail_at = self.fail_at.lock().unwrap();
                fail_at
                    .iter()
                    .position(|(start, _)| *start == request_start)
                    .map(|pos| fail_at.remove(pos).1)
            };

            let content_length = Some(body.len() as u64);
            let mut items: Vec<Result<Bytes, TransportError>> = Vec::new();
            let limit = failure.unwrap_or(body.len()).min(body.len());
            for chunk in body[..limit].chunks(self.chunk_size.max(1)) {
                items.push(Ok(Bytes::copy_from_slice(chunk)));
            }
            if failure.is_some() {
                items.push(Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ))));
            }

            let body = if self.stall_at == Some(request_start) {
                futures::stream::pending().boxed()
            } else {
                futures::stream::iter(items).boxed()
            };

            Ok(FetchResponse {
                status,
                content_length,
                content_range_start: self.echo_start_override.or(range_start),
                body,
            })
        }
    }
}
