use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::StatusCode;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{SegmentError, TransportError};
use crate::planner::SegmentDescriptor;
use crate::progress::SegmentProgress;
use crate::transport::{ByteRange, FetchResponse, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOutcome {
    pub index: usize,
    /// Bytes reused from a previous run.
    pub resumed_from: u64,
    pub written_this_session: u64,
    /// The segment was thrown away and fetched again from its first byte.
    pub restarted: bool,
}

/// Drives one segment to its terminal length, resuming from whatever its
/// storage file already holds.
pub struct SegmentWorker {
    transport: Arc<dyn Transport>,
    url: Url,
    segment: SegmentDescriptor,
    progress: Arc<SegmentProgress>,
    stall_timeout: Duration,
    cancel: CancellationToken,
    whole_object: bool,
}

impl SegmentWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        url: Url,
        segment: SegmentDescriptor,
        progress: Arc<SegmentProgress>,
        stall_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            url,
            segment,
            progress,
            stall_timeout,
            cancel,
            whole_object: false,
        }
    }

    /// Marks the segment as covering the entire object, so a fresh fetch
    /// is a plain GET without a `Range` header.
    pub fn whole_object(mut self, whole_object: bool) -> Self {
        self.whole_object = whole_object;
        self
    }

    pub async fn run(self) -> Result<SegmentOutcome, SegmentError> {
        let index = self.segment.index;
        let mut already = self.stored_len().await?;
        let mut restarted = false;

        match self.segment.len() {
            Some(len) if already == len => {
                log::debug!("segment {} already complete ({} bytes)", index, len);
                self.progress.record_persisted(len);
                return Ok(SegmentOutcome {
                    index,
                    resumed_from: len,
                    written_this_session: 0,
                    restarted: false,
                });
            }
            Some(len) if already > len => {
                log::warn!(
                    "segment {} storage holds {} bytes but spans {}, discarding",
                    index,
                    already,
                    len
                );
                already = 0;
                restarted = true;
            }
            None if already > 0 => {
                log::debug!("segment {} has no known length, restarting from 0", index);
                already = 0;
                restarted = true;
            }
            _ => {}
        }

        if already > 0 {
            log::info!("segment {} resuming at byte {}", index, self.segment.start + already);
        }
        self.progress.record_persisted(already);

        let range = if already == 0 && self.whole_object {
            None
        } else {
            self.segment.remaining_range(already)
        };
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(self.transfer_error(already, TransportError::Cancelled));
            }
            response = self.transport.fetch(&self.url, range) => {
                response.map_err(|source| self.transfer_error(already, source))?
            }
        };

        // Bytes of the body to drop before the first byte of this segment.
        let mut skip = 0;
        match self.check_response(&response, range, already) {
            Ok(()) => {}
            Err(SegmentError::RangeUnsupported { .. }) => {
                log::warn!(
                    "segment {}: server ignored range {:?}, restarting segment from 0",
                    index,
                    range
                );
                already = 0;
                skip = self.segment.start;
                restarted = true;
            }
            Err(err) => return Err(err),
        }

        let mut file = self.open_storage(restarted || already == 0, already).await?;
        let streamed = self.stream_body(&mut file, response.body, skip, already).await;
        // Flush even on failure so the next attempt sees every byte written so far.
        let flushed = file.flush().await;
        let written = streamed?;
        flushed.map_err(|source| SegmentError::Storage {
            index,
            written,
            source,
        })?;

        if let Some(len) = self.segment.len() {
            if written != len {
                return Err(SegmentError::Incomplete {
                    index,
                    written,
                    expected: len,
                });
            }
        }

        Ok(SegmentOutcome {
            index,
            resumed_from: already,
            written_this_session: written - already,
            restarted,
        })
    }

    async fn stored_len(&self) -> Result<u64, SegmentError> {
        match fs::metadata(&self.segment.path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(source) => Err(SegmentError::Storage {
                index: self.segment.index,
                written: 0,
                source,
            }),
        }
    }

    /// A `206` must start where we asked; anything else in the 2xx range
    /// means the server sent the whole object.
    fn check_response(
        &self,
        response: &FetchResponse,
        range: Option<ByteRange>,
        already: u64,
    ) -> Result<(), SegmentError> {
        let index = self.segment.index;
        if !response.status.is_success() {
            return Err(SegmentError::Status {
                index,
                status: response.status,
            });
        }

        let Some(range) = range else {
            return Ok(());
        };
        if response.status != StatusCode::PARTIAL_CONTENT {
            return Err(SegmentError::RangeUnsupported { index });
        }
        match response.content_range_start {
            Some(start) if start != range.start => Err(self.transfer_error(
                already,
                TransportError::RangeMismatch {
                    requested: range.start,
                    received: Some(start),
                },
            )),
            _ => Ok(()),
        }
    }

    async fn open_storage(&self, truncate: bool, already: u64) -> Result<File, SegmentError> {
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        options
            .open(&self.segment.path)
            .await
            .map_err(|source| SegmentError::Storage {
                index: self.segment.index,
                written: already,
                source,
            })
    }

    /// Appends the body to `file` and returns the segment's length on disk.
    async fn stream_body(
        &self,
        file: &mut File,
        mut body: BoxStream<'static, Result<Bytes, TransportError>>,
        mut skip: u64,
        already: u64,
    ) -> Result<u64, SegmentError> {
        let index = self.segment.index;
        let span = self.segment.len();
        let mut written = already;

        if span == Some(written) {
            return Ok(written);
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(self.transfer_error(written, TransportError::Cancelled));
                }
                next = tokio::time::timeout(self.stall_timeout, body.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Err(self.transfer_error(written, TransportError::Stalled(self.stall_timeout)))
                }
                Ok(None) => break,
                Ok(Some(Err(source))) => return Err(self.transfer_error(written, source)),
                Ok(Some(Ok(chunk))) => chunk,
            };

            let mut data = &chunk[..];
            if skip > 0 {
                let n = skip.min(data.len() as u64) as usize;
                data = &data[n..];
                skip -= n as u64;
            }
            if let Some(span) = span {
                let room = span - written;
                if data.len() as u64 > room {
                    data = &data[..room as usize];
                }
            }

            if !data.is_empty() {
                file.write_all(data)
                    .await
                    .map_err(|source| SegmentError::Storage {
                        index,
                        written,
                        source,
                    })?;
                written += data.len() as u64;
                self.progress.add_session(data.len() as u64);
                self.progress.record_persisted(written);
            }

            if span == Some(written) {
                break;
            }
        }

        Ok(written)
    }

    fn transfer_error(&self, written: u64, source: TransportError) -> SegmentError {
        SegmentError::Transfer {
            index: self.segment.index,
            written,
            source,
        }
    }
}
