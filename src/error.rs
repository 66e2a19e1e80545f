use std::io;
use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// Failures raised by a [`crate::transport::Transport`] implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error("no data received for {0:?}")]
    Stalled(std::time::Duration),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("unexpected content range: requested start {requested}, server sent {received:?}")]
    RangeMismatch { requested: u64, received: Option<u64> },
}

#[derive(Error, Debug)]
pub enum PlanningError {
    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("metadata probe failed: {0}")]
    Probe(#[source] TransportError),

    #[error("server answered metadata probe with {0}")]
    Status(StatusCode),
}

/// Outcome of a single segment that did not reach its terminal length.
#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("segment {index}: server ignored the range request")]
    RangeUnsupported { index: usize },

    #[error("segment {index}: transfer interrupted after {written} bytes: {source}")]
    Transfer {
        index: usize,
        written: u64,
        #[source]
        source: TransportError,
    },

    #[error("segment {index}: storage error after {written} bytes: {source}")]
    Storage {
        index: usize,
        written: u64,
        #[source]
        source: io::Error,
    },

    #[error("segment {index}: server answered with {status}")]
    Status { index: usize, status: StatusCode },

    #[error("segment {index}: stream ended after {written} of {expected} bytes")]
    Incomplete {
        index: usize,
        written: u64,
        expected: u64,
    },

    #[error("segment {index}: worker task aborted: {reason}")]
    Aborted { index: usize, reason: String },
}

impl SegmentError {
    pub fn index(&self) -> usize {
        match self {
            SegmentError::RangeUnsupported { index }
            | SegmentError::Transfer { index, .. }
            | SegmentError::Storage { index, .. }
            | SegmentError::Status { index, .. }
            | SegmentError::Incomplete { index, .. }
            | SegmentError::Aborted { index, .. } => *index,
        }
    }

    /// Bytes of the segment persisted on disk when the error surfaced, if known.
    pub fn written(&self) -> Option<u64> {
        match self {
            SegmentError::Transfer { written, .. }
            | SegmentError::Storage { written, .. }
            | SegmentError::Incomplete { written, .. } => Some(*written),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SegmentError::Transfer {
                source: TransportError::Cancelled,
                ..
            }
        )
    }
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("segment {index} storage missing: {}", path.display())]
    MissingSegment { index: usize, path: PathBuf },

    #[error("merge I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Umbrella error carried by a failed transfer.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("resume record error on {}: {source}", path.display())]
    ResumeRecord {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_error_accessors() {
        let err = SegmentError::Transfer {
            index: 2,
            written: 4096,
            source: TransportError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        };
        assert_eq!(err.index(), 2);
        assert_eq!(err.written(), Some(4096));
        assert!(!err.is_cancelled());

        let err = SegmentError::RangeUnsupported { index: 1 };
        assert_eq!(err.index(), 1);
        assert_eq!(err.written(), None);
    }

    #[test]
    fn test_cancelled_detection() {
        let err = SegmentError::Transfer {
            index: 0,
            written: 10,
            source: TransportError::Cancelled,
        };
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_transfer_error_is_transparent() {
        let err: TransferError = SegmentError::Incomplete {
            index: 3,
            written: 5,
            expected: 10,
        }
        .into();
        assert_eq!(err.to_string(), "segment 3: stream ended after 5 of 10 bytes");
    }
}
