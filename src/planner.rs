use std::path::{Path, PathBuf};
use url::Url;

use crate::config::TransferConfig;
use crate::error::PlanningError;
use crate::transport::{ByteRange, Transport};
use crate::utils::{fallback_filename, get_filename_from_url, segment_path, usable_filename};

/// One contiguous slice of the remote object and the file that stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub index: usize,
    pub start: u64,
    /// Inclusive. `None` when the object length is unknown and the segment
    /// runs to the end of the stream.
    pub end: Option<u64>,
    pub path: PathBuf,
}

impl SegmentDescriptor {
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    /// Range still missing once `already` bytes are on disk.
    pub fn remaining_range(&self, already: u64) -> Option<ByteRange> {
        self.end.map(|end| ByteRange::new(self.start + already, end))
    }
}

#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub source_url: Url,
    pub file_name: String,
    pub total_size: Option<u64>,
    /// ETag if the server sent one, otherwise Last-Modified.
    pub validator: Option<String>,
    pub output_dir: PathBuf,
    pub segments: Vec<SegmentDescriptor>,
}

impl TransferPlan {
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.file_name)
    }
}

pub struct Planner<'a> {
    transport: &'a dyn Transport,
    config: &'a TransferConfig,
}

impl<'a> Planner<'a> {
    pub fn new(transport: &'a dyn Transport, config: &'a TransferConfig) -> Self {
        Self { transport, config }
    }

    pub async fn plan(&self, source_url: &str, output_dir: &Path) -> Result<TransferPlan, PlanningError> {
        let url = Url::parse(source_url).map_err(|source| PlanningError::InvalidUrl {
            url: source_url.to_string(),
            source,
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PlanningError::UnsupportedScheme(url.scheme().to_string()));
        }

        let probe = self.transport.probe(&url).await.map_err(PlanningError::Probe)?;
        if !probe.status.is_success() {
            return Err(PlanningError::Status(probe.status));
        }

        let file_name = probe
            .file_name_hint
            .as_deref()
            .and_then(usable_filename)
            .or_else(|| usable_filename(&get_filename_from_url(&url)))
            .unwrap_or_else(|| fallback_filename(&url));

        let segment_count = match probe.content_length {
            Some(size) if size >= self.config.min_segmented_size && probe.accepts_ranges != Some(false) => {
                self.config.segment_count
            }
            _ => 1,
        };

        let segments = partition(probe.content_length, segment_count)
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| SegmentDescriptor {
                index,
                start,
                end,
                path: segment_path(output_dir, &file_name, index),
            })
            .collect::<Vec<_>>();

        log::info!(
            "planned {} -> {} ({} bytes, {} segment(s))",
            url,
            file_name,
            probe.content_length.map_or_else(|| "unknown".to_string(), |s| s.to_string()),
            segments.len()
        );

        Ok(TransferPlan {
            source_url: url,
            file_name,
            total_size: probe.content_length,
            validator: probe.etag.or(probe.last_modified),
            output_dir: output_dir.to_path_buf(),
            segments,
        })
    }
}

/// Splits `[0, total_size)` into `segment_count` contiguous ranges.
///
/// All ranges but the last have length `total_size / segment_count`; the last
/// takes the remainder. The count shrinks so that no range is empty, a zero
/// length object has no ranges at all, and an unknown length yields a single
/// unbounded range.
pub fn partition(total_size: Option<u64>, segment_count: usize) -> Vec<(u64, Option<u64>)> {
    let Some(total_size) = total_size else {
        return vec![(0, None)];
    };
    if total_size == 0 {
        return Vec::new();
    }

    let count = (segment_count.max(1) as u64).min(total_size);
    let part_size = total_size / count;

    (0..count)
        .map(|i| {
            let start = i * part_size;
            let end = if i == count - 1 {
                total_size - 1
            } else {
                (i + 1) * part_size - 1
            };
            (start, Some(end))
        })
        .collect()
}
