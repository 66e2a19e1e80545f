use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};

use crate::error::MergeError;
use crate::planner::TransferPlan;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> MergeError + '_ {
    move |source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Concatenates the plan's segments, in index order, into its output path.
///
/// Data is assembled in `<file>.merging` and renamed into place only once every
/// segment has been copied, so a failed merge never leaves something that looks
/// like a finished download. Segment files are removed only after the rename;
/// on failure they stay on disk and the merge can be retried.
pub async fn merge(plan: &TransferPlan) -> Result<PathBuf, MergeError> {
    let destination = plan.output_path();

    // Open everything up front so a missing segment fails before any output exists.
    let mut sources = Vec::with_capacity(plan.segments.len());
    for segment in &plan.segments {
        match File::open(&segment.path).await {
            Ok(file) => sources.push(file),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(MergeError::MissingSegment {
                    index: segment.index,
                    path: segment.path.clone(),
                })
            }
            Err(e) => return Err(io_error(&segment.path)(e)),
        }
    }

    if let [segment] = plan.segments.as_slice() {
        drop(sources);
        fs::rename(&segment.path, &destination)
            .await
            .map_err(io_error(&destination))?;
        return Ok(destination);
    }

    let staging = staging_path(&destination);
    let paths: Vec<&Path> = plan.segments.iter().map(|s| s.path.as_path()).collect();
    if let Err(err) = concat(sources, &paths, &staging).await {
        let _ = fs::remove_file(&staging).await;
        return Err(err);
    }

    fs::rename(&staging, &destination)
        .await
        .map_err(io_error(&destination))?;

    for segment in &plan.segments {
        if let Err(e) = fs::remove_file(&segment.path).await {
            log::warn!("could not remove {}: {}", segment.path.display(), e);
        }
    }

    Ok(destination)
}

async fn concat(sources: Vec<File>, paths: &[&Path], staging: &Path) -> Result<(), MergeError> {
    let output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(staging)
        .await
        .map_err(io_error(staging))?;
    let mut writer = BufWriter::new(output);

    for (source, path) in sources.into_iter().zip(paths) {
        let mut reader = BufReader::new(source);
        tokio::io::copy_buf(&mut reader, &mut writer)
            .await
            .map_err(io_error(path))?;
    }

    writer.flush().await.map_err(io_error(staging))?;
    writer.get_mut().sync_all().await.map_err(io_error(staging))?;
    Ok(())
}

fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".merging");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{partition, SegmentDescriptor};
    use crate::transport::mock::payload;
    use crate::utils::segment_path;

    fn plan_in(dir: &Path, total: u64, count: usize) -> TransferPlan {
        let segments = partition(Some(total), count)
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| SegmentDescriptor {
                index,
                start,
                end,
                path: segment_path(dir, "object.bin", index),
            })
            .collect();
        TransferPlan {
            source_url: url::Url::parse("https://example.com/object.bin").unwrap(),
            file_name: "object.bin".to_string(),
            total_size: Some(total),
            validator: None,
            output_dir: dir.to_path_buf(),
            segments,
        }
    }

    fn write_segments(plan: &TransferPlan, data: &[u8]) {
        for segment in &plan.segments {
            let end = segment.end.unwrap() as usize;
            std::fs::write(&segment.path, &data[segment.start as usize..=end]).unwrap();
        }
    }

    #[tokio::test]
    async fn test_merge_matches_unsegmented_bytes() {
        let data = payload(10_007);
        for count in [1usize, 2, 3, 4, 7] {
            let dir = tempfile::tempdir().unwrap();
            let plan = plan_in(dir.path(), data.len() as u64, count);
            write_segments(&plan, &data);

            let output = merge(&plan).await.unwrap();
            assert_eq!(output, dir.path().join("object.bin"));
            assert_eq!(std::fs::read(&output).unwrap(), data, "segment count {count}");
            for segment in &plan.segments {
                assert!(!segment.path.exists());
            }
            assert!(!staging_path(&output).exists());
        }
    }

    #[tokio::test]
    async fn test_merge_missing_segment_preserves_others() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(4_000);
        let plan = plan_in(dir.path(), 4_000, 4);
        write_segments(&plan, &data);
        std::fs::remove_file(&plan.segments[2].path).unwrap();

        let err = merge(&plan).await.unwrap_err();
        assert!(matches!(err, MergeError::MissingSegment { index: 2, .. }));

        assert!(!plan.output_path().exists());
        assert!(!staging_path(&plan.output_path()).exists());
        for i in [0, 1, 3] {
            assert!(plan.segments[i].path.exists());
        }
    }

    #[tokio::test]
    async fn test_merge_zero_segments_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_in(dir.path(), 0, 4);
        assert!(plan.segments.is_empty());

        let output = merge(&plan).await.unwrap();
        assert_eq!(std::fs::metadata(output).unwrap().len(), 0);
    }
}
