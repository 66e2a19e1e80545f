use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::planner::TransferPlan;

/// What the segment files in a directory were downloaded against.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResumeRecord {
    pub url: String,
    pub total_size: u64,
    pub segment_count: usize,
    pub validator: Option<String>,
}

impl ResumeRecord {
    /// `None` for plans without a known size; those never resume.
    pub fn from_plan(plan: &TransferPlan) -> Option<Self> {
        Some(Self {
            url: plan.source_url.to_string(),
            total_size: plan.total_size?,
            segment_count: plan.segment_count(),
            validator: plan.validator.clone(),
        })
    }

    pub fn path_for(dir: &Path, file_name: &str) -> PathBuf {
        dir.join(format!("{}.parts.json", file_name))
    }

    pub async fn load(path: &Path) -> std::io::Result<Option<Self>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                log::warn!("ignoring unreadable resume record {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await
    }
}

/// Makes the segment files on disk safe to resume for `plan`.
///
/// Segment boundaries depend on the total size and segment count, and the
/// bytes depend on the remote object's identity, so if any of these changed
/// since the parts were written they are deleted. Returns `true` when stale
/// parts were discarded.
pub async fn reconcile(plan: &TransferPlan) -> std::io::Result<bool> {
    let path = ResumeRecord::path_for(&plan.output_dir, &plan.file_name);
    let current = ResumeRecord::from_plan(plan);
    let previous = ResumeRecord::load(&path).await?;

    let stale = match (&previous, &current) {
        (Some(prev), Some(cur)) => prev != cur,
        (Some(_), None) => true,
        (None, _) => false,
    };

    if stale {
        log::warn!(
            "remote object or segmentation changed since {} was written, discarding partial data",
            path.display()
        );
        discard_parts(&plan.output_dir, &plan.file_name).await?;
    }

    match current {
        Some(record) => record.save(&path).await?,
        None => remove_if_exists(&path).await?,
    }
    Ok(stale)
}

/// Removes the resume record after a successful merge.
pub async fn clear(plan: &TransferPlan) -> std::io::Result<()> {
    remove_if_exists(&ResumeRecord::path_for(&plan.output_dir, &plan.file_name)).await
}

/// Deletes every `<file_name>.part<N>` in `dir`.
async fn discard_parts(dir: &Path, file_name: &str) -> std::io::Result<()> {
    let prefix = format!("{}.part", file_name);
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let is_part = name
            .strip_prefix(&prefix)
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
        if is_part {
            remove_if_exists(&entry.path()).await?;
        }
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{partition, SegmentDescriptor};
    use crate::utils::segment_path;

    fn plan(dir: &Path, total: Option<u64>, count: usize, validator: &str) -> TransferPlan {
        let segments = partition(total, count)
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| SegmentDescriptor {
                index,
                start,
                end,
                path: segment_path(dir, "image.iso", index),
            })
            .collect();
        TransferPlan {
            source_url: url::Url::parse("https://example.com/image.iso").unwrap(),
            file_name: "image.iso".to_string(),
            total_size: total,
            validator: Some(validator.to_string()),
            output_dir: dir.to_path_buf(),
            segments,
        }
    }

    #[tokio::test]
    async fn test_first_run_writes_record() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), Some(1_000), 4, "\"a\"");

        assert!(!reconcile(&plan).await.unwrap());
        let record = ResumeRecord::load(&ResumeRecord::path_for(dir.path(), "image.iso"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.total_size, 1_000);
        assert_eq!(record.segment_count, 4);
    }

    #[tokio::test]
    async fn test_matching_record_keeps_parts() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), Some(1_000), 4, "\"a\"");
        reconcile(&plan).await.unwrap();
        std::fs::write(&plan.segments[0].path, b"abc").unwrap();

        assert!(!reconcile(&plan).await.unwrap());
        assert!(plan.segments[0].path.exists());
    }

    #[tokio::test]
    async fn test_changed_object_discards_parts() {
        let dir = tempfile::tempdir().unwrap();
        let old = plan(dir.path(), Some(1_000), 4, "\"a\"");
        reconcile(&old).await.unwrap();
        for segment in &old.segments {
            std::fs::write(&segment.path, b"abc").unwrap();
        }
        let unrelated = dir.path().join("image.iso.partial-notes");
        std::fs::write(&unrelated, b"keep").unwrap();

        let new = plan(dir.path(), Some(1_000), 4, "\"b\"");
        assert!(reconcile(&new).await.unwrap());
        for segment in &old.segments {
            assert!(!segment.path.exists());
        }
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_changed_segment_count_discards_parts() {
        let dir = tempfile::tempdir().unwrap();
        let old = plan(dir.path(), Some(1_000), 4, "\"a\"");
        reconcile(&old).await.unwrap();
        std::fs::write(&old.segments[3].path, b"abc").unwrap();

        let new = plan(dir.path(), Some(1_000), 2, "\"a\"");
        assert!(reconcile(&new).await.unwrap());
        assert!(!old.segments[3].path.exists());
    }

    #[tokio::test]
    async fn test_clear_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), Some(10), 1, "x");
        reconcile(&plan).await.unwrap();
        clear(&plan).await.unwrap();
        assert!(!ResumeRecord::path_for(dir.path(), "image.iso").exists());
        clear(&plan).await.unwrap();
    }
}
