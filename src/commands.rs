use anyhow::{bail, Context, Result};
use indicatif::HumanBytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

use crate::config::TransferConfig;
use crate::coordinator::{Coordinator, TransferResult};
use crate::display::ProgressDisplay;
use crate::state::ResumeRecord;
use crate::transport::HttpTransport;
use crate::utils::segment_path;

pub async fn run_single_download(url: String, output: PathBuf, config: TransferConfig) -> Result<PathBuf> {
    if !output.exists() {
        fs::create_dir_all(&output)
            .await
            .context("Failed to create output directory")?;
    }

    let transport = HttpTransport::new(&config).context("Failed to build HTTP client")?;
    let mut coordinator = Coordinator::new(Arc::new(transport), config, Arc::new(ProgressDisplay::new()));

    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupted, stopping segments; partial data is kept for resume");
            cancel.cancel();
        }
    });

    match coordinator.run(&url, &output).await {
        TransferResult::Completed { output_path, .. } => Ok(output_path),
        TransferResult::Failed(failure) => {
            let message = if failure.failed_segments.is_empty() {
                format!("Failed to download {}", url)
            } else {
                format!("Failed to download {} (segments {:?})", url, failure.failed_segments)
            };
            Err(anyhow::Error::new(failure).context(message))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingDownload {
    pub file_name: String,
    pub downloaded: u64,
    pub total_size: u64,
    pub segment_count: usize,
}

impl PendingDownload {
    pub fn percent(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.downloaded as f64 / self.total_size as f64) * 100.0
    }
}

/// Reads every resume record in `output` and measures the segments on disk.
pub async fn scan_pending(output: &Path) -> Result<Vec<PendingDownload>> {
    let mut pending = vec![];
    let mut entries = fs::read_dir(output)
        .await
        .with_context(|| format!("Failed to read {:?}", output))?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(file_name) = name.strip_suffix(".parts.json") else {
            continue;
        };
        let Some(record) = ResumeRecord::load(&entry.path()).await? else {
            continue;
        };

        let mut downloaded = 0;
        for index in 0..record.segment_count {
            if let Ok(metadata) = fs::metadata(segment_path(output, file_name, index)).await {
                downloaded += metadata.len();
            }
        }
        pending.push(PendingDownload {
            file_name: file_name.to_string(),
            downloaded: downloaded.min(record.total_size),
            total_size: record.total_size,
            segment_count: record.segment_count,
        });
    }

    pending.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(pending)
}

pub async fn list_downloads(output: PathBuf) -> Result<()> {
    if !output.exists() {
        bail!("Output directory {:?} does not exist", output);
    }

    let pending = scan_pending(&output).await?;
    if pending.is_empty() {
        println!("No unfinished downloads found in {:?}.", output);
        return Ok(());
    }

    println!("{:<50} {:<10} {:<15} {:<15}", "Filename", "Segments", "Progress", "Size");
    println!("{:-<50} {:-<10} {:-<15} {:-<15}", "", "", "", "");
    for item in &pending {
        println!(
            "{:<50} {:<10} {:<15} {:<15}",
            item.file_name,
            item.segment_count,
            format!("{:.2}%", item.percent()),
            format!("{} / {}", HumanBytes(item.downloaded), HumanBytes(item.total_size))
        );
    }

    Ok(())
}
