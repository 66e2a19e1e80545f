use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::{MergeError, SegmentError, TransferError};
use crate::merger;
use crate::planner::{Planner, TransferPlan};
use crate::progress::{ProgressAggregator, ProgressObserver, SegmentProgress};
use crate::state;
use crate::transport::Transport;
use crate::worker::SegmentWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Planning,
    Downloading,
    Merging,
    Done,
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Planning => "planning",
            TransferState::Downloading => "downloading",
            TransferState::Merging => "merging",
            TransferState::Done => "done",
            TransferState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
#[error("transfer failed while {state}: {cause}")]
pub struct TransferFailure {
    /// State the transfer was in when it failed.
    pub state: TransferState,
    pub failed_segments: BTreeSet<usize>,
    #[source]
    pub cause: TransferError,
}

#[derive(Debug)]
pub enum TransferResult {
    Completed {
        output_path: PathBuf,
        /// The destination already existed and nothing was fetched.
        skipped: bool,
    },
    Failed(TransferFailure),
}

impl TransferResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, TransferResult::Completed { .. })
    }

    pub fn into_result(self) -> Result<PathBuf, TransferFailure> {
        match self {
            TransferResult::Completed { output_path, .. } => Ok(output_path),
            TransferResult::Failed(failure) => Err(failure),
        }
    }
}

/// Runs one transfer through Planning, Downloading and Merging.
pub struct Coordinator {
    transport: Arc<dyn Transport>,
    config: TransferConfig,
    observer: Arc<dyn ProgressObserver>,
    cancel: CancellationToken,
    state: TransferState,
}

impl Coordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: TransferConfig,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            transport,
            config,
            observer,
            cancel: CancellationToken::new(),
            state: TransferState::Planning,
        }
    }

    /// Cancelling the token stops in-flight segment reads; their data stays on disk.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub async fn run(&mut self, source_url: &str, output_dir: &Path) -> TransferResult {
        let result = self.drive(source_url, output_dir).await;
        let result = match result {
            Ok((output_path, skipped)) => {
                self.state = TransferState::Done;
                TransferResult::Completed {
                    output_path,
                    skipped,
                }
            }
            Err(failure) => {
                log::error!("{}", failure);
                self.state = TransferState::Failed;
                TransferResult::Failed(failure)
            }
        };
        self.observer.on_finish(&result);
        result
    }

    async fn drive(&mut self, source_url: &str, output_dir: &Path) -> Result<(PathBuf, bool), TransferFailure> {
        self.state = TransferState::Planning;
        let plan = Planner::new(self.transport.as_ref(), &self.config)
            .plan(source_url, output_dir)
            .await
            .map_err(|e| self.fail(BTreeSet::new(), e.into()))?;

        let destination = plan.output_path();
        let exists = fs::metadata(&destination)
            .await
            .map(|metadata| metadata.is_file())
            .unwrap_or(false);
        if !self.config.force && exists {
            log::info!("{} already exists, skipping", destination.display());
            return Ok((destination, true));
        }

        state::reconcile(&plan).await.map_err(|source| {
            self.fail(
                BTreeSet::new(),
                TransferError::ResumeRecord {
                    path: state::ResumeRecord::path_for(&plan.output_dir, &plan.file_name),
                    source,
                },
            )
        })?;
        self.observer.on_plan(&plan);

        self.state = TransferState::Downloading;
        self.download(&plan).await?;

        self.state = TransferState::Merging;
        self.verify_segments(&plan).await?;
        log::info!("merging {} segment(s) into {}", plan.segment_count(), destination.display());
        let output_path = merger::merge(&plan)
            .await
            .map_err(|e| self.fail(BTreeSet::new(), e.into()))?;
        if let Err(e) = state::clear(&plan).await {
            log::warn!("could not remove resume record: {}", e);
        }
        log::info!("download complete: {}", output_path.display());

        Ok((output_path, false))
    }

    /// Spawns every segment worker plus the aggregator and waits for all
    /// workers to finish, whatever their outcome.
    async fn download(&self, plan: &TransferPlan) -> Result<(), TransferFailure> {
        let progress: Vec<Arc<SegmentProgress>> = plan
            .segments
            .iter()
            .map(|s| Arc::new(SegmentProgress::new(s.index, s.len())))
            .collect();

        let stop = CancellationToken::new();
        let aggregator = ProgressAggregator::new(
            plan,
            progress.clone(),
            self.config.sample_interval(),
            self.config.report_interval(),
            self.observer.clone(),
        )
        .spawn(stop.clone());

        let whole_object = plan.total_size.is_some() && plan.segment_count() == 1;
        let mut handles = vec![];
        for (segment, progress) in plan.segments.iter().zip(&progress) {
            let worker = SegmentWorker::new(
                self.transport.clone(),
                plan.source_url.clone(),
                segment.clone(),
                progress.clone(),
                self.config.stall_timeout(),
                self.cancel.clone(),
            )
            .whole_object(whole_object);
            handles.push((segment.index, tokio::spawn(worker.run())));
        }

        let mut errors: Vec<SegmentError> = vec![];
        for (index, handle) in handles {
            match handle.await {
                Ok(Ok(outcome)) => {
                    log::debug!(
                        "segment {} finished ({} bytes this session{})",
                        outcome.index,
                        outcome.written_this_session,
                        if outcome.restarted { ", restarted" } else { "" }
                    );
                }
                Ok(Err(err)) => {
                    log::error!("{}", err);
                    errors.push(err);
                }
                Err(join_error) => {
                    let err = SegmentError::Aborted {
                        index,
                        reason: join_error.to_string(),
                    };
                    log::error!("{}", err);
                    errors.push(err);
                }
            }
        }

        stop.cancel();
        if let Err(e) = aggregator.await {
            log::warn!("progress aggregator ended abnormally: {}", e);
        }

        if errors.is_empty() {
            return Ok(());
        }
        let failed: BTreeSet<usize> = errors.iter().map(SegmentError::index).collect();
        // Handles were joined in index order, so the first error is the lowest index.
        let cause = errors.remove(0);
        Err(self.fail(failed, cause.into()))
    }

    /// Every segment must hold exactly its span before it can be merged.
    async fn verify_segments(&self, plan: &TransferPlan) -> Result<(), TransferFailure> {
        for segment in &plan.segments {
            let Some(expected) = segment.len() else { continue };
            let written = match fs::metadata(&segment.path).await {
                Ok(metadata) => metadata.len(),
                Err(_) => {
                    let err = MergeError::MissingSegment {
                        index: segment.index,
                        path: segment.path.clone(),
                    };
                    return Err(self.fail(BTreeSet::from([segment.index]), err.into()));
                }
            };
            if written != expected {
                let err = SegmentError::Incomplete {
                    index: segment.index,
                    written,
                    expected,
                };
                return Err(self.fail(BTreeSet::from([segment.index]), err.into()));
            }
        }
        Ok(())
    }

    fn fail(&self, failed_segments: BTreeSet<usize>, cause: TransferError) -> TransferFailure {
        TransferFailure {
            state: self.state,
            failed_segments,
            cause,
        }
    }
}
