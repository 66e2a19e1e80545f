use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordinator::TransferResult;
use crate::planner::TransferPlan;

/// Per-segment counters. Written by one worker, read by the aggregator.
#[derive(Debug)]
pub struct SegmentProgress {
    index: usize,
    span: Option<u64>,
    /// Bytes written during this run.
    session: AtomicU64,
    /// Highest length the segment's storage has reached.
    persisted: AtomicU64,
}

impl SegmentProgress {
    pub fn new(index: usize, span: Option<u64>) -> Self {
        Self {
            index,
            span,
            session: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn add_session(&self, n: u64) {
        self.session.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, len: u64) {
        let len = self.span.map_or(len, |span| len.min(span));
        self.persisted.fetch_max(len, Ordering::Relaxed);
    }

    pub fn session(&self) -> u64 {
        self.session.load(Ordering::Relaxed)
    }

    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eta {
    Seconds(u64),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub total_downloaded: u64,
    pub total_size: Option<u64>,
    /// `None` when the object length is unknown.
    pub percent: Option<f64>,
    pub throughput_bytes_per_sec: f64,
    pub eta: Eta,
}

/// Receives progress from a running transfer.
pub trait ProgressObserver: Send + Sync {
    fn on_plan(&self, _plan: &TransferPlan) {}

    fn on_progress(&self, snapshot: &ProgressSnapshot);

    fn on_finish(&self, _result: &TransferResult) {}
}

/// Discards everything.
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}
}

/// Exposes snapshots as a channel stream.
impl ProgressObserver for UnboundedSender<ProgressSnapshot> {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(snapshot.clone());
    }
}

/// Turns successive counter readings into snapshots, throttled to one per
/// `report_interval`. Throughput is measured against the previous report.
#[derive(Debug)]
pub struct ProgressSampler {
    total_size: Option<u64>,
    report_interval: Duration,
    last_report: Instant,
    last_session: u64,
    last_percent: Option<f64>,
}

impl ProgressSampler {
    pub fn new(total_size: Option<u64>, report_interval: Duration, started: Instant) -> Self {
        Self {
            total_size,
            report_interval,
            last_report: started,
            last_session: 0,
            last_percent: None,
        }
    }

    /// `downloaded` is the sum of bytes on disk, `session` the sum of bytes
    /// written this run. Returns `None` until a report is due.
    pub fn sample(&mut self, now: Instant, downloaded: u64, session: u64) -> Option<ProgressSnapshot> {
        let elapsed = now.saturating_duration_since(self.last_report);
        if elapsed < self.report_interval {
            return None;
        }
        self.snapshot(now, downloaded, session)
    }

    /// Like [`sample`](Self::sample) but ignores the throttle.
    pub fn finish(&mut self, now: Instant, downloaded: u64, session: u64) -> Option<ProgressSnapshot> {
        self.snapshot(now, downloaded, session)
    }

    fn snapshot(&mut self, now: Instant, downloaded: u64, session: u64) -> Option<ProgressSnapshot> {
        let elapsed_millis = now.saturating_duration_since(self.last_report).as_millis();
        if elapsed_millis == 0 {
            return None;
        }

        let delta = session.saturating_sub(self.last_session);
        let throughput = delta as f64 / (elapsed_millis as f64 / 1000.0);

        let percent = self.total_size.map(|total| {
            let raw = if total == 0 {
                100.0
            } else {
                (downloaded.min(total) as f64 * 100.0) / total as f64
            };
            // Never report going backwards.
            self.last_percent.map_or(raw, |prev| raw.max(prev))
        });

        let eta = match self.total_size {
            Some(total) if throughput > 0.0 => {
                Eta::Seconds((total.saturating_sub(downloaded) as f64 / throughput).round() as u64)
            }
            _ => Eta::Unknown,
        };

        self.last_report = now;
        self.last_session = session;
        self.last_percent = percent;

        Some(ProgressSnapshot {
            total_downloaded: downloaded,
            total_size: self.total_size,
            percent,
            throughput_bytes_per_sec: throughput,
            eta,
        })
    }
}

/// Periodically folds every segment's counters into a snapshot for the observer.
pub struct ProgressAggregator {
    segments: Vec<Arc<SegmentProgress>>,
    sampler: ProgressSampler,
    sample_interval: Duration,
    observer: Arc<dyn ProgressObserver>,
}

impl ProgressAggregator {
    pub fn new(
        plan: &TransferPlan,
        segments: Vec<Arc<SegmentProgress>>,
        sample_interval: Duration,
        report_interval: Duration,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            segments,
            sampler: ProgressSampler::new(plan.total_size, report_interval, Instant::now()),
            sample_interval,
            observer,
        }
    }

    fn totals(&self) -> (u64, u64) {
        self.segments.iter().fold((0, 0), |(downloaded, session), p| {
            (downloaded + p.persisted(), session + p.session())
        })
    }

    /// Samples until `stop` fires, then emits one final snapshot.
    pub fn spawn(mut self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let (downloaded, session) = self.totals();
                        if let Some(snapshot) = self.sampler.sample(Instant::now(), downloaded, session) {
                            self.observer.on_progress(&snapshot);
                        }
                    }
                }
            }

            let (downloaded, session) = self.totals();
            if let Some(snapshot) = self.sampler.finish(Instant::now(), downloaded, session) {
                self.observer.on_progress(&snapshot);
            }
        })
    }
}
