//! Segmented, resumable single-file HTTP(S) transfers.
//!
//! A [`coordinator::Coordinator`] probes the remote object, splits it into
//! byte-range segments fetched concurrently into `<file>.part<N>` files, and
//! merges them in index order once every segment is complete. Interrupted
//! runs leave their segment files behind, and the next run resumes each
//! segment from the bytes already on disk.

pub mod cli;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod display;
pub mod error;
pub mod merger;
pub mod planner;
pub mod progress;
pub mod state;
pub mod transport;
pub mod utils;
pub mod worker;

pub use config::TransferConfig;
pub use coordinator::{Coordinator, TransferFailure, TransferResult, TransferState};
pub use planner::{SegmentDescriptor, TransferPlan};
pub use progress::{Eta, ProgressObserver, ProgressSnapshot};
pub use transport::{HttpTransport, Transport};
