//! Append-only state storage: a mutable hot store drained into immutable,
//! step-aligned segment files that are background-merged with doubling spans.

pub mod aggregator;
pub mod config;
pub mod domain;
pub mod error;
pub mod files;
pub mod history;
pub mod hot;
pub mod index;
pub mod inverted;
pub mod merge;
pub mod scheduler;
pub mod segment;
pub mod tasks;
pub mod tmpfs;

pub use aggregator::{Aggregator, AggregatorStatus, DomainKind, LogKind, StepState};
pub use config::EngineConfig;
pub use domain::{BranchMerge, Domain};
pub use error::{Error, Result};
pub use history::{History, HistoryReadout};
pub use inverted::InvertedIndex;
pub use scheduler::{BackgroundTask, Scheduler};
pub use tasks::{CollationTask, MergeTask};
