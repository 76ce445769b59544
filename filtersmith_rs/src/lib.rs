pub mod combinator;
pub mod config;
pub mod coordinator;
pub mod criteria;
pub mod error;
pub mod external;
pub mod filter;
pub mod producer;
pub mod progress;
pub mod scoring;
pub mod service;
pub mod storage;
pub mod trade;
pub mod transport;
pub mod window;
pub mod worker;

pub use combinator::{Combination, CombinationSpace, WorkItem, count, expand};
pub use config::{Configuration, EngineConfig, RankingWeights, RetryConfig, Settings};
pub use coordinator::{Backend, Collaborators, JobCoordinator, JobOutcome, JobRequest, JobState, JobStatus};
pub use criteria::{Condition, Criterion, CriterionKind, RangeMode};
pub use error::JobError;
pub use filter::{apply_filters, apply_predefined_filters};
pub use scoring::{ScoredResult, StrategyMetrics};
pub use service::{ActiveJob, JobService};
pub use trade::TradeRecord;
pub use transport::{MemoryTransport, Transport};
pub use window::TimeWindow;
