//! Harvest bibliographic metadata from OAI-PMH v2.0 repositories and,
//! optionally, download the payload files referenced by the records.
//!
//! The public surface is the [`ExtractionManager`] (concurrent job
//! controller) together with the [`RepositoryInterface`] (OAI-PMH verb
//! executor), the [`PayloadCollector`] (transfer-url extraction and
//! retryable download), and the [`Record`]/[`Job`] state types.

pub mod error;
pub mod filter;
pub mod job;
pub mod log;
pub mod manager;
pub mod payload;
pub mod record;
pub mod repository;
pub mod xml;

pub use error::{ExtractorError, Result};
pub use filter::{TransferUrlFilter, TransferUrlFilters};
pub use job::Job;
pub use log::{EventLog, LogEntry, LogLevel};
pub use manager::{
    ExtractionManager, HarvestRequest, JobHook, ProgressCallback, RecordFilter, SharedJob,
    VerboseSink,
};
pub use payload::{PayloadCollector, PayloadCollectorBuilder};
pub use record::{File, Record};
pub use repository::{ListIdentifiersRequest, MetadataFormat, OaiSet, RepositoryInterface};
