//! Shared data model for cidgate.
//!
//! Everything in this crate is plain data with serde support. The persisted
//! blobs (endpoint catalogue, health history, cached probe run, retry map)
//! are all built from these types, so field names here are part of the
//! on-disk format and use `camelCase`.

pub mod endpoint;
pub mod file;
pub mod health;
pub mod probe;
pub mod warm;

pub use endpoint::{Endpoint, EndpointDescriptor, EndpointOrigin, EndpointStatus, Region};
pub use file::{FilePatch, FileRecord, VerifyRetryEntry, VerifyStatus};
pub use health::{HealthRecord, NEUTRAL_HEALTH_SCORE, RELIABILITY_WINDOW};
pub use probe::{ErrorType, ProbeResult, ProbeRun, RunSummary};
pub use warm::{WarmResult, WarmSummary};
