//! Domain models for jobs, endpoints, runs, and planner sessions.

mod endpoint;
mod job;
mod run;
mod session;

pub use endpoint::{
    far_future, AfterRun, AiHint, Baseline, EndpointCounts, EndpointPatch, HttpMethod, JobEndpoint,
    CRON_BACKOFF_BASE_MS, DEFAULT_TIMEOUT_MS, MAX_FAILURE_COUNT, MAX_TIMEOUT_MS,
};
pub use job::{Job, JobPatch, JobStatus};
pub use run::{Run, RunSource, RunStatus};
pub use session::{AnalysisSession, ToolCall};
