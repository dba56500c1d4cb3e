pub mod job;
pub mod summary;

pub use job::{BackoffStrategy, ClaimedJob, FailOutcome, JobPayload, QueueDepth, RetryPolicy};
pub use summary::{
    DateRange, NewSummary, RecordPatch, SummaryFields, SummaryKind, SummaryRecord, SummaryStatus,
    MAX_ERROR_MESSAGE_CHARS,
};
