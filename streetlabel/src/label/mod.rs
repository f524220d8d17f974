//! Label acquisition: prompt and key loading, the completion client, the
//! directory-level labeling cycle and the retry loop driving it.

pub mod key_pool;
pub mod openai;
pub mod orchestrator;
pub mod pipeline;
pub mod prompt;
pub mod store;

pub use key_pool::ApiKeyPool;
pub use openai::{CompletionTransport, HttpTransport, ImageLabeler, TransportResponse};
pub use orchestrator::{CycleReport, ImageRecord, LabelJob};
pub use pipeline::{CycleRunner, DoneReason, Pipeline, PipelineSummary, SubprocessRunner};
pub use store::{FailureLog, LabelRecord, LabelStore};
