pub mod engine;
pub mod frames;
pub mod sink;
pub mod task;
pub mod usage;

pub use engine::{ProxyOp, ProxyRequest, StreamingProxy, error_body, http_status};
pub use sink::{ResponseHead, SinkFrame, SinkHandle};
pub use task::{Task, TaskState, TaskStore};
pub use usage::{UsageEvent, UsageSender, UsageSource, usage_channel};
