/// Worker pool builder.
pub mod builder;
/// Handler trait, registry and per-job context.
pub mod handler;
/// Worker pool supervisor and shutdown signaling.
pub mod supervisor;
/// Worker configuration.
pub mod worker;

pub use builder::WorkerPoolBuilder;
pub use handler::{handler_fn, FnHandler, HandlerRegistry, JobContext, JobHandler};
pub use supervisor::{ShutdownToken, WorkerPool};
pub use worker::WorkerConfig;
