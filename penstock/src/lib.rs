//! Penstock - background job queue with a durable or in-process backend.
//!
//! Producers enqueue typed work and get an id back immediately; a bounded
//! worker pool claims jobs, runs the registered handler, and records the
//! outcome. Failures are classified as transient or permanent, and transient
//! ones are retried with exponential backoff.
//!
//! # Core Concepts
//!
//! - **Job**: A [`JobRecord`] identified by a [`JobId`], carrying a job type,
//!   a JSON payload, status, progress and attempt counters.
//!
//! - **Backend**: The [`QueueBackend`] trait stores records. [`PostgresBackend`]
//!   (feature `postgres`) is durable; [`MemoryBackend`] is the in-process
//!   fallback chosen when the database cannot be reached at startup.
//!
//! - **Queue**: [`QueueService`] is the facade producers and status readers use:
//!   enqueue, status lookup, bundle aggregation, and retention.
//!
//! - **Runtime**: [`WorkerPool`] runs handlers from a [`HandlerRegistry`] with a
//!   fixed concurrency limit, applying the [`RetryPolicy`] to failures.
//!
//! - **Events**: Every lifecycle change is broadcast as a [`JobEvent`] on the
//!   [`InProcEventBus`].
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence support via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use penstock::*;
//! use serde_json::json;
//!
//! let queue = QueueService::connect(QueueConfig::from_env()?).await;
//! let pool = WorkerPoolBuilder::new(WorkerConfig::new("journal"))
//!     .with_queue(&queue)
//!     .register("echo", handler_fn(|ctx: JobContext| async move {
//!         let text = ctx.payload["text"].as_str().unwrap_or_default().to_uppercase();
//!         Ok(json!({ "echoed": text }))
//!     }))
//!     .build()?;
//! pool.start().await?;
//!
//! let id = queue.enqueue("echo", json!({"text": "hello"}), EnqueueOptions::default()).await?;
//! ```

/// Bundle status aggregation.
///
/// [`aggregate`] folds the jobs sharing a [`BundleId`] into one
/// [`BundleStatus`] with an overall progress and a [`BundleState`].
pub mod bundle;

/// Contracts for services handlers call out to.
///
/// [`CompletionService`], [`Storage`] and [`NotificationChannel`], plus
/// [`InMemoryStorage`] for tests and demos.
pub mod collaborators;

/// Configuration structures for queue and persistence settings.
///
/// The `config` module defines configuration types like [`PersistenceConfig`]
/// and [`QueueConfig`] for tuning system behavior.
pub mod config;

/// Handler error classification.
///
/// [`HandlerError`] separates transient failures, which are retried, from
/// permanent ones, which fail the job immediately.
pub mod error;

/// Event publishing and subscription system.
///
/// The `events` module provides:
/// - [`JobEvent`] and [`JobEventKind`] for lifecycle notifications
/// - [`JobEventPublisher`] for pub/sub
/// - [`InProcEventBus`] for in-process event broadcasting
/// - background tasks that log events or forward them to a [`NotificationChannel`]
pub mod events;

/// Core job definitions.
///
/// The `job` module defines:
/// - [`JobId`] - unique job identifier
/// - [`BundleId`] - groups related jobs
/// - [`JobStatus`] - job lifecycle states
/// - [`JobRecord`] - the stored job
/// - [`EnqueueOptions`] - per-job overrides at enqueue time
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Queue backends.
///
/// [`MemoryBackend`] is always available; [`PostgresBackend`] requires the
/// `postgres` feature.
pub mod persistence;

/// Startup backend selection.
pub mod probe;

/// The backend trait and queue snapshots.
///
/// The `queue` module defines the [`QueueBackend`] trait implemented by every
/// backend and [`QueueSnapshot`] for monitoring queue depth.
pub mod queue;

/// Retry decisions and backoff.
pub mod retry;

/// Worker pool and handler execution.
///
/// The `runtime` module provides:
/// - [`WorkerPool`] - claims jobs and runs handlers
/// - [`WorkerPoolBuilder`] - validated construction
/// - [`HandlerRegistry`], [`JobHandler`] and [`JobContext`]
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`WorkerConfig`] - pool configuration
pub mod runtime;

/// The queue facade.
pub mod service;

/// Tracing spans, subscriber setup and metric recording helpers.
pub mod telemetry;

pub use bundle::*;
pub use collaborators::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use job::*;
pub use persistence::MemoryBackend;
#[cfg(feature = "postgres")]
pub use persistence::PostgresBackend;
pub use probe::*;
pub use queue::*;
pub use retry::*;
pub use runtime::*;
pub use service::*;
