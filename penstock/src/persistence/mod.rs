/// In-process backend used when the durable store is unreachable.
pub mod memory;

#[cfg(feature = "postgres")]
/// PostgreSQL backend, shared across processes and durable across restarts.
pub mod postgres;

pub use memory::MemoryBackend;
#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;
