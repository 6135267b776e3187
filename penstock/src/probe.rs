//! Startup selection between the durable and the in-process backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::persistence::MemoryBackend;
use crate::queue::{BackendKind, QueueBackend};

/// Opens a connection to a durable backend.
#[async_trait]
pub trait DurableConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn QueueBackend>>;

    /// Human-readable target for logs. Must not include credentials.
    fn describe(&self) -> String;
}

/// Connects to PostgreSQL using a [`PersistenceConfig`](crate::config::PersistenceConfig).
#[cfg(feature = "postgres")]
#[derive(Clone, Debug)]
pub struct PostgresConnector {
    config: crate::config::PersistenceConfig,
}

#[cfg(feature = "postgres")]
impl PostgresConnector {
    pub fn new(config: crate::config::PersistenceConfig) -> Self {
        Self { config }
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl DurableConnector for PostgresConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn QueueBackend>> {
        let backend = crate::persistence::PostgresBackend::connect(&self.config).await?;
        Ok(Arc::new(backend))
    }

    fn describe(&self) -> String {
        redact_url(&self.config.connection_string)
    }
}

/// Backend chosen at startup.
#[derive(Clone)]
pub struct BackendSelection {
    pub backend: Arc<dyn QueueBackend>,
    pub kind: BackendKind,
    /// Why the durable backend was not used, when it wasn't.
    pub degraded_reason: Option<String>,
}

impl std::fmt::Debug for BackendSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSelection")
            .field("kind", &self.kind)
            .field("degraded_reason", &self.degraded_reason)
            .finish()
    }
}

impl BackendSelection {
    pub fn is_degraded(&self) -> bool {
        self.kind == BackendKind::Fallback
    }

    fn fallback(reason: String) -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            kind: BackendKind::Fallback,
            degraded_reason: Some(reason),
        }
    }
}

/// Try the durable backend once, bounded by `timeout`; fall back to memory.
///
/// Never fails. Falling back is logged at `warn` with the reason.
pub async fn probe_backend(
    connector: Option<&dyn DurableConnector>,
    timeout: Duration,
) -> BackendSelection {
    let Some(connector) = connector else {
        tracing::warn!(
            "no durable backend configured; running on the in-process queue, jobs will not survive a restart"
        );
        return BackendSelection::fallback("no durable backend configured".to_string());
    };

    let target = connector.describe();
    match tokio::time::timeout(timeout, connector.connect()).await {
        Ok(Ok(backend)) => {
            tracing::info!(backend = %target, "connected to durable queue backend");
            let kind = backend.kind();
            BackendSelection {
                backend,
                kind,
                degraded_reason: None,
            }
        }
        Ok(Err(err)) => {
            let reason = format!("durable backend unreachable: {err:#}");
            tracing::warn!(
                backend = %target,
                "{reason}; running in degraded mode on the in-process queue"
            );
            BackendSelection::fallback(reason)
        }
        Err(_) => {
            let reason = format!(
                "durable backend did not answer within {}ms",
                timeout.as_millis()
            );
            tracing::warn!(
                backend = %target,
                "{reason}; running in degraded mode on the in-process queue"
            );
            BackendSelection::fallback(reason)
        }
    }
}

/// Strip the password from a connection URL.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => url.to_string(),
    }
}
