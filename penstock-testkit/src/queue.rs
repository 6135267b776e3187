use penstock::*;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Queue config with near-zero retry delays.
pub fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        retry: RetryPolicy::immediate(),
        ..QueueConfig::default()
    }
}

/// Worker config polling every 10ms.
pub fn fast_worker_config(concurrency: usize) -> WorkerConfig {
    WorkerConfig::new("testkit")
        .with_concurrency(concurrency)
        .with_poll_interval(10)
        .with_shutdown_timeout(5_000)
}

/// In-process queue service using [`fast_queue_config`].
pub fn in_process_queue() -> QueueService {
    QueueService::in_process(fast_queue_config())
}

/// Poll until the job reaches `status`, or fail the test after `within`.
pub async fn wait_for_status(
    queue: &QueueService,
    id: JobId,
    status: JobStatus,
    within: Duration,
) -> JobRecord {
    let found = timeout(within, async {
        loop {
            if let Ok(Some(record)) = queue.get_status(id).await {
                if record.status == status {
                    return record;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    match found {
        Ok(record) => record,
        Err(_) => {
            let last = queue.get_status(id).await.ok().flatten();
            panic!("job {id} did not reach {status} within {within:?}; last seen: {last:?}");
        }
    }
}

/// Poll until the job is `completed` or `failed`.
pub async fn wait_for_terminal(queue: &QueueService, id: JobId, within: Duration) -> JobRecord {
    let found = timeout(within, async {
        loop {
            if let Ok(Some(record)) = queue.get_status(id).await {
                if record.is_terminal() {
                    return record;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    match found {
        Ok(record) => record,
        Err(_) => panic!("job {id} did not finish within {within:?}"),
    }
}

/// Wait for every id to finish, in order.
pub async fn wait_for_all_terminal(
    queue: &QueueService,
    ids: &[JobId],
    within: Duration,
) -> Vec<JobRecord> {
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        records.push(wait_for_terminal(queue, *id, within).await);
    }
    records
}
