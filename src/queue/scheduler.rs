use super::OperationQueue;
use crate::worker::BackgroundWorker;
use std::time::Duration;
use tracing::{Level, event};

/// Drains the queue when the earliest pending operation becomes due.
///
/// The worker sleeps until the next `nextRetryTime`, never longer than the
/// poll interval, and is woken early by `enqueue` and `reset_for_retry`.
/// With `failed_retention_ms` configured it also purges old failures.
pub fn spawn_queue_scheduler(queue: OperationQueue) -> BackgroundWorker {
    BackgroundWorker::spawn("queue-scheduler", move |mut stop_rx| async move {
        let retention = queue.config().failed_retention_ms.map(Duration::from_millis);

        loop {
            let wait = queue.time_until_next_due();
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = queue.wakeup().notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }

            if queue.has_due() {
                if let Err(err) = queue.drain().await {
                    event!(Level::WARN, error = %err, "scheduled drain failed");
                }
            }
            if let Some(retention) = retention {
                if let Err(err) = queue.purge_failed(retention) {
                    event!(Level::WARN, error = %err, "failed-operation purge failed");
                }
            }
        }
    })
}
