//! Concurrent file transfers for one node's run.
//!
//! Each transfer is one storage call retried on its own under the request's
//! [`RetrySpec`]. At most `concurrent_connections` run at a time and the first
//! failure that survives its retries stops the batch.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use tokio::time::Instant;

use crate::errors::BackupError;
use crate::retry::{RetrySpec, retry};
use crate::storage::{StorageError, StorageResult};

/// Paces transfers to an average rate in bytes per second.
#[derive(Debug)]
pub struct Throttle {
    bytes_per_second: u64,
    started: Instant,
    transferred: Mutex<u64>,
}

impl Throttle {
    pub fn new(bytes_per_second: u64) -> Self {
        Throttle {
            bytes_per_second: bytes_per_second.max(1),
            started: Instant::now(),
            transferred: Mutex::new(0),
        }
    }

    /// How long to hold off after `bytes` more have gone through.
    fn pause_after(&self, bytes: u64) -> Duration {
        let total = {
            let mut transferred = self.transferred.lock().unwrap_or_else(|e| e.into_inner());
            *transferred += bytes;
            *transferred
        };
        let due = Duration::from_secs_f64(total as f64 / self.bytes_per_second as f64);
        due.saturating_sub(self.started.elapsed())
    }

    pub async fn consume(&self, bytes: u64) {
        let pause = self.pause_after(bytes);
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub retry: RetrySpec,
    pub concurrency: usize,
    pub bandwidth: Option<u64>,
}

/// Runs `transfer` for every item and returns the total bytes moved.
pub async fn run_transfers<T, F, Fut>(
    items: Vec<T>,
    settings: &TransferSettings,
    describe: impl Fn(&T) -> String,
    transfer: F,
) -> Result<u64, BackupError>
where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = StorageResult<u64>>,
{
    let throttle = settings.bandwidth.map(Throttle::new);
    let total = AtomicU64::new(0);

    futures::stream::iter(items.into_iter().map(Ok::<T, BackupError>))
        .try_for_each_concurrent(settings.concurrency.max(1), |item| {
            let name = describe(&item);
            let throttle = throttle.as_ref();
            let total = &total;
            let transfer = &transfer;
            async move {
                let bytes = retry(&settings.retry, &name, StorageError::is_transient, || {
                    transfer(item.clone())
                })
                .await?;
                total.fetch_add(bytes, Ordering::Relaxed);
                if let Some(throttle) = throttle {
                    throttle.consume(bytes).await;
                }
                Ok::<(), BackupError>(())
            }
        })
        .await?;

    Ok(total.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn settings(concurrency: usize) -> TransferSettings {
        TransferSettings {
            retry: RetrySpec {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                ..Default::default()
            },
            concurrency,
            bandwidth: None,
        }
    }

    #[tokio::test]
    async fn sums_bytes_of_all_transfers() {
        let total = run_transfers(vec![1u64, 2, 3], &settings(2), |n| n.to_string(), |n| async move {
            Ok(n * 10)
        })
        .await
        .unwrap();
        assert_eq!(total, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_per_item() {
        let attempts = &AtomicUsize::new(0);
        let total = run_transfers(vec![5u64], &settings(1), |n| n.to_string(), |n| async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StorageError::Transient("reset".to_string()))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(total, 5);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_failure_stops_the_batch() {
        let err = run_transfers(vec![1u64], &settings(1), |n| n.to_string(), |_| async move {
            Err::<u64, _>(StorageError::NotFound("f.db".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BackupError::Storage(StorageError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_paces_to_bandwidth() {
        let throttle = Throttle::new(100);
        let start = Instant::now();
        throttle.consume(200).await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
