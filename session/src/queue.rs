//! Serial executor for lifecycle operations.
//!
//! Jobs run one at a time in submission order. Each job runs in its own task
//! and the worker awaits it, so a job that fails or panics never stalls the
//! ones behind it.

use std::sync::Mutex;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::error::SessionError;

type Job = BoxFuture<'static, ()>;

pub(crate) struct LifecycleQueue {
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl LifecycleQueue {
    /// Spawns the worker; must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx));
        Self {
            jobs: Mutex::new(Some(tx)),
        }
    }

    /// Enqueue `op` now and return a future for its outcome.
    ///
    /// Enqueueing happens at call time, not on first poll, so the order of
    /// calls is the order of execution. Dropping the returned future does not
    /// cancel the operation.
    pub fn submit<T, F>(&self, op: F) -> impl Future<Output = Result<T, SessionError>> + Send + use<T, F>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, SessionError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(op.await);
        });

        let queued = self
            .jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .is_some_and(|jobs| jobs.send(job).is_ok());

        async move {
            if !queued {
                return Err(SessionError::QueueClosed);
            }
            rx.await.unwrap_or(Err(SessionError::Aborted))
        }
    }

    /// Refuse further submissions. Jobs already queued still run.
    pub fn close(&self) {
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }
}

async fn run_worker(mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        if let Err(e) = tokio::spawn(job).await {
            if e.is_panic() {
                tracing::error!("Lifecycle operation panicked; continuing with the next one");
            } else {
                tracing::warn!("Lifecycle operation cancelled: {e}");
            }
        }
    }
    tracing::debug!("Lifecycle queue drained");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let queue = LifecycleQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut pending = Vec::new();
        for i in 0..5u64 {
            let log = Arc::clone(&log);
            pending.push(queue.submit(async move {
                // Later jobs sleep less; only serialization keeps them ordered.
                tokio::time::sleep(Duration::from_millis(10 - i * 2)).await;
                log.lock().unwrap().push(i);
                Ok(i)
            }));
        }
        for (i, fut) in pending.into_iter().enumerate() {
            assert_eq!(fut.await, Ok(i as u64));
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_jobs_never_overlap() {
        let queue = LifecycleQueue::new();
        let busy = Arc::new(AtomicBool::new(false));

        let jobs: Vec<_> = (0..4)
            .map(|_| {
                let busy = Arc::clone(&busy);
                queue.submit(async move {
                    assert!(!busy.swap(true, Ordering::SeqCst), "jobs overlapped");
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    busy.store(false, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();
        for job in jobs {
            assert_eq!(job.await, Ok(()));
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_stall_queue() {
        let queue = LifecycleQueue::new();
        let failed = queue.submit(async { Err::<(), _>(SessionError::Aborted) });
        let next = queue.submit(async { Ok(7) });
        assert_eq!(failed.await, Err(SessionError::Aborted));
        assert_eq!(next.await, Ok(7));
    }

    #[tokio::test]
    async fn test_panic_reports_aborted_and_queue_continues() {
        let queue = LifecycleQueue::new();
        let panicked = queue.submit(async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        let next = queue.submit(async { Ok("still running") });
        assert_eq!(panicked.await, Err(SessionError::Aborted));
        assert_eq!(next.await, Ok("still running"));
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_job() {
        let queue = LifecycleQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = Arc::clone(&ran);
            drop(queue.submit(async move {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            }));
        }
        assert_eq!(queue.submit(async { Ok(()) }).await, Ok(()));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_rejects_new_jobs() {
        let queue = LifecycleQueue::new();
        let queued = queue.submit(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(1)
        });
        queue.close();
        assert_eq!(
            queue.submit(async { Ok(2) }).await,
            Err(SessionError::QueueClosed)
        );
        assert_eq!(queued.await, Ok(1));
    }
}
