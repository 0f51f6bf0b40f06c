//! Periodic services
//!
//! Each service owns its interval timer and its bounded worker pool so
//! a slow cycle in one cannot starve another. All of them derive their
//! lifetime from the supervisor's cancellation token.

pub mod discovery;
pub mod plant;
pub mod status;
pub mod telemetry;

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Run `handler` over `jobs` with a bounded pool of workers.
///
/// Jobs flow through a channel bounded by `min(worker_count, jobs)`;
/// results are collected from a channel of the same bound. Workers
/// exit as soon as the token is cancelled; a handler returning `None`
/// (after logging) simply drops its job from the result set.
pub(crate) async fn fan_out<J, R, F, Fut>(
    token: &CancellationToken,
    worker_count: usize,
    jobs: Vec<J>,
    handler: F,
) -> Vec<R>
where
    J: Send + 'static,
    R: Send + 'static,
    F: Fn(J) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Option<R>> + Send,
{
    if jobs.is_empty() {
        return Vec::new();
    }

    let bound = worker_count.min(jobs.len()).max(1);
    let (job_tx, job_rx) = mpsc::channel::<J>(bound);
    let (result_tx, mut result_rx) = mpsc::channel::<R>(bound);
    let job_rx = Arc::new(Mutex::new(job_rx));

    let mut workers = Vec::with_capacity(bound);
    for _ in 0..bound {
        let job_rx = Arc::clone(&job_rx);
        let result_tx = result_tx.clone();
        let handler = handler.clone();
        let token = token.clone();

        workers.push(tokio::spawn(async move {
            loop {
                let job = { job_rx.lock().await.recv().await };
                let Some(job) = job else { break };
                if token.is_cancelled() {
                    break;
                }
                if let Some(result) = handler(job).await {
                    if result_tx.send(result).await.is_err() {
                        break;
                    }
                }
            }
        }));
    }
    drop(result_tx);

    let feeder_token = token.clone();
    let feeder = tokio::spawn(async move {
        for job in jobs {
            tokio::select! {
                _ = feeder_token.cancelled() => break,
                sent = job_tx.send(job) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut results = Vec::new();
    while let Some(result) = result_rx.recv().await {
        results.push(result);
    }

    let _ = feeder.await;
    for worker in workers {
        let _ = worker.await;
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_collects_all_results() {
        let token = CancellationToken::new();
        let jobs: Vec<u32> = (0..100).collect();

        let mut results = fan_out(&token, 8, jobs, |n| async move { Some(n * 2) }).await;
        results.sort_unstable();

        assert_eq!(results.len(), 100);
        assert_eq!(results[0], 0);
        assert_eq!(results[99], 198);
    }

    #[tokio::test]
    async fn test_fan_out_drops_failed_jobs() {
        let token = CancellationToken::new();
        let jobs: Vec<u32> = (0..10).collect();

        let results = fan_out(&token, 4, jobs, |n| async move {
            (n % 2 == 0).then_some(n)
        })
        .await;

        assert_eq!(results.len(), 5);
    }

    #[tokio::test]
    async fn test_fan_out_stops_on_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let jobs: Vec<u32> = (0..1000).collect();

        let results = fan_out(&token, 4, jobs, |n| async move { Some(n) }).await;

        // Cancelled before work started; nothing gets processed.
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_empty_jobs() {
        let token = CancellationToken::new();
        let results: Vec<u32> = fan_out(&token, 4, Vec::new(), |n| async move { Some(n) }).await;
        assert!(results.is_empty());
    }
}
