use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run `job` immediately, then every `every`, until `cancel` fires.
///
/// A job that overruns the period delays the next tick instead of causing a
/// burst of catch-up runs. Cancellation is observed between runs and while
/// waiting, never in the middle of a job. Returns the number of runs.
pub async fn run_on_interval<F, Fut>(every: Duration, cancel: CancellationToken, mut job: F) -> u64
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut runs = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = cancel.cancelled() => break,
        }
        if cancel.is_cancelled() {
            break;
        }
        job().await;
        runs += 1;
    }

    tracing::info!(runs, "Scheduler stopped");
    runs
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_immediately_then_periodically() {
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU64::new(0));

        let handle = {
            let cancel = cancel.clone();
            let count = Arc::clone(&count);
            tokio::spawn(run_on_interval(Duration::from_secs(60), cancel, move || {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }))
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_runs() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runs = run_on_interval(Duration::from_secs(1), cancel, || async {}).await;
        assert_eq!(runs, 0);
    }
}
