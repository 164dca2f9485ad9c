//! Bounded worker pool.
//!
//! `concurrency` workers pull index tokens from a shared cursor. Each worker
//! keeps its own `(index, output)` partition; partitions are merged into
//! per-index slots after every worker has been joined, so no slot is ever
//! written by two workers and no lock guards the results.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::ProgressCallback;

/// Run `work` once per item with at most `concurrency` items in flight.
///
/// Returns one slot per item in input order. A slot is `None` only when the
/// item was never started (cancellation) or its worker died.
pub async fn run_pool<I, T, F, Fut>(
    items: Vec<I>,
    concurrency: usize,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
    work: F,
) -> Vec<Option<T>>
where
    I: Send + Sync + 'static,
    T: Send + 'static,
    F: Fn(&I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let total = items.len();
    let mut slots: Vec<Option<T>> = (0..total).map(|_| None).collect();
    if total == 0 {
        return slots;
    }

    let workers = concurrency.clamp(1, total);
    let items = Arc::new(items);
    let work = Arc::new(work);
    let cursor = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut set = JoinSet::new();
    for worker in 0..workers {
        let items = Arc::clone(&items);
        let work = Arc::clone(&work);
        let cursor = Arc::clone(&cursor);
        let completed = Arc::clone(&completed);
        let cancel = cancel.clone();
        let progress = progress.clone();

        set.spawn(async move {
            let mut partition = Vec::new();
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let idx = cursor.fetch_add(1, Ordering::SeqCst);
                if idx >= items.len() {
                    break;
                }

                let output = work(&items[idx]).await;
                partition.push((idx, output));

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(callback) = &progress {
                    callback(done, total);
                }
            }
            tracing::debug!(worker, processed = partition.len(), "Worker drained");
            partition
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(partition) => {
                for (idx, output) in partition {
                    slots[idx] = Some(output);
                }
            }
            Err(e) => tracing::error!("Fetch worker failed: {}", e),
        }
    }

    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_keep_submission_order() {
        let items: Vec<u64> = (0..20).collect();
        let slots = run_pool(items, 4, CancellationToken::new(), None, |n: &u64| {
            let n = *n;
            async move {
                // Later items finish first.
                tokio::time::sleep(Duration::from_millis(20 - n)).await;
                n * 10
            }
        })
        .await;

        let values: Vec<u64> = slots.into_iter().map(|s| s.unwrap()).collect();
        assert_eq!(values, (0..20).map(|n| n * 10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (gauge, high) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let slots = run_pool(
            (0..12).collect::<Vec<u32>>(),
            3,
            CancellationToken::new(),
            None,
            move |_: &u32| {
                let gauge = Arc::clone(&gauge);
                let high = Arc::clone(&high);
                async move {
                    let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
                    high.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    gauge.fetch_sub(1, Ordering::SeqCst);
                }
            },
        )
        .await;

        assert_eq!(slots.iter().filter(|s| s.is_some()).count(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_progress_called_once_per_item() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: ProgressCallback = Arc::new(move |done: usize, total: usize| {
            sink.lock().unwrap().push((done, total));
        });

        run_pool(
            vec!["a", "b", "c", "d", "e"],
            2,
            CancellationToken::new(),
            Some(progress),
            |s: &&str| {
                let s = s.to_string();
                async move { s }
            },
        )
        .await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5)]);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let slots = run_pool(Vec::<u8>::new(), 8, CancellationToken::new(), None, |b: &u8| {
            let b = *b;
            async move { b }
        })
        .await;
        assert!(slots.is_empty());
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_makes_progress() {
        let slots = run_pool(vec![1u8, 2, 3], 0, CancellationToken::new(), None, |b: &u8| {
            let b = *b;
            async move { b }
        })
        .await;
        assert_eq!(slots, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn test_cancellation_leaves_unstarted_slots_empty() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let slots = run_pool((0..10).collect::<Vec<u32>>(), 1, cancel, None, move |n: &u32| {
            let n = *n;
            let trigger = trigger.clone();
            async move {
                if n == 2 {
                    trigger.cancel();
                }
                n
            }
        })
        .await;

        assert_eq!(slots.len(), 10);
        assert_eq!(&slots[..3], &[Some(0), Some(1), Some(2)]);
        assert!(slots[3..].iter().all(Option::is_none));
    }
}
