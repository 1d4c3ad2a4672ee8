use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Runs `f` over `items` with at most `limit` calls in flight.
///
/// Workers pull the next index from a shared counter until the queue is
/// drained. Each worker hands back the `(index, output)` pairs it produced,
/// so every result slot is written once by the caller after the join.
/// Output order matches input order.
pub async fn run_bounded<T, R, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Vec<R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(usize, Arc<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }

    let items: Arc<Vec<Arc<T>>> = Arc::new(items.into_iter().map(Arc::new).collect());
    let next = Arc::new(AtomicUsize::new(0));
    let f = Arc::new(f);
    let worker_count = limit.max(1).min(total);

    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let items = Arc::clone(&items);
        let next = Arc::clone(&next);
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move {
            let mut produced = Vec::new();
            loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                if index >= items.len() {
                    break;
                }
                let output = f(index, Arc::clone(&items[index])).await;
                produced.push((index, output));
            }
            produced
        }));
    }

    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    for handle in handles {
        match handle.await {
            Ok(produced) => {
                for (index, output) in produced {
                    slots[index] = Some(output);
                }
            }
            Err(err) => warn!("Worker task ended abnormally: {}", err),
        }
    }

    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn preserves_input_order() {
        let items = vec![30u64, 5, 20, 1, 10];
        let results = run_bounded(items, 3, |index, delay| async move {
            tokio::time::sleep(Duration::from_millis(*delay)).await;
            (index, *delay * 2)
        })
        .await;
        assert_eq!(results, vec![(0, 60), (1, 10), (2, 40), (3, 2), (4, 20)]);
    }

    #[tokio::test]
    async fn never_exceeds_the_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let items: Vec<usize> = (0..20).collect();
        let (tracker, peak_seen) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let results = run_bounded(items, 4, move |_, item| {
            let tracker = Arc::clone(&tracker);
            let peak_seen = Arc::clone(&peak_seen);
            async move {
                let now = tracker.fetch_add(1, Ordering::SeqCst) + 1;
                peak_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                tracker.fetch_sub(1, Ordering::SeqCst);
                *item
            }
        })
        .await;
        assert_eq!(results, (0..20).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn empty_input_spawns_nothing() {
        let results: Vec<u8> = run_bounded(Vec::<u8>::new(), 8, |_, item| async move { *item }).await;
        assert!(results.is_empty());
    }
}
