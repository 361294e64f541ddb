use std::thread;

use anyhow::{Result, anyhow, bail};

pub const MAX_PARALLEL_UPLOADS: usize = 8;
pub const MAX_PARALLEL_WIDGET_CALLS: usize = 4;

/// Run `task` over `items` in batches of at most `max_concurrent` threads.
///
/// Every item runs even when some fail; failures are joined into one error.
/// Results keep the input order.
pub fn run_bounded<T, R, F>(items: &[T], max_concurrent: usize, label: &str, task: F) -> Result<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Sync,
{
    let max_concurrent = max_concurrent.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut errors = Vec::new();

    for chunk in items.chunks(max_concurrent) {
        let outcomes = thread::scope(|scope| {
            let handles = chunk
                .iter()
                .map(|item| scope.spawn(|| task(item)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| anyhow!("{label} worker thread panicked"))
                        .and_then(|result| result)
                })
                .collect::<Vec<_>>()
        });
        for outcome in outcomes {
            match outcome {
                Ok(value) => results.push(value),
                Err(error) => errors.push(format!("{error:#}")),
            }
        }
    }

    if !errors.is_empty() {
        bail!("{label} failed for {} item(s): {}", errors.len(), errors.join("; "));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;
    use std::time::Duration;

    use anyhow::bail;

    use super::run_bounded;

    #[test]
    fn run_bounded_never_exceeds_limit() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items = (0..20).collect::<Vec<_>>();

        let results = run_bounded(&items, 4, "test", |item| {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(2));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(item * 2)
        })
        .expect("run");

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(results, (0..20).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn run_bounded_collects_every_failure() {
        let items = vec![1, 2, 3, 4];
        let error = run_bounded(&items, 8, "upload", |item| {
            if item % 2 == 0 {
                bail!("item {item} broke");
            }
            Ok(())
        })
        .expect_err("must fail");
        let message = error.to_string();
        assert!(message.contains("upload failed for 2 item(s)"));
        assert!(message.contains("item 2 broke"));
        assert!(message.contains("item 4 broke"));
    }
}
