use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aggregate_limit::{AggregatedLimit, LazyOptions};
use tokio::time::{self, Duration, Instant};

#[tokio::test(start_paused = true)]
async fn test_tasks_respect_every_limit() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder()
        .per_timespan(Duration::from_millis(100), 10)
        .parallel(3)
        .build()?;

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut tasks = Vec::new();

    for _ in 0..10 {
        let limit = limit.clone();
        let active = active.clone();
        let peak = peak.clone();

        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                let token = limit.accrue_token_lazy(LazyOptions::new()).await?;
                let current = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                token.commit();
            }

            Ok::<_, aggregate_limit::Error>(())
        }));
    }

    for task in tasks {
        task.await??;
    }

    assert_eq!(peak.load(Ordering::SeqCst), 3);
    // 50 hits at 10 per 100ms need at least four full windows.
    assert!(Instant::now().duration_since(start) >= Duration::from_millis(400));

    limit.dispose().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_thread() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder().parallel(2).build()?;
    let active = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();

    for _ in 0..8 {
        let limit = limit.clone();
        let active = active.clone();

        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                let token = limit.accrue_token_lazy(LazyOptions::new()).await?;
                assert!(active.fetch_add(1, Ordering::SeqCst) < 2);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
                token.commit();
            }

            Ok::<_, aggregate_limit::Error>(())
        }));
    }

    for task in tasks {
        task.await??;
    }

    assert_eq!(limit.available_weight()?, 2);
    limit.dispose().await;
    Ok(())
}
