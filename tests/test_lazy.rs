use std::sync::{mpsc, Arc};

use aggregate_limit::{
    AggregatedLimit, CancelCause, CancelListener, CancelListenerId, CancellationSource,
    CancellationToken, Error, LazyOptions,
};
use futures::FutureExt;
use tokio::time::{self, Duration, Instant};

#[tokio::test(start_paused = true)]
async fn test_fifo() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder().parallel(2).build()?;

    let a = limit.accrue_token_immediately(1)?;
    let b = limit.accrue_token_immediately(1)?;

    let mut first = limit.accrue_token_lazy(LazyOptions::new());
    let mut second = limit.accrue_token_lazy(LazyOptions::new());

    assert!((&mut first).now_or_never().is_none());
    assert!((&mut second).now_or_never().is_none());

    a.commit();

    let first = first.now_or_never().expect("first is served")?;
    assert!((&mut second).now_or_never().is_none());

    b.commit();

    let second = second.now_or_never().expect("second is served")?;
    assert_eq!(limit.available_weight()?, 0);

    first.commit();
    second.commit();
    assert_eq!(limit.available_weight()?, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_waits_out_window() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder().per_second(1).parallel(4).build()?;

    let start = Instant::now();
    limit.accrue_token_immediately(1)?.commit();

    let token = limit
        .accrue_token_lazy(LazyOptions::new().timeout(Duration::from_secs(5)))
        .await?;

    assert_eq!(Instant::now().duration_since(start), Duration::from_secs(1));
    token.commit();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timeout() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder().parallel(1).build()?;
    let held = limit.accrue_token_immediately(1)?;

    let start = Instant::now();

    let error = limit
        .accrue_token_lazy(LazyOptions::new().timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();

    assert!(matches!(error, Error::Timeout(timeout) if timeout == Duration::from_millis(100)));
    assert!(error.is_limit());
    assert_eq!(
        Instant::now().duration_since(start),
        Duration::from_millis(100)
    );

    held.commit();
    assert_eq!(limit.available_weight()?, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timeout_keeps_others_waiting() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder().parallel(1).build()?;
    let held = limit.accrue_token_immediately(1)?;

    let short = limit.accrue_token_lazy(LazyOptions::new().timeout(Duration::from_millis(10)));
    let mut long = limit.accrue_token_lazy(LazyOptions::new());

    assert!(matches!(short.await, Err(Error::Timeout(..))));
    assert!((&mut long).now_or_never().is_none());

    held.commit();
    long.now_or_never().expect("long is served")?.commit();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_timeout() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder().parallel(1).build()?;
    let held = limit.accrue_token_immediately(1)?;
    let source = CancellationSource::new();

    let options = LazyOptions::new()
        .timeout(Duration::from_millis(100))
        .cancel(source.token());

    let mut waiting = limit.accrue_token_lazy(options);
    assert!((&mut waiting).now_or_never().is_none());

    source.cancel();

    let error = waiting.now_or_never().expect("cancelled").unwrap_err();
    assert!(matches!(error, Error::Cancelled(..)));
    assert_eq!(
        error.to_string(),
        "Token was not accrued: Operation was cancelled"
    );

    // The timer was disarmed along with the waiter.
    time::sleep(Duration::from_millis(200)).await;

    held.commit();
    assert_eq!(limit.available_weight()?, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timeout_before_cancel() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder().parallel(1).build()?;
    let _held = limit.accrue_token_immediately(1)?;
    let source = CancellationSource::new();

    let (tx, rx) = mpsc::channel();

    let options = LazyOptions::new()
        .timeout(Duration::from_millis(100))
        .cancel(source.token());

    limit.accrue_token_lazy_with(options, move |result| {
        tx.send(result.map(drop)).unwrap();
    })?;

    time::sleep(Duration::from_millis(150)).await;
    source.cancel();

    assert!(matches!(rx.try_recv()?, Err(Error::Timeout(..))));
    // Only one outcome is ever reported.
    assert!(matches!(rx.try_recv(), Err(mpsc::TryRecvError::Disconnected)));
    Ok(())
}

/// A handle which doesn't report why it was cancelled.
struct Anonymous(CancellationSource);

impl CancellationToken for Anonymous {
    fn is_cancellation_requested(&self) -> bool {
        self.0.is_cancellation_requested()
    }

    fn add_cancel_listener(&self, listener: CancelListener) -> CancelListenerId {
        self.0.add_cancel_listener(listener)
    }

    fn remove_cancel_listener(&self, id: CancelListenerId) {
        self.0.remove_cancel_listener(id)
    }

    fn check_cancelled(&self) -> Result<(), CancelCause> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_without_cause() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder().parallel(1).build()?;
    let _held = limit.accrue_token_immediately(1)?;
    let source = CancellationSource::new();

    let waiting =
        limit.accrue_token_lazy(LazyOptions::new().cancel(Arc::new(Anonymous(source.clone()))));

    source.cancel();
    assert!(matches!(waiting.await, Err(Error::CancelRequested)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_already_cancelled() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder().parallel(1).build()?;
    let source = CancellationSource::new();
    source.cancel();

    // Available tokens are still handed out.
    let token = limit
        .accrue_token_lazy(LazyOptions::new().cancel(source.token()))
        .await?;

    let error = limit
        .accrue_token_lazy(LazyOptions::new().cancel(source.token()))
        .await
        .unwrap_err();

    assert!(matches!(error, Error::Cancelled(..)));
    token.rollback();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_callback() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder().per_second(1).build()?;
    let (tx, rx) = mpsc::channel();

    for _ in 0..2 {
        let tx = tx.clone();

        limit.accrue_token_lazy_with(LazyOptions::new(), move |result| {
            tx.send((Instant::now(), result)).unwrap();
        })?;
    }

    let start = Instant::now();
    let (at, first) = rx.try_recv()?;
    assert_eq!(at, start);
    first?.commit();
    assert!(rx.try_recv().is_err());

    time::sleep(Duration::from_millis(1010)).await;

    let (at, second) = rx.try_recv()?;
    assert_eq!(at.duration_since(start), Duration::from_secs(1));
    second?.commit();

    assert!(matches!(
        limit.accrue_token_lazy_with(LazyOptions::new().weight(0), |_| {}),
        Err(Error::InvalidWeight)
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dropped_future() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder().parallel(1).build()?;
    let held = limit.accrue_token_immediately(1)?;

    // Abandoned while waiting.
    drop(limit.accrue_token_lazy(LazyOptions::new()));
    let mut waiting = limit.accrue_token_lazy(LazyOptions::new());

    held.commit();

    // Served but never received.
    assert_eq!(limit.available_weight()?, 0);
    drop(waiting);
    assert_eq!(limit.available_weight()?, 1);

    waiting = limit.accrue_token_lazy(LazyOptions::new());
    waiting.await?.commit();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_weighted_waiter() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder().parallel(3).build()?;

    let a = limit.accrue_token_immediately(1)?;
    let b = limit.accrue_token_immediately(1)?;
    let c = limit.accrue_token_immediately(1)?;

    let mut heavy = limit.accrue_token_lazy(LazyOptions::new().weight(2));
    assert!((&mut heavy).now_or_never().is_none());

    // A single slot back is not enough for the waiter.
    a.commit();
    assert_eq!(limit.available_weight()?, 1);
    assert!((&mut heavy).now_or_never().is_none());

    b.commit();
    let heavy = heavy.now_or_never().expect("served with two slots back")?;
    assert_eq!(limit.available_weight()?, 0);

    heavy.commit();
    c.commit();
    assert_eq!(limit.available_weight()?, 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_oversized_weight() -> anyhow::Result<()> {
    let limit = AggregatedLimit::builder().parallel(2).build()?;

    let result = limit
        .accrue_token_lazy(LazyOptions::new().weight(3).timeout(Duration::from_secs(1)))
        .await;
    assert!(matches!(result, Err(Error::TokenOverflow { weight: 3, max: 2 })));

    assert!(matches!(
        limit.accrue_token_lazy_with(LazyOptions::new().weight(3), |_| panic!("not called")),
        Err(Error::TokenOverflow { .. })
    ));

    // Nothing was queued ahead of requests which fit.
    let token = limit.accrue_token_lazy(LazyOptions::new().weight(2)).await?;
    token.commit();
    assert_eq!(limit.available_weight()?, 2);
    Ok(())
}
