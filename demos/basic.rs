use aggregate_limit::{AggregatedLimit, CancellationSource, LazyOptions};
use std::time;
use tokio::task::JoinSet;

#[tokio::main]
async fn main() -> Result<(), aggregate_limit::Error> {
    helpers::init_logging("aggregate_limit=trace");

    let limit = AggregatedLimit::builder()
        .per_second(4)
        .parallel(2)
        .build()?;

    let cancel = CancellationSource::new();
    let start = time::Instant::now();
    let mut tasks = JoinSet::new();

    for n in 0..10 {
        let limit = limit.clone();
        let cancel = cancel.token();

        tasks.spawn(async move {
            let options = LazyOptions::new()
                .timeout(time::Duration::from_secs(2))
                .cancel(cancel);

            match limit.accrue_token_lazy(options).await {
                Ok(token) => {
                    tokio::time::sleep(time::Duration::from_millis(100)).await;
                    println!("#{n} done at {:?}", start.elapsed());
                    token.commit();
                }
                Err(error) => println!("#{n} gave up: {error}"),
            }
        });
    }

    // Tasks which can't get a token within two seconds give up.
    while tasks.join_next().await.is_some() {}

    cancel.cancel();
    limit.dispose().await;
    println!("Disposed after {:?}", start.elapsed());
    Ok(())
}
