use forkpool_core::{Result, Strategy};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::future::Future;
use tracing::warn;

/// Applies `op` to every item.
///
/// `Series` goes in order and stops at the first failure. `Parallel` starts
/// everything at once, lets every operation finish, and reports the first
/// failure to complete.
pub(crate) async fn run<T, F, Fut>(strategy: Strategy, items: Vec<T>, op: F) -> Result<()>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    match strategy {
        Strategy::Series => {
            for item in items {
                op(item).await?;
            }
            Ok(())
        }
        Strategy::Parallel => {
            let mut pending: FuturesUnordered<Fut> = items.into_iter().map(op).collect();
            let mut first_error = None;
            while let Some(result) = pending.next().await {
                if let Err(err) = result {
                    if first_error.is_none() {
                        first_error = Some(err);
                    } else {
                        warn!("Additional failure in parallel batch: {}", err);
                    }
                }
            }
            first_error.map_or(Ok(()), Err)
        }
    }
}
