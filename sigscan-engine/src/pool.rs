//! Bounded-concurrency item pool.
//!
//! At most `limit` item futures are in flight at once. The stop predicate is consulted before
//! every admission; once it returns true no further items are admitted, and the items already
//! in flight are driven to completion.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::job::JobKind;
use crate::metrics::MetricsTracker;
use sigscan_common::Error;

/// Handed to every `process_item` call.
#[derive(Clone)]
pub struct ItemContext {
    pub job: JobKind,
    /// Cancelled when the run is stopped or the item times out
    pub cancel: CancellationToken,
    /// Present only when the run has a metrics tracker
    pub metrics: Option<Arc<MetricsTracker>>,
    /// 1 for the first pass, 2 for the retry pass
    pub attempt: u32,
}

impl ItemContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Error::Cancelled)` once the run is stopped or the item has timed out.
    ///
    /// Workers call this between upstream requests to bail out early.
    pub fn check_cancelled(&self) -> sigscan_common::Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// How far a pass got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PassOutcome {
    /// Number of leading items that were admitted
    pub admitted: usize,
    /// Whether admission was cut short by the stop predicate
    pub stopped: bool,
}

/// Run `work` over `items` with at most `limit` in flight, feeding results to `on_done`.
///
/// `stopped` is only reported when an item was actually withheld, so a stop that arrives
/// after the last admission lets the pass finish normally.
pub(crate) async fn run_bounded<S, W, Fut, D>(
    items: &[String],
    limit: usize,
    should_stop: S,
    mut work: W,
    mut on_done: D,
) -> PassOutcome
where
    S: Fn() -> bool,
    W: FnMut(String) -> Fut,
    Fut: Future,
    D: FnMut(Fut::Output),
{
    let limit = limit.max(1);
    let mut in_flight = FuturesUnordered::new();
    let mut pending = items.iter().peekable();
    let mut admitted = 0;
    let mut stopped = false;

    loop {
        while !stopped && in_flight.len() < limit && pending.peek().is_some() {
            if should_stop() {
                stopped = true;
                break;
            }
            if let Some(item) = pending.next() {
                in_flight.push(work(item.clone()));
                admitted += 1;
            }
        }

        match in_flight.next().await {
            Some(output) => on_done(output),
            None => break,
        }
    }

    PassOutcome { admitted, stopped }
}

/// Await an item future under an optional deadline.
///
/// On expiry the item's token is cancelled so any detached sub-work can observe it.
pub(crate) async fn with_item_timeout<T, Fut>(
    fut: Fut,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    let Some(limit) = timeout else {
        return fut.await;
    };

    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(Error::Timeout(limit.as_secs()).into())
        }
    }
}
