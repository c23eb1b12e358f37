//! Time-addressed lookup over the epoch grid.
//!
//! Finds the update with the highest recorded time not past a requested
//! `now`, by walking candidate epochs: descend a level after every hit,
//! step back in time after every miss. Placement guarantees the first
//! update of a feed sits at the coarsest level, so a fruitless sweep of
//! that level proves the feed has nothing at or before `now`.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    epoch::{Epoch, LOWEST_LEVEL},
    Error, Result,
};

/// Walk the epoch grid and return the best update at or before `now`,
/// along with the epoch slot it was found in.
///
/// `read` probes one epoch slot: `Ok(None)` is a miss, `Ok(Some((time,
/// value)))` a hit with the update's recorded time. Hits dated after `now`
/// are treated as misses. `hint` short-circuits the walk to the epoch of
/// the last known update.
pub(crate) async fn lookup<T, F, Fut>(
    now: u64,
    hint: Option<Epoch>,
    cancel: &CancellationToken,
    mut read: F,
) -> Result<Option<(Epoch, u64, T)>>
where
    F: FnMut(Epoch) -> Fut,
    Fut: Future<Output = Result<Option<(u64, T)>>>,
{
    let mut best: Option<(Epoch, u64, T)> = None;
    let mut from_hint = hint.is_some();
    let mut cur = hint.unwrap_or_else(|| Epoch::first(now));

    loop {
        let probed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = read(cur) => res?,
        };

        match probed {
            Some((time, value)) if time <= now => {
                trace!(epoch = %cur, time, "probe hit");
                let level = cur.level;
                best = Some((cur, time, value));
                if level == LOWEST_LEVEL {
                    break;
                }
                // a more recent update may sit at a finer level
                cur = Epoch::new(now, level - 1);
            }
            _ => {
                trace!(epoch = %cur, "probe miss");
                if from_hint && best.is_none() {
                    // stale hint; start over from the coarsest level
                    from_hint = false;
                    cur = Epoch::first(now);
                    continue;
                }
                // step to the previous epoch at this level, unless that
                // interval cannot hold anything newer than the best hit
                let lateral = cur.base().checked_sub(1);
                let improves = match (lateral, &best) {
                    (None, _) => false,
                    (Some(t), Some((_, best_time, _))) => t > *best_time,
                    (Some(_), None) => true,
                };
                if let (Some(t), true) = (lateral, improves) {
                    cur = Epoch::new(t, cur.level);
                    continue;
                }
                match &best {
                    None => {
                        // placement puts the first update at the coarsest
                        // level; an exhausted sweep here means NotFound
                        break;
                    }
                    Some(_) if cur.level > LOWEST_LEVEL => {
                        cur = Epoch::new(now, cur.level - 1);
                    }
                    Some(_) => break,
                }
            }
        }
    }

    Ok(best)
}
