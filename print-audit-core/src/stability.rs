//! Waits until the remote drop directory stops changing.
//!
//! The shape of a listing (file count, total bytes) is sampled every
//! `interval`. Two consecutive equal samples mean the uploader is done and
//! the last listing is returned. With `max_rounds > 0` the wait gives up after
//! that many unequal comparisons and returns the latest listing anyway.
//!
//! Only the first listing is allowed to fail the wait. A later listing error
//! is logged, counts as a round, and sampling continues against the last good
//! sample.
//!
//! This is a coarse heuristic: a file rewritten in place with the same size
//! is invisible to it.

use std::time::Duration;

use tracing::{info, warn};

use crate::contract::{RemoteItem, Transport, TransportError};

/// Aggregate shape of one listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub count: usize,
    pub total_size: u64,
}

impl Snapshot {
    pub fn of(items: &[RemoteItem]) -> Self {
        Self {
            count: items.len(),
            total_size: items.iter().map(|i| i.size).sum(),
        }
    }
}

/// How the wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableListing {
    pub items: Vec<RemoteItem>,
    /// Number of sleep-and-compare rounds performed.
    pub rounds: u32,
    /// False when `max_rounds` ran out before two samples matched.
    pub settled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityOptions {
    pub interval: Duration,
    /// 0 means wait without limit.
    pub max_rounds: u32,
}

impl Default for StabilityOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_rounds: 0,
        }
    }
}

/// Sample `remote_dir` until two consecutive samples agree.
///
/// Each new sample is compared with the one before it, so a source that
/// changes once and then settles costs two rounds.
pub async fn wait_for_stable<T>(
    transport: &T,
    remote_dir: &str,
    options: StabilityOptions,
) -> Result<StableListing, TransportError>
where
    T: Transport + ?Sized,
{
    let mut last_listing = transport.list(remote_dir).await?;
    let mut previous_shape = Snapshot::of(&last_listing);
    info!(
        files = previous_shape.count,
        total_size = previous_shape.total_size,
        "Initial remote snapshot"
    );

    let mut rounds: u32 = 0;
    loop {
        info!(interval_secs = options.interval.as_secs(), "Waiting for stability check");
        tokio::time::sleep(options.interval).await;
        rounds += 1;

        let current = match transport.list(remote_dir).await {
            Ok(items) => items,
            Err(e) => {
                warn!(round = rounds, error = %e, "Remote listing failed; retrying next round");
                if options.max_rounds > 0 && rounds >= options.max_rounds {
                    warn!(
                        max_rounds = options.max_rounds,
                        "Stability check exceeded max rounds; proceeding with last good listing"
                    );
                    return Ok(StableListing {
                        items: last_listing,
                        rounds,
                        settled: false,
                    });
                }
                continue;
            }
        };
        let current_shape = Snapshot::of(&current);
        info!(
            round = rounds,
            files = current_shape.count,
            total_size = current_shape.total_size,
            "Remote snapshot"
        );

        if current_shape == previous_shape {
            if current.is_empty() {
                warn!(remote_dir = %remote_dir, "Remote folder is empty");
            } else {
                info!(remote_dir = %remote_dir, rounds, "Remote folder is stable");
            }
            return Ok(StableListing {
                items: current,
                rounds,
                settled: true,
            });
        }

        info!(
            from_size = previous_shape.total_size,
            to_size = current_shape.total_size,
            from_files = previous_shape.count,
            to_files = current_shape.count,
            "Remote folder is still changing"
        );

        if options.max_rounds > 0 && rounds >= options.max_rounds {
            warn!(
                max_rounds = options.max_rounds,
                "Stability check exceeded max rounds; proceeding with current listing"
            );
            return Ok(StableListing {
                items: current,
                rounds,
                settled: false,
            });
        }

        previous_shape = current_shape;
        last_listing = current;
    }
}
