//! Execution-timeout sweeper. Periodically forces recommendations stuck
//! past their deadline to FAILED so no sector stays IRRIGATING forever.
//!
//! Intended to be `tokio::spawn`-ed next to whatever drives the engine.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::engine::Engine;

/// Run the sweeper loop against the wall clock.
pub async fn run(engine: Arc<Engine>, every: Duration) {
    run_with_clock(engine, every, OffsetDateTime::now_utc).await
}

/// Same loop with an injected clock.
pub async fn run_with_clock<C>(engine: Arc<Engine>, every: Duration, clock: C)
where
    C: Fn() -> OffsetDateTime,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(every_sec = every.as_secs(), "sweeper started");

    loop {
        ticker.tick().await;

        let expired = engine.sweep_timeouts(clock());
        if !expired.is_empty() {
            info!(
                count = expired.len(),
                ids = ?expired.iter().map(|r| r.id.to_string()).collect::<Vec<_>>(),
                "sweeper: recommendations expired"
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
