//! Periodic sweep failing requests whose response never came back.

use crate::remoting::RemotingEngine;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Start scanning after `initial_delay`, then every `period`.
///
/// The task ends on its own once the engine is dropped, otherwise it is aborted by shutdown.
pub(crate) fn spawn_reaper(
    engine: Weak<RemotingEngine>, initial_delay: Duration, period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + initial_delay, period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            let expired = engine.scan_response_table();
            if expired > 0 {
                debug!("{} reaped {} timed out requests", engine.name(), expired);
            }
        }
    })
}
