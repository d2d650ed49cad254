//! Connection statistics and the periodic stats reporter.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::info;

/// Default sampling period of the stats reporter.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Process-wide connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Connections accepted since start. Never decremented.
    pub lifetime_connections: u64,
    /// Connections currently open.
    pub active_connections: usize,
    /// Drivers currently bound to a connection.
    pub driver_bindings: usize,
}

/// Anything that can produce a stats sample.
pub trait StatsSource: Send + Sync + 'static {
    /// Read the current counters.
    fn stats(&self) -> ConnectionStats;
}

impl StatsSource for crate::registry::Registry {
    fn stats(&self) -> ConnectionStats {
        crate::registry::Registry::stats(self)
    }
}

impl StatsSource for crate::router::Router {
    fn stats(&self) -> ConnectionStats {
        crate::router::Router::stats(self)
    }
}

/// Periodically samples a [`StatsSource`] and logs the result.
pub struct StatsReporter;

impl StatsReporter {
    /// Spawn the reporter on the current runtime.
    ///
    /// The first sample is taken one `period` after spawning. Every sample is
    /// logged and then handed to `sink`. The reporter runs until the returned
    /// handle is aborted; dropping the handle detaches it.
    pub fn spawn<S, F>(source: Arc<S>, period: Duration, mut sink: F) -> JoinHandle<()>
    where
        S: StatsSource,
        F: FnMut(&ConnectionStats) + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let stats = source.stats();
                info!(
                    lifetime_connections = stats.lifetime_connections,
                    active_connections = stats.active_connections,
                    driver_bindings = stats.driver_bindings,
                    "Connection stats"
                );
                sink(&stats);
            }
        })
    }
}
