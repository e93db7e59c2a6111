//! Background eviction of orphaned traces
//!
//! A trace whose parent response never arrives keeps its store entries
//! forever. When expiry is enabled, a sweeper task periodically evicts
//! traces older than the configured maximum age.

use crate::filter::DataTracingFilter;
use datatrace_core::config::ExpirySettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Spawn the sweeper on the current tokio runtime
///
/// Runs until the returned handle is aborted.
pub fn spawn_sweeper(filter: Arc<DataTracingFilter>, settings: &ExpirySettings) -> JoinHandle<()> {
    let max_age = settings.max_age();
    // tokio::time::interval panics on a zero period
    let period = settings.sweep_interval().max(Duration::from_millis(1));

    info!(
        max_age_secs = max_age.as_secs(),
        interval_secs = period.as_secs(),
        "Starting trace expiry sweeper"
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = filter.sweep_expired(max_age);
            if evicted > 0 {
                info!(evicted = evicted, "Evicted expired traces");
            } else {
                debug!("No expired traces");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use datatrace_core::headers::REQUEST_ID;
    use datatrace_core::{ConcurrentStore, CorrelationStore, Policy, PolicyEvaluator};
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_sweeper_evicts_orphaned_traces() {
        let store: Arc<dyn CorrelationStore> = Arc::new(ConcurrentStore::new());
        let filter = Arc::new(DataTracingFilter::new(
            PolicyEvaluator::new(Policy::default()),
            Arc::clone(&store),
        ));

        let mut ctx = crate::ExchangeContext::new(1);
        let mut headers = HashMap::from([(REQUEST_ID.to_string(), "orphan".to_string())]);
        filter.on_request(&mut ctx, &mut headers);
        assert_eq!(store.len(), 2);

        let settings = ExpirySettings {
            enabled: true,
            max_age_secs: 0,
            sweep_interval_secs: 1,
        };
        let handle = spawn_sweeper(Arc::clone(&filter), &settings);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !store.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        handle.abort();

        assert!(store.is_empty());
        assert_eq!(filter.metrics().snapshot().traces_evicted, 1);
    }
}
