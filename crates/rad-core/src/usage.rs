use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use rad_provider_core::{AdminEvent, EventHub, UsageRecord, UsageRepository, UsageWindow};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Fans completed-request usage out to the repository and, after per-second
/// aggregation, to the admin hub's `usage:realtime` channel.
#[derive(Clone)]
pub struct UsageAggregator {
    tx: mpsc::UnboundedSender<UsageRecord>,
}

impl UsageAggregator {
    pub fn spawn(hub: EventHub, repository: Arc<dyn UsageRepository>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx, hub, repository));
        (Self { tx }, handle)
    }

    /// Never blocks the data plane; accounting lag is preferable to stream
    /// latency.
    pub fn record(&self, record: UsageRecord) {
        if self.tx.send(record).is_err() {
            warn!(event = "usage_dropped", "usage aggregator is gone");
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<UsageRecord>,
    hub: EventHub,
    repository: Arc<dyn UsageRepository>,
) {
    let mut window = UsageWindow::default();
    let mut ticker = interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            record = rx.recv() => match record {
                Some(record) => {
                    if record.usage_estimated {
                        debug!(
                            event = "usage_estimated",
                            request_id = %record.request_id,
                            "token counts derived from delta-count floor"
                        );
                    }
                    if let Err(err) = repository.insert(record.clone()).await {
                        warn!(event = "usage_insert_failed", error = %err);
                    }
                    window.requests += 1;
                    window.prompt_tokens += record.prompt_tokens;
                    window.completion_tokens += record.completion_tokens;
                    window.total_tokens += record.total_tokens;
                    window.cost_usd += record.cost_usd.unwrap_or(0.0);
                }
                None => {
                    flush(&hub, &mut window);
                    break;
                }
            },
            _ = ticker.tick() => flush(&hub, &mut window),
        }
    }
}

fn flush(hub: &EventHub, window: &mut UsageWindow) {
    if window.requests == 0 {
        return;
    }
    window.window_start = OffsetDateTime::now_utc().unix_timestamp();
    hub.emit(AdminEvent::UsageRealtime(std::mem::take(window)));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use rad_provider_core::MemoryUsageRepository;

    use super::*;

    fn record(tokens: u64) -> UsageRecord {
        UsageRecord {
            request_id: "r1".to_string(),
            trace_id: "t1".to_string(),
            api_key_name: "ci".to_string(),
            incoming_api_type: "chat".to_string(),
            incoming_model: "gpt-4".to_string(),
            selected_model: "gpt-4".to_string(),
            provider: "openai".to_string(),
            response_status: "success".to_string(),
            duration_ms: 12,
            prompt_tokens: tokens,
            completion_tokens: tokens,
            total_tokens: tokens * 2,
            cost_usd: Some(0.001),
            usage_estimated: false,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn records_reach_repository_and_hub() {
        let hub = EventHub::new(16, 4);
        let mut sub = hub.subscribe().unwrap();
        let repository = Arc::new(MemoryUsageRepository::new());
        let (aggregator, _handle) = UsageAggregator::spawn(hub.clone(), repository.clone());

        aggregator.record(record(5));
        aggregator.record(record(7));

        let event = timeout(Duration::from_secs(3), sub.recv())
            .await
            .expect("aggregate within flush interval")
            .unwrap();
        let AdminEvent::UsageRealtime(window) = event else {
            panic!("expected usage window, got {event:?}");
        };
        assert_eq!(window.requests, 2);
        assert_eq!(window.prompt_tokens, 12);
        assert!((window.cost_usd - 0.002).abs() < 1e-9);

        assert_eq!(repository.records().len(), 2);
    }

    #[tokio::test]
    async fn idle_windows_are_not_emitted() {
        let hub = EventHub::new(16, 4);
        let mut sub = hub.subscribe().unwrap();
        let repository = Arc::new(MemoryUsageRepository::new());
        let (_aggregator, _handle) = UsageAggregator::spawn(hub.clone(), repository);

        assert!(
            timeout(Duration::from_millis(1500), sub.recv())
                .await
                .is_err(),
            "no traffic must mean no usage events"
        );
    }
}
