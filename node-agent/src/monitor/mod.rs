//! Resource Monitor
//!
//! Samples every metric category once per tick and persists the results as
//! `MetricSample` records. Categories are sampled concurrently on the
//! blocking pool, each under its own timeout; one failing category never
//! delays or aborts the others.

mod system;

pub use system::SysinfoSource;

use crate::config::RuntimeConfig;
use crate::records::{Category, LogEntry, MetricCategory, MetricSample};
use crate::store::SecureDataStore;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SOURCE: &str = "resource_monitor";

/// Device id recorded on samples taken before registration
pub const UNREGISTERED_DEVICE: &str = "unregistered";

/// Blocking provider of one metric category at a time
pub trait MetricSource: Send + Sync + 'static {
    fn sample(&self, category: MetricCategory) -> anyhow::Result<Value>;
}

/// Result of one sampling tick
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    pub sampled: Vec<MetricCategory>,
    pub failed: Vec<(MetricCategory, String)>,
}

#[derive(Clone)]
pub struct ResourceMonitor {
    store: Arc<SecureDataStore>,
    source: Arc<dyn MetricSource>,
    config: watch::Receiver<RuntimeConfig>,
    device_id: watch::Receiver<Option<String>>,
}

impl ResourceMonitor {
    pub fn new(
        store: Arc<SecureDataStore>,
        source: Arc<dyn MetricSource>,
        config: watch::Receiver<RuntimeConfig>,
        device_id: watch::Receiver<Option<String>>,
    ) -> Self {
        Self {
            store,
            source,
            config,
            device_id,
        }
    }

    async fn sample_category(&self, category: MetricCategory, limit: Duration) -> Result<Value, String> {
        let source = self.source.clone();
        let task = tokio::task::spawn_blocking(move || source.sample(category));

        // A timed-out task keeps its blocking thread until the source returns
        match timeout(limit, task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join_err)) => Err(format!("sampler panicked: {}", join_err)),
            Err(_) => Err(format!("timed out after {:?}", limit)),
        }
    }

    /// Sample every category once and persist what succeeded
    pub async fn sample_once(&self) -> TickReport {
        let limit = self.config.borrow().sample_timeout;
        let device_id = self
            .device_id
            .borrow()
            .clone()
            .unwrap_or_else(|| UNREGISTERED_DEVICE.to_string());
        let at = Utc::now();

        let results = join_all(
            MetricCategory::ALL
                .iter()
                .map(|category| async move { (*category, self.sample_category(*category, limit).await) }),
        )
        .await;

        let mut report = TickReport {
            at,
            sampled: Vec::new(),
            failed: Vec::new(),
        };

        for (category, result) in results {
            let outcome = result.and_then(|value| {
                let sample = MetricSample {
                    timestamp: at,
                    device_id: device_id.clone(),
                    category,
                    value,
                };
                self.store
                    .put_json(Category::Metrics, &sample)
                    .map_err(|e| format!("store write failed: {}", e))
            });

            match outcome {
                Ok(_) => report.sampled.push(category),
                Err(reason) => {
                    warn!("Sampling {} failed: {}", category.as_str(), reason);
                    let entry = LogEntry::warn(SOURCE, format!("{} sample skipped: {}", category.as_str(), reason));
                    if let Err(e) = self.store.log(&entry) {
                        debug!("Could not persist sampling failure: {}", e);
                    }
                    report.failed.push((category, reason));
                }
            }
        }

        debug!(
            "Tick complete: {} sampled, {} failed",
            report.sampled.len(),
            report.failed.len()
        );
        report
    }

    /// Sample on the configured interval until `stop` fires
    pub async fn run(mut self, stop: CancellationToken) {
        let mut interval = self.config.borrow().sampling_interval;
        info!("Resource monitor started (interval {:?})", interval);

        loop {
            let tick_started = Instant::now();
            self.sample_once().await;

            let mut deadline = tick_started + interval;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        info!("Resource monitor stopped");
                        return;
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                    changed = self.config.changed() => {
                        if changed.is_err() {
                            // Config owner gone; keep the last interval
                            tokio::select! {
                                _ = stop.cancelled() => return,
                                _ = tokio::time::sleep_until(deadline) => break,
                            }
                        } else {
                            let next = self.config.borrow_and_update().sampling_interval;
                            if next != interval {
                                info!("Sampling interval changed to {:?}", next);
                                interval = next;
                                deadline = tick_started + interval;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::test_store;
    use anyhow::anyhow;

    /// Fails one category, stalls another, answers the rest
    struct FlakySource;

    impl MetricSource for FlakySource {
        fn sample(&self, category: MetricCategory) -> anyhow::Result<Value> {
            match category {
                MetricCategory::Disk => Err(anyhow!("no disks on this host")),
                MetricCategory::Network => {
                    std::thread::sleep(Duration::from_millis(1500));
                    Ok(Value::Null)
                }
                other => Ok(serde_json::json!({ "category": other.as_str() })),
            }
        }
    }

    fn monitor(store: Arc<SecureDataStore>, config: RuntimeConfig) -> (ResourceMonitor, watch::Sender<RuntimeConfig>) {
        let (config_tx, config_rx) = watch::channel(config);
        let (_id_tx, id_rx) = watch::channel(Some("dev-1".to_string()));
        (ResourceMonitor::new(store, Arc::new(FlakySource), config_rx, id_rx), config_tx)
    }

    #[tokio::test]
    async fn test_failed_and_slow_categories_are_skipped() {
        let (_dir, store) = test_store();
        let store = Arc::new(store);
        let config = RuntimeConfig {
            sample_timeout: Duration::from_millis(300),
            ..RuntimeConfig::default()
        };
        let (monitor, _tx) = monitor(store.clone(), config);

        let report = monitor.sample_once().await;
        assert_eq!(
            report.sampled,
            vec![MetricCategory::Cpu, MetricCategory::Memory, MetricCategory::SystemInfo]
        );
        let failed: Vec<_> = report.failed.iter().map(|(c, _)| *c).collect();
        assert_eq!(failed, vec![MetricCategory::Disk, MetricCategory::Network]);

        let samples = store.fetch_pending(Category::Metrics, 10).unwrap();
        assert_eq!(samples.len(), 3);
        let first: MetricSample = samples[0].json().unwrap();
        assert_eq!(first.device_id, "dev-1");
        assert_eq!(store.pending_count(Category::Logs).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_dir, store) = test_store();
        let store = Arc::new(store);
        let config = RuntimeConfig {
            sample_timeout: Duration::from_millis(100),
            sampling_interval: Duration::from_secs(3600),
            ..RuntimeConfig::default()
        };
        let (monitor, _tx) = monitor(store.clone(), config);
        let stop = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(stop.clone()));

        tokio::time::sleep(Duration::from_millis(400)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(store.pending_count(Category::Metrics).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_interval_follows_config() {
        let (_dir, store) = test_store();
        let store = Arc::new(store);
        let config = RuntimeConfig {
            sample_timeout: Duration::from_millis(100),
            sampling_interval: Duration::from_secs(3600),
            ..RuntimeConfig::default()
        };
        let (monitor, config_tx) = monitor(store.clone(), config.clone());
        let stop = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(stop.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        config_tx
            .send(RuntimeConfig {
                sampling_interval: Duration::from_secs(1),
                ..config
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        stop.cancel();
        handle.await.unwrap();

        assert!(store.pending_count(Category::Metrics).unwrap() >= 6);
    }
}
