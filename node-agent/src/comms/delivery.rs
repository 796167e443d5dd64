//! Store-and-forward delivery of queued records

use super::protocol::{TelemetryBatch, TelemetryRecord};
use super::{pause, CommsError, CommunicationManager, Session};
use crate::records::{Category, CommunicationLogEntry, Direction};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

impl CommunicationManager {
    /// Send at most one batch per deliverable category, oldest records
    /// first, and mark delivered only what the control plane acknowledged.
    /// Only the acknowledged prefix of a batch is committed and the round
    /// stops at the first failure, so later records never overtake earlier ones.
    pub async fn deliver_round(&self, session: &Session, retry: u32) -> Result<usize, CommsError> {
        let batch_size = self.inner.config.borrow().batch_size;
        let mut delivered = 0;

        for category in Category::DELIVERABLE {
            let records = self.inner.store.fetch_pending(category, batch_size)?;
            if records.is_empty() {
                continue;
            }
            let batch = TelemetryBatch {
                device_id: session.device_id.clone(),
                category,
                records: records.iter().map(TelemetryRecord::from).collect(),
            };

            let ack = match self.inner.plane.deliver(session, &batch).await {
                Ok(ack) => ack,
                Err(e) => {
                    self.journal(
                        CommunicationLogEntry::new(Direction::Outbound, "telemetry", "failed")
                            .retries(retry)
                            .detail(format!("{} x{}: {}", category, records.len(), e)),
                    );
                    return Err(e);
                }
            };

            let sent = batch.ids();
            let ids = match ack.accepted {
                Some(accepted) => {
                    let accepted: HashSet<_> = accepted.into_iter().collect();
                    sent.into_iter().take_while(|id| accepted.contains(id)).collect()
                }
                None => sent,
            };
            self.inner.store.mark_delivered(&ids)?;
            delivered += ids.len();

            self.journal(
                CommunicationLogEntry::new(Direction::Outbound, "telemetry", "delivered")
                    .retries(retry)
                    .detail(format!("{} {}/{}", category, ids.len(), records.len())),
            );
            if ids.len() < records.len() {
                debug!("Control plane accepted {}/{} {} records", ids.len(), records.len(), category);
            }
        }

        if delivered > 0 {
            self.mark_online(true);
        }
        Ok(delivered)
    }

    pub(super) async fn outbound_loop(self, stop: CancellationToken) {
        let mut backoff = self.backoff();

        loop {
            let Some(session) = self.session(&stop).await else { break };
            self.refresh_backoff(&mut backoff);

            let wait = match self.deliver_round(&session, backoff.attempts()).await {
                Ok(n) if n > 0 => {
                    if backoff.attempts() > 0 {
                        info!("Delivery resumed after {} failed attempts", backoff.attempts());
                    }
                    backoff.reset();
                    continue;
                }
                Ok(_) => {
                    backoff.reset();
                    // Idle: look again after the base delay
                    self.inner.config.borrow().backoff_base
                }
                Err(e) => self.after_failure(&session, "delivery", e, &mut backoff),
            };

            if pause(&stop, wait).await {
                break;
            }
        }
        debug!("Outbound loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::rig;
    use super::*;
    use crate::records::{LogEntry, MetricCategory, MetricSample};
    use chrono::Utc;
    use std::time::Duration;

    fn sample(n: u64) -> MetricSample {
        MetricSample {
            timestamp: Utc::now(),
            device_id: "dev-fake".to_string(),
            category: MetricCategory::Cpu,
            value: serde_json::json!({ "n": n }),
        }
    }

    #[tokio::test]
    async fn test_delivery_is_fifo_per_category() {
        let rig = rig();
        let session = rig.registered().await;
        rig.config.send_modify(|c| c.batch_size = 2);
        for n in 0..5 {
            rig.store.put_json(Category::Metrics, &sample(n)).unwrap();
        }
        rig.store.log(&LogEntry::info("test", "hello")).unwrap();

        let mut total = 0;
        while rig.store.pending_count(Category::Metrics).unwrap() > 0 {
            total += rig.comms.deliver_round(&session, 0).await.unwrap();
        }
        // Registration audit entry plus the test entry
        assert!(total >= 6);

        let order: Vec<u64> = rig
            .plane
            .delivered
            .lock()
            .iter()
            .filter(|b| b.category == Category::Metrics)
            .flat_map(|b| b.records.iter().map(|r| r.payload["value"]["n"].as_u64().unwrap()))
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(rig.store.pending_count(Category::Logs).unwrap(), 0);
        assert_eq!(rig.comms.link_status().state, super::super::LinkState::Online);
    }

    #[tokio::test]
    async fn test_only_acknowledged_records_leave_the_queue() {
        let rig = rig();
        let session = rig.registered().await;
        for n in 0..3 {
            rig.store.put_json(Category::Metrics, &sample(n)).unwrap();
        }
        *rig.plane.accept_limit.lock() = Some(1);

        rig.comms.deliver_round(&session, 0).await.unwrap();
        assert_eq!(rig.store.pending_count(Category::Metrics).unwrap(), 2);

        let next = rig.store.fetch_pending(Category::Metrics, 10).unwrap();
        let first: MetricSample = next[0].json().unwrap();
        assert_eq!(first.value["n"], 1);
    }

    #[tokio::test]
    async fn test_gap_in_ack_keeps_later_records_queued() {
        let rig = rig();
        let session = rig.registered().await;
        rig.store.log(&LogEntry::info("test", "drain")).unwrap();
        rig.comms.deliver_round(&session, 0).await.unwrap();
        rig.plane.delivered.lock().clear();

        for n in 0..3 {
            rig.store.put_json(Category::Metrics, &sample(n)).unwrap();
        }
        *rig.plane.skip_first.lock() = true;

        rig.comms.deliver_round(&session, 0).await.unwrap();
        assert_eq!(rig.store.pending_count(Category::Metrics).unwrap(), 3);
        rig.comms.deliver_round(&session, 0).await.unwrap();
        assert_eq!(rig.store.pending_count(Category::Metrics).unwrap(), 0);

        let batches: Vec<Vec<u64>> = rig
            .plane
            .delivered
            .lock()
            .iter()
            .filter(|b| b.category == Category::Metrics)
            .map(|b| b.records.iter().map(|r| r.payload["value"]["n"].as_u64().unwrap()).collect())
            .collect();
        assert_eq!(batches, vec![vec![0, 1, 2], vec![0, 1, 2]]);
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_records_and_journals() {
        let rig = rig();
        let session = rig.registered().await;
        rig.store.put_json(Category::Metrics, &sample(0)).unwrap();
        rig.plane.fail_next("deliver", CommsError::Transient("timeout".to_string()));

        assert!(rig.comms.deliver_round(&session, 3).await.is_err());
        assert_eq!(rig.store.pending_count(Category::Metrics).unwrap(), 1);

        let journal: Vec<CommunicationLogEntry> = rig
            .store
            .fetch_pending(Category::Communication, 50)
            .unwrap()
            .iter()
            .map(|r| r.json().unwrap())
            .collect();
        let failed = journal.iter().find(|e| e.outcome == "failed").unwrap();
        assert_eq!(failed.retry_count, 3);
        assert_eq!(failed.endpoint, "telemetry");
    }

    #[tokio::test]
    async fn test_outbound_loop_retries_until_delivered() {
        let rig = rig();
        rig.registered().await;
        rig.store.put_json(Category::Metrics, &sample(7)).unwrap();
        rig.plane.fail_next("deliver", CommsError::Transient("refused".to_string()));
        rig.plane.fail_next("deliver", CommsError::Transient("refused".to_string()));

        let stop = CancellationToken::new();
        let task = tokio::spawn(rig.comms.clone().outbound_loop(stop.clone()));
        for _ in 0..100 {
            if rig.store.pending_count(Category::Metrics).unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        stop.cancel();
        task.await.unwrap();

        assert_eq!(rig.store.pending_count(Category::Metrics).unwrap(), 0);
        assert!(rig.plane.calls("deliver") >= 3);
    }
}
