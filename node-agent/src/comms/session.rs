//! Session key rotation

use super::{pause, CommsError, CommunicationManager, Session, SOURCE};
use crate::records::{CommunicationLogEntry, Direction, LogEntry};
use crate::store::crypto::random_token;
use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest sleep between rotation checks, so config changes are picked up
const ROTATION_CHECK: Duration = Duration::from_secs(60);
const SESSION_KEY_BYTES: usize = 32;

fn chrono_duration(d: Duration, fallback_secs: i64) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(fallback_secs))
}

impl CommunicationManager {
    /// Replace the session key. The new key is staged, confirmed with the
    /// control plane under the current key, and only then promoted; the
    /// data store's encryption key is rotated alongside. On any failure
    /// before promotion the current key stays in use.
    pub async fn rotate_session(&self, session: &Session) -> Result<Session, CommsError> {
        let store = &self.inner.store;
        let new_key = random_token(SESSION_KEY_BYTES);
        store.stage_session_key(&new_key)?;

        if let Err(e) = self.inner.plane.confirm_rotation(session, &new_key).await {
            self.journal(CommunicationLogEntry::new(Direction::Outbound, "rotate-key", "failed").detail(e.to_string()));
            if let Err(abort) = store.abort_session_key() {
                warn!("Could not discard staged session key: {}", abort);
            }
            return Err(e);
        }

        let grace = chrono_duration(self.inner.config.borrow().rotation_grace, 3600);
        let credential = store.confirm_session_key(grace)?;
        let data_key = store.rotate_key()?;

        self.journal(
            CommunicationLogEntry::new(Direction::Outbound, "rotate-key", "rotated")
                .detail(format!("generation {}", credential.key_generation)),
        );
        self.audit(LogEntry::info(
            SOURCE,
            format!(
                "session key rotated to generation {}, data key {} active",
                credential.key_generation, data_key
            ),
        ));
        Ok(Session::from(&credential))
    }

    pub(super) async fn rotation_loop(self, stop: CancellationToken) {
        let mut backoff = self.backoff();

        loop {
            let Some(session) = self.session(&stop).await else { break };
            self.refresh_backoff(&mut backoff);

            let wait = match self.inner.store.credential() {
                Ok(Some(credential)) => {
                    if credential.pending_key.is_some() {
                        // Left staged by an interrupted rotation
                        warn!("Discarding session key staged by an interrupted rotation");
                        if let Err(e) = self.inner.store.abort_session_key() {
                            self.storage_fault(&e);
                        }
                    }
                    let period = chrono_duration(self.inner.config.borrow().rotation_period, 86_400);
                    let now = Utc::now();

                    if credential.rotation_due(period, now) {
                        match self.rotate_session(&session).await {
                            Ok(rotated) => {
                                info!("Session key rotated (generation {})", rotated.key_generation);
                                backoff.reset();
                                continue;
                            }
                            Err(e) => self.after_failure(&session, "session rotation", e, &mut backoff),
                        }
                    } else {
                        (credential.rotated_at + period - now)
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                            .min(ROTATION_CHECK)
                    }
                }
                Ok(None) => ROTATION_CHECK,
                Err(e) => {
                    self.storage_fault(&e);
                    backoff.next_delay()
                }
            };

            if pause(&stop, wait).await {
                break;
            }
        }
        debug!("Rotation loop stopped");
    }
}
