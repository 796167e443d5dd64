//! Command intake loop

use super::commands::{validate, Execution};
use super::protocol::{CommandReport, InboundCommand};
use super::{pause, CommsError, CommunicationManager, Session, SOURCE};
use crate::records::{CommunicationLogEntry, Direction, LogEntry};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reports kept for commands the control plane may resend
const RECENT_COMMANDS: usize = 128;

/// Recently executed commands and what was reported for them
#[derive(Default)]
pub struct RecentCommands {
    reports: VecDeque<CommandReport>,
}

impl RecentCommands {
    fn get(&self, command_id: &str) -> Option<&CommandReport> {
        self.reports.iter().find(|r| r.command_id == command_id)
    }

    fn remember(&mut self, report: CommandReport) {
        if self.reports.len() == RECENT_COMMANDS {
            self.reports.pop_front();
        }
        self.reports.push_back(report);
    }
}

impl CommunicationManager {
    async fn execute(&self, command: &InboundCommand) -> CommandReport {
        let permitted = self.inner.config.borrow().permitted_actions.clone();
        let execution = match validate(command, &permitted) {
            Ok(typed) => {
                info!("Executing command {} ({})", command.command_id, command.action);
                self.inner.dispatcher.execute(typed).await
            }
            Err(e) => {
                warn!("Rejected command {} ({}): {}", command.command_id, command.action, e);
                self.audit(LogEntry::warn(
                    SOURCE,
                    format!("rejected command {} ({}): {}", command.command_id, command.action, e),
                ));
                Execution::rejected(e.to_string())
            }
        };
        execution.report(&command.command_id)
    }

    /// Fetch pending commands, execute each once, report every outcome
    pub async fn poll_once(&self, session: &Session, recent: &mut RecentCommands) -> Result<usize, CommsError> {
        let commands = match self.inner.plane.poll_commands(session).await {
            Ok(commands) => commands,
            Err(e) => {
                self.journal(CommunicationLogEntry::new(Direction::Inbound, "commands", "failed").detail(e.to_string()));
                return Err(e);
            }
        };
        self.mark_online(false);
        let count = commands.len();

        for command in commands {
            let report = match recent.get(&command.command_id) {
                Some(report) => {
                    debug!("Command {} already executed, resending result", command.command_id);
                    report.clone()
                }
                None => {
                    let report = self.execute(&command).await;
                    recent.remember(report.clone());
                    report
                }
            };

            let mut entry = CommunicationLogEntry::new(
                Direction::Inbound,
                format!("commands/{}", command.command_id),
                report.status.as_str(),
            )
            .detail(command.action.clone());
            if let Some(detail) = &report.detail {
                entry = entry.detail(format!("{}: {}", command.action, detail));
            }
            self.journal(entry);

            self.inner.plane.report_command(session, &report).await?;
        }
        Ok(count)
    }

    pub(super) async fn inbound_loop(self, stop: CancellationToken) {
        let mut backoff = self.backoff();
        let mut recent = RecentCommands::default();

        loop {
            let Some(session) = self.session(&stop).await else { break };
            self.refresh_backoff(&mut backoff);

            let wait = match self.poll_once(&session, &mut recent).await {
                Ok(_) => {
                    backoff.reset();
                    self.inner.config.borrow().command_poll_interval
                }
                Err(e) => self.after_failure(&session, "command poll", e, &mut backoff),
            };

            if pause(&stop, wait).await {
                break;
            }
        }
        debug!("Inbound loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::super::commands::ControlRequest;
    use super::super::protocol::CommandStatus;
    use super::super::testing::rig;
    use super::*;
    use crate::config::ConfigChange;
    use serde_json::{json, Value};

    fn command(id: &str, action: &str, target: Option<&str>, parameters: Value) -> InboundCommand {
        InboundCommand {
            command_id: id.to_string(),
            action: action.to_string(),
            target: target.map(str::to_string),
            parameters,
            issued_at: None,
        }
    }

    #[tokio::test]
    async fn test_invalid_commands_rejected_and_reported() {
        let mut rig = rig();
        let session = rig.registered().await;
        rig.config.send_modify(|c| {
            c.permitted_actions = ["agent.status".to_string()].into();
        });
        rig.plane.pending_commands.lock().extend([
            command("c1", "module.stop", Some("x"), Value::Null),
            command("c2", "shell.exec", None, json!({"cmd": "rm -rf /"})),
        ]);

        let mut recent = RecentCommands::default();
        assert_eq!(rig.comms.poll_once(&session, &mut recent).await.unwrap(), 2);

        let reports = rig.plane.reports.lock().clone();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.status == CommandStatus::Rejected));
        assert!(rig.control.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_config_update_routed_to_coordinator_once() {
        let rig = rig();
        let session = rig.registered().await;
        let update = command("c9", "config.update", None, json!({"sampling.interval_secs": "30"}));
        rig.plane.pending_commands.lock().push(update.clone());

        let mut control = rig.control;
        let responder = tokio::spawn(async move {
            let request = control.recv().await.unwrap();
            let ControlRequest::UpdateConfig { changes, source, reply } = request else {
                panic!("unexpected request");
            };
            assert_eq!(changes["sampling.interval_secs"], "30");
            assert_eq!(source, "control-plane");
            reply
                .send(Ok(ConfigChange {
                    version: 2,
                    changed: vec!["sampling.interval_secs".to_string()],
                }))
                .unwrap();
            control
        });

        let mut recent = RecentCommands::default();
        rig.comms.poll_once(&session, &mut recent).await.unwrap();
        let mut control = responder.await.unwrap();

        // Resent by the control plane: reported again, not executed again
        rig.plane.pending_commands.lock().push(update);
        rig.comms.poll_once(&session, &mut recent).await.unwrap();
        assert!(control.try_recv().is_err());

        let reports = rig.plane.reports.lock().clone();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0], reports[1]);
        assert_eq!(reports[0].status, CommandStatus::Accepted);
        assert_eq!(reports[0].result.as_ref().unwrap()["version"], 2);
    }

    #[tokio::test]
    async fn test_module_command_failure_reported() {
        let rig = rig();
        let session = rig.registered().await;
        rig.plane
            .pending_commands
            .lock()
            .push(command("c3", "module.stop", Some("ghost"), Value::Null));

        let mut recent = RecentCommands::default();
        rig.comms.poll_once(&session, &mut recent).await.unwrap();

        let reports = rig.plane.reports.lock().clone();
        assert_eq!(reports[0].status, CommandStatus::Rejected);
        assert!(reports[0].detail.as_ref().unwrap().contains("ghost"));
    }
}
