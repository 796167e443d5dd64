//! End-to-end flows against the in-memory control plane

use node_agent::comms::protocol::CommandStatus;
use node_agent::comms::LinkState;
use node_agent::modules::ModuleState;
use node_agent::records::Category;
use node_agent_devkit::fixtures::{
    config_command, crashing_module, deploy_command, forbidden_module, long_running_module, stop_command,
};
use node_agent_devkit::test_utils::wait_until;
use node_agent_devkit::TestHarness;
use serde_json::Value;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(20);

fn cpu_samples(payloads: &[Value]) -> Vec<u64> {
    payloads
        .iter()
        .filter(|p| p["category"] == "cpu")
        .filter_map(|p| p["value"]["sample"].as_u64())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_registers_from_token_file() {
    let harness = TestHarness::new().unwrap();
    let agent = harness.start().await.unwrap();
    assert_eq!(agent.comms().link_status().state, LinkState::Unregistered);

    harness.drop_token("devkit-token-1").unwrap();
    let state = agent.state().clone();
    assert!(wait_until(WAIT, || state.device_id.borrow().is_some()).await);

    assert_eq!(state.device_id.borrow().as_deref(), Some("stub-device"));
    let registrations = harness.plane.registrations();
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].system_info["hostname"], "devkit-host");
    assert!(!harness.token_file().exists());

    agent.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_offline_buffering_delivers_in_order() {
    let harness = TestHarness::new().unwrap();
    let agent = harness.start().await.unwrap();
    harness.drop_token("devkit-token-2").unwrap();

    let plane = harness.plane.clone();
    assert!(wait_until(WAIT, || !cpu_samples(&plane.delivered(Category::Metrics)).is_empty()).await);

    plane.set_online(false);
    let before = cpu_samples(&plane.delivered(Category::Metrics)).len();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(cpu_samples(&plane.delivered(Category::Metrics)).len(), before);
    assert!(agent.state().store.pending_count(Category::Metrics).unwrap() > 0);
    assert_eq!(agent.comms().link_status().state, LinkState::Offline);

    plane.set_online(true);
    assert!(wait_until(WAIT, || cpu_samples(&plane.delivered(Category::Metrics)).len() >= before + 2).await);

    let samples = cpu_samples(&plane.delivered(Category::Metrics));
    assert!(samples.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", samples);
    let comms = agent.comms().clone();
    assert!(wait_until(WAIT, || comms.link_status().state == LinkState::Online).await);

    agent.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_revoked_key_requires_new_token() {
    let harness = TestHarness::new().unwrap();
    let agent = harness.start().await.unwrap();
    harness.drop_token("devkit-token-3").unwrap();

    let comms = agent.comms().clone();
    assert!(wait_until(WAIT, || comms.link_status().state == LinkState::Online).await);

    harness.plane.revoke_current_key();
    assert!(wait_until(WAIT, || comms.link_status().state == LinkState::ReauthRequired).await);

    harness.drop_token("devkit-token-4").unwrap();
    assert!(wait_until(WAIT, || comms.link_status().state == LinkState::Online).await);

    let credential = agent.state().store.credential().unwrap().unwrap();
    assert_eq!(credential.device_id, "stub-device");
    assert_eq!(credential.session_key, "stub-key-2");
    assert_eq!(harness.plane.registrations()[1].device_id.as_deref(), Some("stub-device"));

    agent.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inbound_commands_drive_modules_and_config() {
    let harness = TestHarness::new().unwrap();
    let agent = harness.start().await.unwrap();
    harness.drop_token("devkit-token-5").unwrap();

    let plane = harness.plane.clone();
    plane.queue_command(deploy_command("cmd-1", &long_running_module("worker")));
    plane.queue_command(deploy_command("cmd-2", &forbidden_module("wiper")));
    plane.queue_command(config_command("cmd-3", &[("sampling.interval_secs", "7")]));

    assert!(wait_until(WAIT, || plane.reports().len() >= 3).await);
    assert_eq!(plane.report_for("cmd-1").unwrap().status, CommandStatus::Accepted);
    assert_eq!(plane.report_for("cmd-2").unwrap().status, CommandStatus::Rejected);
    assert_eq!(plane.report_for("cmd-3").unwrap().status, CommandStatus::Accepted);
    assert_eq!(agent.state().runtime_config().sampling_interval, Duration::from_secs(7));

    let modules = agent.state().modules.list().await.unwrap();
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].state, ModuleState::Running);

    plane.queue_command(stop_command("cmd-4", "worker"));
    assert!(wait_until(WAIT, || plane.report_for("cmd-4").is_some()).await);
    let modules = agent.state().modules.list().await.unwrap();
    assert_eq!(modules[0].state, ModuleState::Stopped);

    agent.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crashing_module_restarts_are_bounded() {
    let harness = TestHarness::new().unwrap().with_config("modules.max_restarts", "2");
    let agent = harness.start().await.unwrap();

    let modules = agent.state().modules.clone();
    modules.deploy(crashing_module("crasher")).await.unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let records = modules.list().await.unwrap();
        if records[0].state == ModuleState::Failed && records[0].restart_count == 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "restarts not exhausted: {:?}", records[0]);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    let record = modules.list().await.unwrap().remove(0);
    assert_eq!(record.state, ModuleState::Failed);
    assert_eq!(record.restart_count, 2);

    agent.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_keeps_credential_and_modules() {
    let harness = TestHarness::new().unwrap();
    let agent = harness.start().await.unwrap();
    harness.drop_token("devkit-token-6").unwrap();

    let state = agent.state().clone();
    assert!(wait_until(WAIT, || state.device_id.borrow().is_some()).await);
    state.modules.deploy(long_running_module("keeper")).await.unwrap();

    agent.run(async {}).await.unwrap();
    drop(state);

    let store = harness.open_store().unwrap();
    assert!(store.credential().unwrap().is_some());
    assert!(store.verify_integrity().unwrap().quarantined == 0);
    drop(store);

    let agent = harness.start().await.unwrap();
    assert_eq!(agent.state().device_id.borrow().as_deref(), Some("stub-device"));
    let modules = agent.state().modules.list().await.unwrap();
    assert_eq!(modules[0].module_id, "keeper");
    assert_eq!(harness.plane.registrations().len(), 1);

    agent.shutdown().await.unwrap();
}
