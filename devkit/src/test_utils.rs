/*!
Test Harness pour l'agent

Démarre un agent complet dans un répertoire temporaire avec:
- le control plane simulé
- des métriques déterministes
- une configuration d'exécution accélérée pour les tests
*/

use crate::control_plane_stub::StubControlPlane;
use crate::fixtures::StaticMetricSource;
use anyhow::Result;
use node_agent::config::{self, AgentConfig};
use node_agent::store::{MasterKey, SecureDataStore};
use node_agent::Agent;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TEST_KEY: [u8; 32] = [42u8; 32];

/// Réglages rapides appliqués avant le démarrage
pub const FAST_CONFIG: &[(&str, &str)] = &[
    ("sampling.interval_secs", "1"),
    ("commands.poll_interval_secs", "1"),
    ("delivery.backoff_base_secs", "1"),
    ("delivery.backoff_max_secs", "2"),
    ("modules.poll_interval_secs", "1"),
    ("modules.restart_backoff_secs", "1"),
    ("modules.restart_backoff_max_secs", "1"),
    ("modules.stop_grace_secs", "2"),
];

/// Harness de test complet pour l'agent
pub struct TestHarness {
    dir: TempDir,
    pub plane: StubControlPlane,
    pub metrics: Arc<StaticMetricSource>,
    overrides: BTreeMap<String, String>,
}

impl TestHarness {
    /// Crée un nouveau harness de test
    pub fn new() -> Result<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        let overrides = FAST_CONFIG.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();

        Ok(Self {
            dir: tempfile::tempdir()?,
            plane: StubControlPlane::new(),
            metrics: Arc::new(StaticMetricSource::default()),
            overrides,
        })
    }

    /// Surcharge une clé de configuration avant le démarrage
    pub fn with_config(mut self, key: &str, value: &str) -> Self {
        self.overrides.insert(key.to_string(), value.to_string());
        self
    }

    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn bootstrap(&self) -> AgentConfig {
        AgentConfig::with_data_dir(self.dir.path())
    }

    pub fn token_file(&self) -> PathBuf {
        self.bootstrap().token_file()
    }

    /// Dépose un jeton d'enregistrement dans le répertoire de données
    pub fn drop_token(&self, token: &str) -> Result<()> {
        std::fs::write(self.token_file(), token)?;
        log::info!("🎫 Registration token written");
        Ok(())
    }

    /// Ouvre le store directement (agent arrêté)
    pub fn open_store(&self) -> Result<SecureDataStore> {
        let bootstrap = self.bootstrap();
        std::fs::create_dir_all(&bootstrap.agent.data_dir)?;
        Ok(SecureDataStore::open(bootstrap.database_path(), MasterKey::from_bytes(TEST_KEY))?)
    }

    fn seed_config(&self) -> Result<()> {
        let store = self.open_store()?;
        let current = config::load_runtime(&store, &self.bootstrap())?;
        config::apply_changes(&store, &current, &self.overrides, "devkit")?;
        store.flush()?;
        Ok(())
    }

    /// Démarre l'agent sur le control plane simulé
    pub async fn start(&self) -> Result<Agent> {
        self.seed_config()?;
        let agent = Agent::builder(self.bootstrap())
            .control_plane(Arc::new(self.plane.clone()))
            .metric_source(self.metrics.clone())
            .master_key(MasterKey::from_bytes(TEST_KEY))
            .housekeeping_interval(Duration::from_secs(1))
            .start()
            .await?;
        log::info!("🚀 Test agent started in {}", self.dir.path().display());
        Ok(agent)
    }
}

/// Attend qu'une condition devienne vraie, au plus `timeout`
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    log::warn!("⏰ Condition not met within {:?}", timeout);
    false
}
