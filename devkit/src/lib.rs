/*!
# Node Agent DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le test de l'agent sans control plane réel:
- Control plane en mémoire, scriptable (pannes, rejets, commandes)
- Source de métriques statique
- Fixtures de modules et de commandes
- Harness démarrant un agent complet dans un répertoire temporaire
*/

pub mod control_plane_stub;
pub mod fixtures;
pub mod test_utils;

pub use control_plane_stub::StubControlPlane;
pub use fixtures::StaticMetricSource;
pub use test_utils::TestHarness;
