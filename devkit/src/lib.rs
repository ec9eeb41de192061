/*!
# Homelab DevKit - faux services et fixtures pour les tests du kernel

- Faux serveurs locaux (127.0.0.1, port éphémère) : Pi-hole v6, API JSON générique
  (Docker, Ollama), démon NUT
- Fixtures : inventaires Ansible écrits dans des fichiers temporaires, paires d'env
*/

pub mod fakes;
pub mod fixtures;

pub use fakes::{closed_port_address, FakeJsonApi, FakeNut, FakePihole};
pub use fixtures::{env_pairs, write_inventory, SAMPLE_INVENTORY};

/// Logs de test (RUST_LOG), sans effet si déjà initialisé.
pub fn init_test_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}
