use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::inventory::MergePolicy;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    /// Fichier d'inventaire Ansible ; écrasé par `ANSIBLE_INVENTORY_PATH`.
    pub inventory_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub listen: String,
    pub merge_policy: MergePolicy,
    pub groups: GroupNames,
    pub unifi: UnifiConf,
    pub litellm: LiteLlmConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct GroupNames {
    pub docker: String,
    pub podman: String,
    pub ollama: String,
    pub pihole: String,
    pub nut: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UnifiConf {
    pub host: String,
    pub site: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LiteLlmConf {
    pub host: String,
    pub port: u16,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            inventory_path: None,
            env_file: Some(PathBuf::from(".env")),
            listen: "0.0.0.0:8080".into(),
            merge_policy: MergePolicy::default(),
            groups: GroupNames::default(),
            unifi: UnifiConf::default(),
            litellm: LiteLlmConf::default(),
        }
    }
}

impl Default for GroupNames {
    fn default() -> Self {
        Self {
            docker: "docker_hosts".into(),
            podman: "podman_hosts".into(),
            ollama: "ollama_servers".into(),
            pihole: "PiHole".into(),
            nut: "nut_servers".into(),
        }
    }
}

impl Default for UnifiConf {
    fn default() -> Self {
        Self { host: "192.168.1.1".into(), site: "default".into(), ttl_seconds: 300 }
    }
}

impl Default for LiteLlmConf {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 4000 }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("HOMELAB_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(Path::new(&path)).await
}

/// N'échoue jamais : fichier absent, vide ou invalide => défauts.
pub async fn load_config_from(path: &Path) -> KernelConfig {
    if !path.exists() {
        info!(path = %path.display(), "no kernel config file, using defaults");
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "invalid kernel config, using defaults");
        KernelConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn missing_file_gives_defaults() {
        let cfg = load_config_from(Path::new("/nonexistent/kernel.yaml")).await;
        assert_eq!(cfg.listen, "0.0.0.0:8080");
        assert_eq!(cfg.groups.pihole, "PiHole");
        assert_eq!(cfg.unifi.ttl_seconds, 300);
        assert_eq!(cfg.merge_policy, MergePolicy::FirstSeen);
    }

    #[tokio::test]
    async fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "merge_policy: most_specific").unwrap();
        writeln!(file, "groups:\n  docker: containers").unwrap();
        writeln!(file, "unifi:\n  host: 10.0.0.1").unwrap();
        file.flush().unwrap();

        let cfg = load_config_from(file.path()).await;
        assert_eq!(cfg.merge_policy, MergePolicy::MostSpecific);
        assert_eq!(cfg.groups.docker, "containers");
        assert_eq!(cfg.groups.ollama, "ollama_servers");
        assert_eq!(cfg.unifi.host, "10.0.0.1");
        assert_eq!(cfg.unifi.site, "default");
    }

    #[tokio::test]
    async fn invalid_yaml_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen: [unterminated").unwrap();
        file.flush().unwrap();

        let cfg = load_config_from(file.path()).await;
        assert_eq!(cfg.listen, "0.0.0.0:8080");
    }
}
