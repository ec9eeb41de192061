/**
 * ENVIRONNEMENT - vue figée des variables utilisées par la résolution
 *
 * FONCTIONNEMENT :
 * - Capturé une seule fois au démarrage : env du process + entrées autorisées du .env
 * - Injecté dans la résolution, qui ne lit jamais std::env directement
 */

use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Préfixes reconnus ; toute autre variable est ignorée.
pub const ALLOWED_PREFIXES: &[&str] = &[
    "DOCKER_", "PODMAN_", "PING_", "OLLAMA_", "LITELLM_", "PIHOLE_", "UNIFI_", "NUT_", "ANSIBLE_", "HOMELAB_",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| is_allowed_key(k))
            .collect();
        Self { vars }
    }

    /// Process env + `.env` optionnel. Le process gagne sur le fichier.
    pub fn capture(dotenv_path: Option<&Path>) -> Self {
        let mut vars = BTreeMap::new();

        if let Some(path) = dotenv_path.filter(|p| p.exists()) {
            match dotenvy::from_path_iter(path) {
                Ok(iter) => {
                    for item in iter {
                        match item {
                            Ok((key, value)) if is_allowed_key(&key) => {
                                vars.insert(key, value);
                            }
                            Ok((key, _)) => debug!(%key, "ignoring non-allowlisted .env entry"),
                            Err(e) => warn!(path = %path.display(), error = %e, "skipping malformed .env line"),
                        }
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "cannot read .env file"),
            }
        }

        for (key, value) in std::env::vars() {
            if is_allowed_key(&key) {
                vars.insert(key, value);
            }
        }

        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str).filter(|v| !v.trim().is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Entrées dont la clé commence par `prefix`, en ordre lexical.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.vars
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

pub fn is_allowed_key(key: &str) -> bool {
    is_valid_key(key) && ALLOWED_PREFIXES.iter().any(|p| key.starts_with(p))
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn unrelated_variables_are_dropped() {
        let env = EnvSnapshot::from_pairs([
            ("DOCKER_CYBER_ENDPOINT", "10.0.0.5:2375"),
            ("PATH", "/usr/bin"),
            ("docker_lower", "x"),
            ("AWS_SECRET", "nope"),
        ]);
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("DOCKER_CYBER_ENDPOINT"), Some("10.0.0.5:2375"));
        assert_eq!(env.get("PATH"), None);
    }

    #[test]
    fn blank_values_read_as_absent() {
        let env = EnvSnapshot::from_pairs([("UNIFI_API_KEY", "  ")]);
        assert_eq!(env.get("UNIFI_API_KEY"), None);
        assert_eq!(env.get_or("UNIFI_API_KEY", "fallback"), "fallback");
    }

    #[test]
    fn prefix_scan_is_bounded() {
        let env = EnvSnapshot::from_pairs([
            ("PIHOLE_DNS1_HOST", "10.0.0.2"),
            ("PING_TARGET1", "10.0.0.1"),
            ("PIHOLE_API_KEY_DNS1", "k"),
        ]);
        let keys: Vec<_> = env.with_prefix("PIHOLE_").map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["PIHOLE_API_KEY_DNS1", "PIHOLE_DNS1_HOST"]);
    }

    #[test]
    fn dotenv_file_is_filtered_by_allowlist() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "OLLAMA_ZEUS_ENDPOINT=10.0.0.9:11434").unwrap();
        writeln!(file, "SOMETHING_ELSE=1").unwrap();
        file.flush().unwrap();

        let env = EnvSnapshot::capture(Some(file.path()));
        assert_eq!(env.get("OLLAMA_ZEUS_ENDPOINT"), Some("10.0.0.9:11434"));
        assert_eq!(env.get("SOMETHING_ELSE"), None);
    }
}
