use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use time::OffsetDateTime;

use crate::inventory::normalize;

/// Variables d'hôte ou de groupe, valeurs YAML converties en JSON.
pub type Vars = BTreeMap<String, Value>;

/// Hôte aplati : variables héritées + chemins de groupes dans l'ordre de découverte.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedHost {
    pub name: String,
    pub variables: Vars,
    pub groups: Vec<String>,
}

impl ResolvedHost {
    pub fn display_name(&self) -> String {
        normalize(&self.name)
    }

    /// Variable rendue en texte (les nombres YAML comme `2375` sont acceptés).
    pub fn var_str(&self, key: &str) -> Option<String> {
        self.variables.get(key).and_then(value_to_string)
    }

    /// `ansible_host` si présent, sinon le nom d'inventaire.
    pub fn address(&self) -> String {
        self.var_str("ansible_host").unwrap_or_else(|| self.name.clone())
    }

    /// Noms de groupes feuilles (dernier segment de chaque chemin), sans doublons.
    pub fn group_leaves(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.groups
            .iter()
            .filter_map(|p| p.rsplit('/').next())
            .filter(|leaf| seen.insert(leaf.to_string()))
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupIndex {
    pub name: String,
    pub path: String,
    pub member_hosts: BTreeSet<String>,
    pub vars: Vars,
    /// Enfant déclaré `null` : le groupe est défini ailleurs dans l'arbre.
    pub declared_empty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Docker,
    Podman,
    Ollama,
    Pihole,
    Nut,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Docker => "docker",
            ServiceKind::Podman => "podman",
            ServiceKind::Ollama => "ollama",
            ServiceKind::Pihole => "pihole",
            ServiceKind::Nut => "nut",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointSource {
    Inventory,
    Env,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub secret: String,
}

// jamais de secret dans les logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsDevice {
    pub name: String,
    pub description: Option<String>,
}

impl UpsDevice {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), description: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointRecord {
    pub display_name: String,
    /// `host:port`
    pub address: String,
    pub kind: ServiceKind,
    pub credentials: Option<Credentials>,
    pub devices: Vec<UpsDevice>,
    pub source: EndpointSource,
}

impl EndpointRecord {
    pub fn new(display_name: impl Into<String>, address: impl Into<String>, kind: ServiceKind, source: EndpointSource) -> Self {
        Self {
            display_name: display_name.into(),
            address: address.into(),
            kind,
            credentials: None,
            devices: Vec::new(),
            source,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.address)
    }
}

/// Table complète d'un domaine, toujours remplacée en bloc.
pub type EndpointTable = BTreeMap<String, EndpointRecord>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub display_name: String,
    pub token: String,
    pub expires_at: OffsetDateTime,
}

impl SessionToken {
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }
}

/// Cible ping : adresse sans port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingTarget {
    pub display_name: String,
    pub address: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingTable {
    pub targets: BTreeMap<String, PingTarget>,
    /// groupe feuille -> display names
    pub groups: BTreeMap<String, Vec<String>>,
}

impl PingTable {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
