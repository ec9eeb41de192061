/**
 * RÉSOLUTION DES ENDPOINTS - inventaire d'abord, variables d'environnement ensuite
 *
 * ORDRE STRICT :
 * 1. Groupe du domaine dans l'inventaire (ansible_host ou nom + port du domaine)
 * 2. Si zéro hôte : env, forme nommée `PREFIX_<NAME>_ENDPOINT` puis forme indexée
 *    `PREFIX_<N>_NAME` / `PREFIX_<N>_ENDPOINT` ; un endpoint déjà fourni par la forme
 *    nommée supprime l'entrée indexée correspondante.
 *
 * La table est reconstruite en entier à chaque passe, jamais modifiée en place.
 */

use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{GroupNames, KernelConfig};
use crate::env::EnvSnapshot;
use crate::inventory::{load_inventory, normalize, Inventory, MergePolicy};
use crate::models::{
    value_to_string, Credentials, EndpointRecord, EndpointSource, EndpointTable, PingTable, PingTarget, ResolvedHost,
    ServiceKind, UpsDevice,
};
use crate::remote::{strip_port, with_port};

/// Description d'un domaine de service : groupe, port, préfixe env.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDomain {
    pub kind: ServiceKind,
    pub env_prefix: &'static str,
    pub port_var: &'static str,
    pub default_port: u16,
    /// variable d'env qui remplace `default_port` (`OLLAMA_PORT`, `NUT_PORT`)
    pub port_env: Option<&'static str>,
    /// suffixes acceptés pour la forme nommée
    pub named_suffixes: &'static [&'static str],
    /// nom par défaut des entrées indexées sans `_NAME`
    pub label: &'static str,
}

pub const DOCKER: ServiceDomain = ServiceDomain {
    kind: ServiceKind::Docker,
    env_prefix: "DOCKER",
    port_var: "docker_api_port",
    default_port: 2375,
    port_env: None,
    named_suffixes: &["ENDPOINT"],
    label: "docker",
};

pub const PODMAN: ServiceDomain = ServiceDomain {
    kind: ServiceKind::Podman,
    env_prefix: "PODMAN",
    port_var: "podman_api_port",
    default_port: 8080,
    port_env: None,
    named_suffixes: &["ENDPOINT"],
    label: "podman",
};

pub const OLLAMA: ServiceDomain = ServiceDomain {
    kind: ServiceKind::Ollama,
    env_prefix: "OLLAMA",
    port_var: "ollama_port",
    default_port: 11434,
    port_env: Some("OLLAMA_PORT"),
    named_suffixes: &["ENDPOINT"],
    label: "ollama",
};

pub const PIHOLE: ServiceDomain = ServiceDomain {
    kind: ServiceKind::Pihole,
    env_prefix: "PIHOLE",
    port_var: "pihole_port",
    default_port: 80,
    port_env: None,
    named_suffixes: &["ENDPOINT", "HOST"],
    label: "pihole",
};

pub const NUT: ServiceDomain = ServiceDomain {
    kind: ServiceKind::Nut,
    env_prefix: "NUT",
    port_var: "nut_port",
    default_port: 3493,
    port_env: Some("NUT_PORT"),
    named_suffixes: &["ENDPOINT", "HOST"],
    label: "nut",
};

impl ServiceDomain {
    /// Port appliqué quand ni l'adresse ni l'hôte n'en donnent un.
    pub fn fallback_port(&self, env: &EnvSnapshot) -> u16 {
        self.port_env
            .and_then(|key| env.get(key))
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(self.default_port)
    }
}

pub const PING_ENV_GROUP: &str = "env_targets";

/// Tout ce qu'une passe de résolution lit : chemin d'inventaire, politique de fusion,
/// noms de groupes effectifs et instantané d'environnement.
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub inventory_path: Option<PathBuf>,
    pub merge_policy: MergePolicy,
    pub groups: GroupNames,
    pub env: Arc<EnvSnapshot>,
}

impl ResolutionContext {
    /// Applique les surcharges env (`ANSIBLE_INVENTORY_PATH`, `*_ANSIBLE_GROUP`...).
    pub fn from_config(cfg: &KernelConfig, env: Arc<EnvSnapshot>) -> Self {
        let inventory_path = env
            .get("ANSIBLE_INVENTORY_PATH")
            .map(PathBuf::from)
            .or_else(|| cfg.inventory_path.clone());

        let pick = |key: &str, current: &str| env.get(key).unwrap_or(current).to_string();
        let groups = GroupNames {
            docker: pick("DOCKER_ANSIBLE_GROUP", &cfg.groups.docker),
            podman: pick("PODMAN_ANSIBLE_GROUP", &cfg.groups.podman),
            ollama: pick("OLLAMA_INVENTORY_GROUP", &cfg.groups.ollama),
            pihole: pick("PIHOLE_ANSIBLE_GROUP", &cfg.groups.pihole),
            nut: pick("NUT_ANSIBLE_GROUP", &cfg.groups.nut),
        };

        Self { inventory_path, merge_policy: cfg.merge_policy, groups, env }
    }

    pub fn load_inventory(&self) -> Inventory {
        load_inventory(self.inventory_path.as_deref(), self.merge_policy)
    }

    pub fn group_for(&self, kind: ServiceKind) -> &str {
        match kind {
            ServiceKind::Docker => &self.groups.docker,
            ServiceKind::Podman => &self.groups.podman,
            ServiceKind::Ollama => &self.groups.ollama,
            ServiceKind::Pihole => &self.groups.pihole,
            ServiceKind::Nut => &self.groups.nut,
        }
    }
}

/// Relit l'inventaire puis résout le domaine.
pub fn resolve_endpoints(domain: &ServiceDomain, ctx: &ResolutionContext) -> EndpointTable {
    let inv = ctx.load_inventory();
    resolve_with_inventory(domain, ctx, &inv)
}

pub fn resolve_with_inventory(domain: &ServiceDomain, ctx: &ResolutionContext, inv: &Inventory) -> EndpointTable {
    let from_inventory = endpoints_from_inventory(domain, ctx, inv);
    if !from_inventory.is_empty() {
        info!(domain = domain.label, count = from_inventory.len(), "endpoints resolved from inventory");
        return from_inventory;
    }

    let from_env = endpoints_from_env(domain, &ctx.env);
    info!(domain = domain.label, count = from_env.len(), "endpoints resolved from environment");
    from_env
}

pub fn endpoints_from_inventory(domain: &ServiceDomain, ctx: &ResolutionContext, inv: &Inventory) -> EndpointTable {
    let group = ctx.group_for(domain.kind);
    let Some(hosts) = inv.group_hosts(group) else {
        debug!(domain = domain.label, group, "group absent from inventory");
        return EndpointTable::new();
    };

    let mut table = EndpointTable::new();
    for host in hosts {
        let display_name = host.display_name();
        if table.contains_key(&display_name) {
            continue;
        }
        let port = host_port(domain, host, &ctx.env);
        let mut record = EndpointRecord::new(
            display_name.clone(),
            with_port(&host.address(), port),
            domain.kind,
            EndpointSource::Inventory,
        );
        record.credentials = credentials_for(domain.kind, &display_name, Some(host), &ctx.env);
        if domain.kind == ServiceKind::Nut {
            record.devices = ups_devices(host.variables.get("ups_devices"));
        }
        table.insert(display_name, record);
    }
    table
}

fn host_port(domain: &ServiceDomain, host: &ResolvedHost, env: &EnvSnapshot) -> u16 {
    if let Some(port) = host.var_str(domain.port_var).and_then(|p| p.parse().ok()) {
        return port;
    }
    domain.fallback_port(env)
}

pub fn endpoints_from_env(domain: &ServiceDomain, env: &EnvSnapshot) -> EndpointTable {
    let prefix = format!("{}_", domain.env_prefix);
    let suffixes = domain.named_suffixes.join("|");
    let named_re = Regex::new(&format!("^{}_([A-Z0-9_]+?)_({suffixes})$", domain.env_prefix));
    let indexed_re = Regex::new(&format!("^{}_([0-9]+)_ENDPOINT$", domain.env_prefix));
    let (Ok(named_re), Ok(indexed_re)) = (named_re, indexed_re) else {
        return EndpointTable::new();
    };

    let mut table = EndpointTable::new();
    let mut seen_addresses = BTreeSet::new();

    // forme nommée d'abord : elle gagne sur l'indexée pour un même endpoint
    for (key, value) in env.with_prefix(&prefix) {
        let Some(caps) = named_re.captures(key) else { continue };
        let raw_name = &caps[1];
        if raw_name.chars().all(|c| c.is_ascii_digit()) || is_reserved_name(raw_name) {
            continue;
        }
        let port = env
            .get(&format!("{}_{raw_name}_PORT", domain.env_prefix))
            .and_then(|p| p.parse().ok())
            .unwrap_or_else(|| domain.fallback_port(env));
        let address = with_port(value.trim(), port);
        let display_name = normalize(raw_name);
        if table.contains_key(&display_name) {
            continue;
        }
        seen_addresses.insert(address.clone());
        table.insert(display_name.clone(), env_record(domain, display_name, address, env));
    }

    let mut indexed: BTreeMap<u32, (&str, &str)> = BTreeMap::new();
    for (key, value) in env.with_prefix(&prefix) {
        let Some(caps) = indexed_re.captures(key) else { continue };
        if let Ok(n) = caps[1].parse::<u32>() {
            indexed.insert(n, (key, value));
        }
    }
    for (n, (_, value)) in indexed {
        let address = with_port(value.trim(), domain.fallback_port(env));
        if seen_addresses.contains(&address) {
            debug!(domain = domain.label, index = n, "indexed endpoint shadowed by named entry");
            continue;
        }
        let display_name = env
            .get(&format!("{}_{n}_NAME", domain.env_prefix))
            .map(normalize)
            .unwrap_or_else(|| format!("{}-server{n}", domain.label));
        if table.contains_key(&display_name) {
            continue;
        }
        seen_addresses.insert(address.clone());
        table.insert(display_name.clone(), env_record(domain, display_name, address, env));
    }
    table
}

// segments qui appartiennent à d'autres conventions (`PIHOLE_API_KEY_*`, `*_ANSIBLE_GROUP`)
fn is_reserved_name(raw_name: &str) -> bool {
    raw_name.starts_with("API_KEY") || raw_name.starts_with("ANSIBLE")
}

fn env_record(domain: &ServiceDomain, display_name: String, address: String, env: &EnvSnapshot) -> EndpointRecord {
    let mut record = EndpointRecord::new(display_name.clone(), address, domain.kind, EndpointSource::Env);
    record.credentials = credentials_for(domain.kind, &display_name, None, env);
    if domain.kind == ServiceKind::Nut {
        record.devices = vec![UpsDevice::named("ups")];
    }
    record
}

/// Pi-hole : variable d'hôte, sinon `PIHOLE_API_KEY_<NAME>`. NUT : `nut_username`/`nut_password`,
/// sinon `NUT_USERNAME`/`NUT_PASSWORD`.
pub fn credentials_for(
    kind: ServiceKind,
    display_name: &str,
    host: Option<&ResolvedHost>,
    env: &EnvSnapshot,
) -> Option<Credentials> {
    let host_var = |key: &str| host.and_then(|h| h.var_str(key));
    match kind {
        ServiceKind::Pihole => {
            let env_key = format!("PIHOLE_API_KEY_{}", display_name.to_uppercase().replace('-', "_"));
            let secret = host_var("pihole_api_key")
                .or_else(|| host_var("pihole_password"))
                .or_else(|| env.get(&env_key).map(str::to_string))?;
            Some(Credentials { username: None, secret })
        }
        ServiceKind::Nut => {
            let username = host_var("nut_username").or_else(|| env.get("NUT_USERNAME").map(str::to_string));
            let secret = host_var("nut_password").or_else(|| env.get("NUT_PASSWORD").map(str::to_string));
            match (username, secret) {
                (None, None) => None,
                (username, secret) => Some(Credentials { username, secret: secret.unwrap_or_default() }),
            }
        }
        _ => None,
    }
}

/// `ups_devices` : chaîne, liste de chaînes ou liste de `{name, description}` ; défaut `ups`.
pub fn ups_devices(raw: Option<&Value>) -> Vec<UpsDevice> {
    let devices = match raw {
        Some(Value::String(name)) => vec![UpsDevice::named(name.as_str())],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(name) => Some(UpsDevice::named(name.as_str())),
                Value::Object(obj) => obj.get("name").and_then(value_to_string).map(|name| UpsDevice {
                    name,
                    description: obj.get("description").and_then(value_to_string),
                }),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    if devices.is_empty() {
        vec![UpsDevice::named("ups")]
    } else {
        devices
    }
}

/// Cibles ping : tout l'inventaire, sinon `PING_TARGET<N>` / `PING_TARGET<N>_NAME`.
pub fn resolve_ping_targets(ctx: &ResolutionContext) -> PingTable {
    let inv = ctx.load_inventory();
    let table = ping_targets_from_inventory(&inv);
    if !table.is_empty() {
        info!(count = table.targets.len(), "ping targets resolved from inventory");
        return table;
    }
    let table = ping_targets_from_env(&ctx.env);
    info!(count = table.targets.len(), "ping targets resolved from environment");
    table
}

pub fn ping_targets_from_inventory(inv: &Inventory) -> PingTable {
    let mut table = PingTable::default();
    for host in inv.ordered_hosts() {
        let display_name = host.display_name();
        if table.targets.contains_key(&display_name) {
            continue;
        }
        let raw = host
            .var_str("ansible_host")
            .or_else(|| host.var_str("static_ip"))
            .unwrap_or_else(|| host.name.clone());
        let groups = host.group_leaves();
        table.targets.insert(
            display_name.clone(),
            PingTarget { display_name, address: strip_port(&raw).to_string(), groups },
        );
    }

    // membres transitifs : un groupe parent (et `all`) couvre les hôtes de ses enfants
    let leaves: BTreeSet<&str> = inv.groups.values().map(|g| g.name.as_str()).collect();
    for leaf in leaves {
        let Some(hosts) = inv.group_hosts(leaf) else { continue };
        let mut members: Vec<String> = Vec::new();
        for host in hosts {
            let name = host.display_name();
            if !members.contains(&name) {
                members.push(name);
            }
        }
        if !members.is_empty() {
            table.groups.insert(leaf.to_string(), members);
        }
    }
    table
}

pub fn ping_targets_from_env(env: &EnvSnapshot) -> PingTable {
    let Ok(target_re) = Regex::new(r"^PING_TARGET([0-9]+)$") else {
        return PingTable::default();
    };
    let mut indexed: BTreeMap<u32, &str> = BTreeMap::new();
    for (key, value) in env.with_prefix("PING_TARGET") {
        let Some(caps) = target_re.captures(key) else { continue };
        if let Ok(n) = caps[1].parse::<u32>() {
            indexed.insert(n, value);
        }
    }

    let mut table = PingTable::default();
    for (n, value) in indexed {
        let address = strip_port(value.trim()).to_string();
        let display_name = env
            .get(&format!("PING_TARGET{n}_NAME"))
            .map(normalize)
            .unwrap_or_else(|| normalize(&address));
        if table.targets.contains_key(&display_name) {
            continue;
        }
        table.groups.entry(PING_ENV_GROUP.to_string()).or_default().push(display_name.clone());
        table.targets.insert(
            display_name.clone(),
            PingTarget { display_name, address, groups: vec![PING_ENV_GROUP.to_string()] },
        );
    }
    table
}
