use regex::RegexBuilder;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::tree::Inventory;
use crate::models::{value_to_string, GroupIndex, ResolvedHost};

/// Nom canonique : minuscules, `_` -> `-`, suffixe de domaine retiré.
pub fn normalize(hostname: &str) -> String {
    let short = hostname.split('.').next().unwrap_or(hostname);
    short.to_lowercase().replace('_', "-")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventorySummary {
    pub total_hosts: usize,
    pub total_groups: usize,
    /// (chemin, nombre de membres), les plus peuplés d'abord
    pub top_groups: Vec<(String, usize)>,
}

impl Inventory {
    /// Chemin exact (`all/docker_hosts` ou `docker_hosts` relatif à `all`), sinon
    /// premier groupe en ordre de parcours dont la clé vaut `name`. Un groupe
    /// déclaré `null` cède la place à un homonyme défini ailleurs.
    pub fn find_group(&self, name: &str) -> Option<&GroupIndex> {
        let exact = self.groups.get(name).or_else(|| self.groups.get(&format!("all/{name}")));
        if let Some(group) = exact.filter(|g| !g.declared_empty) {
            return Some(group);
        }
        let leaf = exact.map_or(name, |g| g.name.as_str());

        let mut placeholder = None;
        for path in &self.group_order {
            let Some(group) = self.groups.get(path) else { continue };
            if group.name != leaf {
                continue;
            }
            if group.declared_empty && group.member_hosts.is_empty() {
                placeholder.get_or_insert(group);
                continue;
            }
            return Some(group);
        }
        placeholder.or(exact)
    }

    /// Nom exact, puis `name.domaine`, puis nom normalisé.
    pub fn find_host(&self, name: &str) -> Option<&ResolvedHost> {
        if let Some(host) = self.hosts.get(name) {
            return Some(host);
        }
        let dotted = format!("{name}.");
        if let Some(host) = self.ordered_hosts().find(|h| h.name.starts_with(&dotted)) {
            return Some(host);
        }
        let wanted = normalize(name);
        self.ordered_hosts().find(|h| h.display_name() == wanted)
    }

    pub fn get_host_variable(&self, host: &str, key: &str, default: Value) -> Value {
        self.find_host(host)
            .and_then(|h| h.variables.get(key).cloned())
            .unwrap_or(default)
    }

    pub fn get_group_variable(&self, group: &str, key: &str, default: Value) -> Value {
        self.find_group(group)
            .and_then(|g| g.vars.get(key).cloned())
            .unwrap_or(default)
    }

    /// Hôtes du groupe, en ordre de découverte.
    pub fn group_hosts(&self, group: &str) -> Option<Vec<&ResolvedHost>> {
        let group = self.find_group(group)?;
        Some(
            self.ordered_hosts()
                .filter(|h| group.member_hosts.contains(&h.name))
                .collect(),
        )
    }

    /// display name -> adresse (`ansible_host` ou nom d'hôte).
    pub fn group_host_addresses(&self, group: &str) -> BTreeMap<String, String> {
        self.group_hosts(group)
            .unwrap_or_default()
            .into_iter()
            .map(|h| (h.display_name(), h.address()))
            .collect()
    }

    pub fn ordered_hosts(&self) -> impl Iterator<Item = &ResolvedHost> + '_ {
        self.host_order.iter().filter_map(|name| self.hosts.get(name))
    }

    /// Valeurs d'énumération pour les paramètres `hostname`.
    pub fn hostnames(&self) -> Vec<String> {
        let names: BTreeSet<String> = self.hosts.values().map(ResolvedHost::display_name).collect();
        names.into_iter().collect()
    }

    /// Noms feuilles distincts, pour les paramètres `group`.
    pub fn group_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self.groups.values().map(|g| g.name.clone()).collect();
        names.into_iter().collect()
    }

    /// Hôtes qui définissent `key` ; avec `value`, seulement ceux dont la valeur
    /// (comparée en texte) est égale.
    pub fn hosts_with_variable(&self, key: &str, value: Option<&str>) -> Vec<&ResolvedHost> {
        self.ordered_hosts()
            .filter(|h| match (h.variables.get(key), value) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(found), Some(wanted)) => value_to_string(found).unwrap_or_else(|| found.to_string()) == wanted,
            })
            .collect()
    }

    /// Motif `*` / `?`, insensible à la casse, sur le nom ou le display name.
    pub fn query_hosts(&self, pattern: &str) -> Vec<&ResolvedHost> {
        let mut expr = String::from("^");
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        let Ok(re) = RegexBuilder::new(&expr).case_insensitive(true).build() else {
            return Vec::new();
        };
        self.ordered_hosts()
            .filter(|h| re.is_match(&h.name) || re.is_match(&h.display_name()))
            .collect()
    }

    pub fn summary(&self) -> InventorySummary {
        let mut top_groups: Vec<(String, usize)> = self
            .groups
            .values()
            .filter(|g| g.path != "all")
            .map(|g| (g.path.clone(), g.member_hosts.len()))
            .collect();
        top_groups.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_groups.truncate(10);

        InventorySummary {
            total_hosts: self.hosts.len(),
            total_groups: self.groups.len(),
            top_groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{parse_inventory, MergePolicy};
    use serde_json::json;

    const INVENTORY: &str = r#"
all:
  children:
    PiHole:
    infra:
      children:
        PiHole:
          vars:
            pihole_port: 8081
          hosts:
            Dns_Primary.home.lan:
              ansible_host: 10.0.0.2
            dns-backup:
              ansible_host: 10.0.0.3
    docker_hosts:
      hosts:
        cyber:
          ansible_host: 10.0.0.5
        WEBSERVER: {}
    lab:
      children:
        docker_hosts:
          hosts:
            gpu-box: {}
"#;

    fn inventory() -> Inventory {
        parse_inventory(INVENTORY, MergePolicy::FirstSeen).unwrap()
    }

    #[test]
    fn normalize_lowercases_hyphenates_and_strips_domain() {
        assert_eq!(normalize("Docker_Host_1.local.domain"), "docker-host-1");
        assert_eq!(normalize("WEBSERVER"), "webserver");
        assert_eq!(normalize("already-fine"), "already-fine");
    }

    #[test]
    fn find_group_by_path_or_first_leaf_match() {
        let inv = inventory();

        let by_path = inv.find_group("all/lab/docker_hosts").unwrap();
        assert_eq!(by_path.member_hosts.len(), 1);

        let by_leaf = inv.find_group("docker_hosts").unwrap();
        assert_eq!(by_leaf.path, "all/docker_hosts");

        let relative = inv.find_group("lab/docker_hosts").unwrap();
        assert_eq!(relative.path, "all/lab/docker_hosts");

        assert!(inv.find_group("nope").is_none());
    }

    #[test]
    fn null_group_falls_back_to_populated_homonym() {
        let inv = inventory();
        let group = inv.find_group("PiHole").unwrap();
        assert_eq!(group.path, "all/infra/PiHole");
        assert_eq!(inv.get_group_variable("PiHole", "pihole_port", json!(80)), json!(8081));
    }

    #[test]
    fn find_host_accepts_domain_and_display_forms() {
        let inv = inventory();
        assert_eq!(inv.find_host("cyber").unwrap().name, "cyber");
        assert_eq!(inv.find_host("Dns_Primary").unwrap().name, "Dns_Primary.home.lan");
        assert_eq!(inv.find_host("dns-primary").unwrap().name, "Dns_Primary.home.lan");
        assert!(inv.find_host("ghost").is_none());
    }

    #[test]
    fn host_variable_defaults_never_fail() {
        let inv = inventory();
        assert_eq!(inv.get_host_variable("cyber", "ansible_host", json!(null)), json!("10.0.0.5"));
        assert_eq!(inv.get_host_variable("cyber", "missing", json!("d")), json!("d"));
        assert_eq!(inv.get_host_variable("ghost", "ansible_host", json!(0)), json!(0));
    }

    #[test]
    fn group_addresses_use_display_names() {
        let inv = inventory();
        let hosts = inv.group_host_addresses("docker_hosts");
        assert_eq!(hosts.get("cyber").map(String::as_str), Some("10.0.0.5"));
        assert_eq!(hosts.get("webserver").map(String::as_str), Some("WEBSERVER"));
        assert!(!hosts.contains_key("gpu-box"));
    }

    #[test]
    fn enums_and_queries() {
        let inv = inventory();
        assert_eq!(inv.hostnames(), vec!["cyber", "dns-backup", "dns-primary", "gpu-box", "webserver"]);
        assert!(inv.group_names().contains(&"PiHole".to_string()));

        let dns: Vec<_> = inv.query_hosts("dns*").iter().map(|h| h.name.clone()).collect();
        assert_eq!(dns, vec!["Dns_Primary.home.lan", "dns-backup"]);

        let with_ip: Vec<_> = inv.hosts_with_variable("ansible_host", None).iter().map(|h| h.name.clone()).collect();
        assert_eq!(with_ip.len(), 3);
    }

    #[test]
    fn variable_value_filter_compares_as_text() {
        let inv = parse_inventory(
            "all:\n  hosts:\n    a: { port: 22, role: db }\n    b: { port: \"22\" }\n    c: { port: 2222, enabled: true }\n",
            MergePolicy::FirstSeen,
        )
        .unwrap();
        let names = |hosts: Vec<&ResolvedHost>| hosts.iter().map(|h| h.name.clone()).collect::<Vec<_>>();

        assert_eq!(names(inv.hosts_with_variable("port", Some("22"))), vec!["a", "b"]);
        assert_eq!(names(inv.hosts_with_variable("enabled", Some("true"))), vec!["c"]);
        assert_eq!(names(inv.hosts_with_variable("port", None)).len(), 3);
        assert!(inv.hosts_with_variable("role", Some("web")).is_empty());
    }

    #[test]
    fn summary_orders_groups_by_size() {
        let summary = inventory().summary();
        assert_eq!(summary.total_hosts, 5);
        assert_eq!(summary.top_groups[0], ("all/docker_hosts".to_string(), 2));
    }
}
