/**
 * RÉSOLUTION D'INVENTAIRE - arbre YAML -> hôtes aplatis + index de groupes
 *
 * FONCTIONNEMENT :
 * - Parcours en profondeur depuis `all`, chemins de groupes joints par `/`
 * - `hosts`, `children`, et toute autre clé mapping (hors `vars`) = sous-groupe implicite
 * - Variables : vars des ancêtres, puis vars du groupe, puis vars de l'hôte (le plus proche gagne)
 * - Hôte déclaré plusieurs fois : un chemin ajouté par déclaration, fusion selon MergePolicy
 * - Membres d'un groupe = union transitive des hôtes trouvés dessous
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_yaml::{Mapping, Value as YamlValue};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::{GroupIndex, ResolvedHost, Vars};

const RESERVED_KEYS: &[&str] = &["hosts", "children", "vars"];

/// Fusion des variables pour un hôte déclaré à plusieurs positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// La première déclaration rencontrée garde ses valeurs ; les suivantes n'ajoutent que leur chemin.
    #[default]
    FirstSeen,
    /// Par clé, la valeur définie au niveau le plus profond gagne (précédence Ansible usuelle).
    MostSpecific,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Inventory {
    pub hosts: BTreeMap<String, ResolvedHost>,
    /// indexé par chemin (`all/docker_hosts`)
    pub groups: BTreeMap<String, GroupIndex>,
    pub host_order: Vec<String>,
    pub group_order: Vec<String>,
}

impl Inventory {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.groups.is_empty()
    }
}

#[derive(Clone)]
struct Scoped {
    value: Value,
    depth: usize,
}

type Scope = BTreeMap<String, Scoped>;

struct Walker {
    policy: MergePolicy,
    inv: Inventory,
    // profondeur de définition de chaque variable retenue, par hôte
    var_depths: HashMap<String, BTreeMap<String, usize>>,
}

pub fn resolve(raw: &YamlValue, policy: MergePolicy) -> Inventory {
    let Some(top) = raw.as_mapping() else {
        return Inventory::default();
    };

    let mut walker = Walker { policy, inv: Inventory::default(), var_depths: HashMap::new() };
    match top.get("all") {
        Some(all) => {
            walker.walk("all", "all", all, &Scope::new(), 0);
        }
        None => {
            // pas de racine explicite : les clés de premier niveau sont les enfants de `all`
            let mut root = Mapping::new();
            root.insert(YamlValue::from("children"), YamlValue::Mapping(top.clone()));
            walker.walk("all", "all", &YamlValue::Mapping(root), &Scope::new(), 0);
        }
    }
    walker.inv
}

impl Walker {
    fn walk(&mut self, name: &str, path: &str, node: &YamlValue, inherited: &Scope, depth: usize) -> BTreeSet<String> {
        self.register_group(name, path, node.is_null());

        let Some(map) = node.as_mapping() else {
            return BTreeSet::new();
        };

        let own_vars = map.get("vars").map(yaml_to_vars).unwrap_or_default();
        let mut scope = inherited.clone();
        for (k, v) in &own_vars {
            scope.insert(k.clone(), Scoped { value: v.clone(), depth });
        }

        let mut members = BTreeSet::new();

        match map.get("hosts") {
            Some(YamlValue::Mapping(hosts)) => {
                for (key, host_vars) in hosts {
                    let Some(host) = key_to_string(key) else { continue };
                    let mut vars = scope.clone();
                    for (k, v) in yaml_to_vars(host_vars) {
                        vars.insert(k, Scoped { value: v, depth: depth + 1 });
                    }
                    self.merge_host(&host, path, vars);
                    members.insert(host);
                }
            }
            // forme non standard `hosts: [a, b]`
            Some(YamlValue::Sequence(hosts)) => {
                for host in hosts.iter().filter_map(key_to_string) {
                    self.merge_host(&host, path, scope.clone());
                    members.insert(host);
                }
            }
            _ => {}
        }

        if let Some(children) = map.get("children").and_then(YamlValue::as_mapping) {
            for (key, child) in children {
                let Some(child_name) = key_to_string(key) else { continue };
                let child_path = format!("{path}/{child_name}");
                members.extend(self.walk(&child_name, &child_path, child, &scope, depth + 1));
            }
        }

        for (key, value) in map {
            let Some(k) = key_to_string(key) else { continue };
            if RESERVED_KEYS.contains(&k.as_str()) || !value.is_mapping() {
                continue;
            }
            let child_path = format!("{path}/{k}");
            members.extend(self.walk(&k, &child_path, value, &scope, depth + 1));
        }

        if let Some(group) = self.inv.groups.get_mut(path) {
            group.vars.extend(own_vars);
            group.member_hosts.extend(members.iter().cloned());
        }
        members
    }

    fn register_group(&mut self, name: &str, path: &str, declared_empty: bool) {
        if self.inv.groups.contains_key(path) {
            return;
        }
        self.inv.groups.insert(
            path.to_string(),
            GroupIndex {
                name: name.to_string(),
                path: path.to_string(),
                member_hosts: BTreeSet::new(),
                vars: Vars::new(),
                declared_empty,
            },
        );
        self.inv.group_order.push(path.to_string());
    }

    fn merge_host(&mut self, name: &str, path: &str, vars: Scope) {
        let Some(existing) = self.inv.hosts.get_mut(name) else {
            let depths = vars.iter().map(|(k, s)| (k.clone(), s.depth)).collect();
            self.var_depths.insert(name.to_string(), depths);
            self.inv.hosts.insert(
                name.to_string(),
                ResolvedHost {
                    name: name.to_string(),
                    variables: vars.into_iter().map(|(k, s)| (k, s.value)).collect(),
                    groups: vec![path.to_string()],
                },
            );
            self.inv.host_order.push(name.to_string());
            return;
        };

        existing.groups.push(path.to_string());

        if self.policy == MergePolicy::MostSpecific {
            let depths = self.var_depths.entry(name.to_string()).or_default();
            for (k, scoped) in vars {
                let deeper = depths.get(&k).map_or(true, |d| scoped.depth > *d);
                if deeper {
                    depths.insert(k.clone(), scoped.depth);
                    existing.variables.insert(k, scoped.value);
                }
            }
        }
    }
}

fn key_to_string(key: &YamlValue) -> Option<String> {
    match key {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn yaml_to_vars(node: &YamlValue) -> Vars {
    let Some(map) = node.as_mapping() else {
        return Vars::new();
    };
    map.iter()
        .filter_map(|(k, v)| {
            let key = key_to_string(k)?;
            let value = serde_json::to_value(v).unwrap_or(Value::Null);
            Some((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(text: &str, policy: MergePolicy) -> Inventory {
        let raw: YamlValue = serde_yaml::from_str(text).unwrap();
        resolve(&raw, policy)
    }

    const LAB: &str = r#"
all:
  vars:
    ansible_user: admin
    domain: lab
  children:
    docker_hosts:
      vars:
        docker_api_port: 2375
      hosts:
        cyber:
          ansible_host: 10.0.0.5
        nas:
          ansible_host: 10.0.0.6
          docker_api_port: 2376
    storage:
      vars:
        domain: storage
      hosts:
        nas:
          ansible_host: 10.0.0.60
          role: backup
    lab:
      children:
        gpu:
          hosts:
            zeus:
              ansible_host: 10.0.0.9
"#;

    #[test]
    fn every_host_appears_once_with_one_path_per_declaration() {
        let inv = parse(LAB, MergePolicy::FirstSeen);

        assert_eq!(inv.hosts.len(), 3);
        assert_eq!(inv.host_order, vec!["cyber", "nas", "zeus"]);
        assert_eq!(inv.hosts["nas"].groups, vec!["all/docker_hosts", "all/storage"]);
        assert_eq!(inv.hosts["zeus"].groups, vec!["all/lab/gpu"]);
    }

    #[test]
    fn variables_inherit_with_closest_scope_winning() {
        let inv = parse(LAB, MergePolicy::FirstSeen);
        let cyber = &inv.hosts["cyber"];

        assert_eq!(cyber.variables["ansible_user"], json!("admin"));
        assert_eq!(cyber.variables["docker_api_port"], json!(2375));
        assert_eq!(cyber.variables["ansible_host"], json!("10.0.0.5"));

        let nas = &inv.hosts["nas"];
        assert_eq!(nas.variables["docker_api_port"], json!(2376));
    }

    #[test]
    fn first_seen_keeps_first_declaration_values() {
        let inv = parse(LAB, MergePolicy::FirstSeen);
        let nas = &inv.hosts["nas"];

        assert_eq!(nas.variables["ansible_host"], json!("10.0.0.6"));
        assert_eq!(nas.variables["domain"], json!("lab"));
        assert!(!nas.variables.contains_key("role"));
    }

    #[test]
    fn most_specific_lets_deeper_definitions_override() {
        let text = r#"
all:
  vars:
    tier: base
  hosts:
    web: { ansible_host: 10.0.0.1 }
  children:
    prod:
      vars:
        tier: prod
      hosts:
        web:
          role: frontend
"#;
        let first = parse(text, MergePolicy::FirstSeen);
        assert_eq!(first.hosts["web"].variables["tier"], json!("base"));

        let deep = parse(text, MergePolicy::MostSpecific);
        let web = &deep.hosts["web"];
        assert_eq!(web.variables["tier"], json!("prod"));
        assert_eq!(web.variables["role"], json!("frontend"));
        // absent de la seconde déclaration : conservé
        assert_eq!(web.variables["ansible_host"], json!("10.0.0.1"));
    }

    #[test]
    fn group_members_are_transitive() {
        let inv = parse(LAB, MergePolicy::FirstSeen);

        let all: Vec<_> = inv.groups["all"].member_hosts.iter().cloned().collect();
        assert_eq!(all, vec!["cyber", "nas", "zeus"]);
        assert!(inv.groups["all/lab"].member_hosts.contains("zeus"));
        assert_eq!(inv.groups["all/docker_hosts"].vars["docker_api_port"], json!(2375));
        assert_eq!(
            inv.group_order,
            vec!["all", "all/docker_hosts", "all/storage", "all/lab", "all/lab/gpu"]
        );
    }

    #[test]
    fn implicit_mapping_keys_become_groups() {
        let text = r#"
all:
  homeassistant:
    hosts:
      hass: { ansible_host: 10.0.0.20 }
  notes: "free text is ignored"
"#;
        let inv = parse(text, MergePolicy::FirstSeen);
        assert_eq!(inv.hosts["hass"].groups, vec!["all/homeassistant"]);
        assert!(!inv.groups.contains_key("all/notes"));
    }

    #[test]
    fn null_child_registers_empty_group() {
        let text = r#"
all:
  children:
    PiHole:
    dns:
      children:
        PiHole:
          hosts:
            dns1: { ansible_host: 10.0.0.2 }
"#;
        let inv = parse(text, MergePolicy::FirstSeen);
        let empty = &inv.groups["all/PiHole"];
        assert!(empty.declared_empty);
        assert!(empty.member_hosts.is_empty());
        assert!(inv.groups["all/dns/PiHole"].member_hosts.contains("dns1"));
    }

    #[test]
    fn empty_or_scalar_documents_resolve_to_nothing() {
        assert!(parse("", MergePolicy::FirstSeen).is_empty());
        assert!(parse("just a string", MergePolicy::FirstSeen).is_empty());

        let inv = parse("all: {}", MergePolicy::FirstSeen);
        assert!(inv.hosts.is_empty());
    }

    #[test]
    fn top_level_groups_without_all_root() {
        let text = r#"
webservers:
  hosts:
    web1: {}
"#;
        let inv = parse(text, MergePolicy::FirstSeen);
        assert_eq!(inv.hosts["web1"].groups, vec!["all/webservers"]);
    }

    #[test]
    fn reordering_keys_within_one_level_keeps_result() {
        let a = r#"
all:
  children:
    alpha: { hosts: { h: { x: 1 } } }
    beta: { hosts: { h: { x: 2 } } }
  vars:
    shared: 1
"#;
        let b = r#"
all:
  vars:
    shared: 1
  children:
    alpha: { hosts: { h: { x: 1 } } }
    beta: { hosts: { h: { x: 2 } } }
"#;
        let first = parse(a, MergePolicy::FirstSeen);
        let second = parse(b, MergePolicy::FirstSeen);
        assert_eq!(first.hosts, second.hosts);
        assert_eq!(first.hosts["h"].variables["x"], json!(1));
        assert_eq!(first.hosts["h"].groups, vec!["all/alpha", "all/beta"]);
    }
}
