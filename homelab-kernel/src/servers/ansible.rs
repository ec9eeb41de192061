/**
 * OUTILS ANSIBLE - inspection de l'inventaire (`ansible_*`)
 */

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::{enum_param, object_schema, optional_str, render_result, required_str, string_param, unknown_tool, ToolServer, ToolSpec};
use crate::cache::ResolveCache;
use crate::endpoints::ResolutionContext;
use crate::errors::HomelabError;
use crate::inventory::Inventory;
use crate::models::value_to_string;

const SERVICE: &str = "Ansible";

pub struct AnsibleServer {
    cache: ResolveCache<Inventory>,
    has_path: bool,
}

impl AnsibleServer {
    pub fn new(ctx: ResolutionContext) -> Self {
        let has_path = ctx.inventory_path.is_some();
        Self { cache: ResolveCache::new(move || ctx.load_inventory()), has_path }
    }

    pub fn inventory(&self) -> Arc<Inventory> {
        self.cache.get()
    }

    pub fn reload(&self) -> Arc<Inventory> {
        self.cache.invalidate();
        let inv = self.cache.get();
        info!(hosts = inv.hosts.len(), groups = inv.groups.len(), "inventory reloaded");
        inv
    }

    fn require_inventory(&self) -> Result<Arc<Inventory>, HomelabError> {
        let inv = self.inventory();
        if inv.hosts.is_empty() {
            let hint = if self.has_path {
                "The inventory file is missing, empty or invalid; fix it then call ansible_reload_inventory"
            } else {
                "Set ANSIBLE_INVENTORY_PATH to your inventory file"
            };
            return Err(HomelabError::ConfigurationMissing { service: SERVICE.into(), hint: hint.into() });
        }
        Ok(inv)
    }

    fn summary(&self) -> Result<String, HomelabError> {
        let inv = self.require_inventory()?;
        let summary = inv.summary();
        let mut out = format!(
            "Ansible inventory\nHosts: {}\nGroups: {}\n\nLargest groups:\n",
            summary.total_hosts, summary.total_groups
        );
        for (path, count) in &summary.top_groups {
            out.push_str(&format!("  {path}: {count} host(s)\n"));
        }
        Ok(out)
    }

    fn list_groups(&self) -> Result<String, HomelabError> {
        let inv = self.require_inventory()?;
        let mut out = format!("Groups ({}):\n", inv.group_order.len());
        for path in &inv.group_order {
            if let Some(group) = inv.groups.get(path) {
                out.push_str(&format!("  {path} ({} host(s))\n", group.member_hosts.len()));
            }
        }
        Ok(out)
    }

    fn group_hosts(&self, group: &str) -> Result<String, HomelabError> {
        let inv = self.require_inventory()?;
        let Some(found) = inv.find_group(group) else {
            return Err(HomelabError::not_found(SERVICE, "group", group, inv.group_names(), "ansible_list_groups"));
        };
        let hosts = inv.group_host_addresses(&found.path);
        let mut out = format!("Group {} ({} host(s)):\n", found.path, hosts.len());
        for (name, address) in &hosts {
            out.push_str(&format!("  {name}: {address}\n"));
        }
        Ok(out)
    }

    fn host_details(&self, hostname: &str) -> Result<String, HomelabError> {
        let inv = self.require_inventory()?;
        let Some(host) = inv.find_host(hostname) else {
            return Err(HomelabError::not_found(SERVICE, "host", hostname, inv.hostnames(), "ansible_get_inventory_summary"));
        };
        let mut out = format!("Host {}\nAddress: {}\nGroups:\n", host.name, host.address());
        for path in &host.groups {
            out.push_str(&format!("  {path}\n"));
        }
        out.push_str("Variables:\n");
        for (key, value) in &host.variables {
            out.push_str(&format!("  {key}: {}\n", display_value(key, value)));
        }
        Ok(out)
    }

    fn find_hosts(&self, pattern: &str) -> Result<String, HomelabError> {
        let inv = self.require_inventory()?;
        let hosts = inv.query_hosts(pattern);
        if hosts.is_empty() {
            return Ok(format!("No hosts match '{pattern}'"));
        }
        let mut out = format!("{} host(s) match '{pattern}':\n", hosts.len());
        for host in hosts {
            out.push_str(&format!("  {} ({})\n", host.name, host.address()));
        }
        Ok(out)
    }

    fn hosts_with_variable(&self, variable: &str, value: Option<&str>) -> Result<String, HomelabError> {
        let inv = self.require_inventory()?;
        let hosts = inv.hosts_with_variable(variable, value);
        let criterion = match value {
            Some(v) => format!("{variable}={}", display_value(variable, &Value::String(v.to_string()))),
            None => variable.to_string(),
        };
        if hosts.is_empty() {
            return Ok(format!("No hosts match '{criterion}'"));
        }
        let mut out = format!("{} host(s) match '{criterion}':\n", hosts.len());
        for host in hosts {
            let shown = host.variables.get(variable).map(|v| display_value(variable, v)).unwrap_or_default();
            out.push_str(&format!("  {}: {shown}\n", host.name));
        }
        Ok(out)
    }
}

fn display_value(key: &str, value: &Value) -> String {
    let lowered = key.to_lowercase();
    if ["password", "secret", "token", "api_key", "apikey"].iter().any(|s| lowered.contains(s)) {
        return "***".into();
    }
    value_to_string(value).unwrap_or_else(|| value.to_string())
}

#[async_trait]
impl ToolServer for AnsibleServer {
    fn prefix(&self) -> &'static str {
        "ansible_"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        let inv = self.inventory();
        let groups = inv.group_names();
        let hosts = inv.hostnames();
        vec![
            ToolSpec::no_args("ansible_get_inventory_summary", "Host and group counts with the largest groups"),
            ToolSpec::no_args("ansible_list_groups", "List every group path with its member count"),
            ToolSpec::new(
                "ansible_get_group_hosts",
                "List the hosts of a group with their addresses",
                object_schema(vec![("group", enum_param("Group name or path", &groups))], &["group"]),
            ),
            ToolSpec::new(
                "ansible_get_host_details",
                "Groups and inherited variables of one host",
                object_schema(vec![("hostname", enum_param("Host name", &hosts))], &["hostname"]),
            ),
            ToolSpec::new(
                "ansible_find_hosts",
                "Find hosts by name pattern (* and ? wildcards)",
                object_schema(vec![("pattern", string_param("Pattern, e.g. web*"))], &["pattern"]),
            ),
            ToolSpec::new(
                "ansible_get_hosts_with_variable",
                "List hosts that define a variable, optionally with a given value",
                object_schema(
                    vec![
                        ("variable", string_param("Variable name")),
                        ("value", string_param("Only hosts where the variable equals this value")),
                    ],
                    &["variable"],
                ),
            ),
            ToolSpec::no_args("ansible_reload_inventory", "Re-read the inventory file"),
        ]
    }

    async fn call(&self, tool: &str, args: &Value) -> String {
        let result = match tool {
            "ansible_get_inventory_summary" => self.summary(),
            "ansible_list_groups" => self.list_groups(),
            "ansible_get_group_hosts" => required_str(tool, args, "group").and_then(|g| self.group_hosts(g)),
            "ansible_get_host_details" => required_str(tool, args, "hostname").and_then(|h| self.host_details(h)),
            "ansible_find_hosts" => required_str(tool, args, "pattern").and_then(|p| self.find_hosts(p)),
            "ansible_get_hosts_with_variable" => {
                required_str(tool, args, "variable").and_then(|v| self.hosts_with_variable(v, optional_str(args, "value")))
            }
            "ansible_reload_inventory" => {
                let inv = self.reload();
                Ok(format!(
                    "✓ Inventory reloaded: {} host(s), {} group(s)",
                    inv.hosts.len(),
                    inv.groups.len()
                ))
            }
            _ => return unknown_tool(self, tool),
        };
        render_result(result)
    }

    fn cache_populated(&self) -> bool {
        self.cache.is_populated()
    }
}
