/**
 * OUTILS DOCKER - conteneurs Docker et Podman (`docker_*`)
 *
 * FONCTIONNEMENT :
 * - Une seule table d'endpoints : `docker_hosts` d'abord, puis `podman_hosts`
 * - Podman parle l'API libpod sous `/v4.0.0/libpod`
 */

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{
    enum_param, find_endpoint, integer_param, object_schema, render_result, required_str, string_param, u64_or,
    unknown_tool, ToolServer, ToolSpec,
};
use crate::cache::ResolveCache;
use crate::endpoints::{resolve_with_inventory, ResolutionContext, DOCKER, PODMAN};
use crate::errors::HomelabError;
use crate::models::{EndpointRecord, EndpointTable, ServiceKind};
use crate::remote::{fan_out, RemoteClient, DEFAULT_TIMEOUT, STATS_TIMEOUT};

const SERVICE: &str = "Docker";
const MAX_STATS_CONTAINERS: usize = 10;
const DEFAULT_TAIL: u64 = 100;

pub struct DockerServer {
    cache: ResolveCache<EndpointTable>,
    client: RemoteClient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStats {
    pub name: String,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
    pub memory_limit_mb: Option<f64>,
}

impl DockerServer {
    pub fn new(ctx: ResolutionContext) -> Self {
        Self::with_client(ctx, RemoteClient::new(SERVICE))
    }

    pub fn with_client(ctx: ResolutionContext, client: RemoteClient) -> Self {
        let cache = ResolveCache::new(move || {
            let inv = ctx.load_inventory();
            let mut table = resolve_with_inventory(&DOCKER, &ctx, &inv);
            for (name, record) in resolve_with_inventory(&PODMAN, &ctx, &inv) {
                table.entry(name).or_insert(record);
            }
            table
        });
        Self { cache, client }
    }

    pub fn endpoints(&self) -> std::sync::Arc<EndpointTable> {
        self.cache.get()
    }

    fn require_endpoints(&self) -> Result<std::sync::Arc<EndpointTable>, HomelabError> {
        let table = self.endpoints();
        if table.is_empty() {
            return Err(HomelabError::ConfigurationMissing {
                service: SERVICE.into(),
                hint: "Add hosts to the docker_hosts or podman_hosts inventory group, or set DOCKER_<NAME>_ENDPOINT"
                    .into(),
            });
        }
        Ok(table)
    }

    pub async fn containers(&self, endpoint: &EndpointRecord, running_only: bool) -> Result<Vec<ContainerSummary>, HomelabError> {
        let all = if running_only { "false" } else { "true" };
        let url = format!("{}/containers/json?all={all}", api_base(endpoint));
        let body = self.client.get_json(&endpoint.display_name, &url, DEFAULT_TIMEOUT).await?;
        Ok(parse_containers(&body))
    }

    async fn list_containers(&self, hostname: &str) -> Result<String, HomelabError> {
        let table = self.require_endpoints()?;
        let endpoint = find_endpoint(&table, SERVICE, hostname, "docker_list_all_hosts")?;
        let containers = self.containers(endpoint, false).await?;

        let running = containers.iter().filter(|c| c.state == "running").count();
        let mut out = format!(
            "{} ({}, {}) - {} container(s), {running} running\n\n",
            endpoint.display_name,
            endpoint.kind,
            endpoint.address,
            containers.len()
        );
        for c in &containers {
            let marker = if c.state == "running" { "●" } else { "○" };
            out.push_str(&format!("{marker} {} [{}] {}\n", c.name, c.image, c.status));
        }
        Ok(out)
    }

    fn list_all_hosts(&self) -> Result<String, HomelabError> {
        let table = self.require_endpoints()?;
        let mut out = format!("Container hosts ({}):\n", table.len());
        for record in table.values() {
            out.push_str(&format!("  {} - {} ({}, from {:?})\n", record.display_name, record.address, record.kind, record.source));
        }
        Ok(out)
    }

    async fn stats(&self, hostname: &str) -> Result<String, HomelabError> {
        let table = self.require_endpoints()?;
        let endpoint = find_endpoint(&table, SERVICE, hostname, "docker_list_all_hosts")?;
        let running = self.containers(endpoint, true).await?;
        let total = running.len();
        let base = api_base(endpoint);

        let stats = fan_out(running.into_iter().take(MAX_STATS_CONTAINERS), |c| {
            let url = format!("{base}/containers/{}/stats?stream=false", c.id);
            async move {
                let result = self.client.get_json(&endpoint.display_name, &url, STATS_TIMEOUT).await;
                (c.name, result)
            }
        })
        .await;

        let mut out = format!("Resource usage on {} ({} running)\n\n", endpoint.display_name, total);
        for (name, result) in stats {
            match result {
                Ok(raw) => {
                    let s = parse_stats(&name, &raw);
                    let cpu = s.cpu_percent.map_or("n/a".to_string(), |v| format!("{v:.1}%"));
                    let mem = match (s.memory_mb, s.memory_limit_mb) {
                        (Some(used), Some(limit)) if limit > 0.0 => {
                            format!("{used:.0} MB / {limit:.0} MB ({:.1}%)", used / limit * 100.0)
                        }
                        (Some(used), _) => format!("{used:.0} MB"),
                        _ => "n/a".into(),
                    };
                    out.push_str(&format!("{name}: CPU {cpu}, memory {mem}\n"));
                }
                Err(e) => {
                    warn!(host = %endpoint.display_name, container = %name, error = %e, "stats unavailable");
                    out.push_str(&format!("{name}: ✗ {e}\n"));
                }
            }
        }
        if total > MAX_STATS_CONTAINERS {
            out.push_str(&format!("\n(showing first {MAX_STATS_CONTAINERS} of {total})\n"));
        }
        Ok(out)
    }

    async fn container_details(&self, hostname: &str, container: &str) -> Result<String, HomelabError> {
        let table = self.require_endpoints()?;
        let endpoint = find_endpoint(&table, SERVICE, hostname, "docker_list_all_hosts")?;
        let url = format!("{}/containers/{container}/json", api_base(endpoint));
        let info = self.client.get_json(&endpoint.display_name, &url, DEFAULT_TIMEOUT).await.map_err(|e| match e {
            HomelabError::Http { status: 404, .. } => HomelabError::not_found(
                SERVICE,
                "container",
                container,
                Vec::<String>::new(),
                "docker_list_containers",
            ),
            other => other,
        })?;

        let text = |ptr: &str| info.pointer(ptr).and_then(Value::as_str).unwrap_or("-").to_string();
        let mut out = format!(
            "Container {}\nImage: {}\nState: {}\nStarted: {}\nCreated: {}\nRestart count: {}\n",
            text("/Name").trim_start_matches('/'),
            text("/Config/Image"),
            text("/State/Status"),
            text("/State/StartedAt"),
            text("/Created"),
            info.pointer("/RestartCount").and_then(Value::as_u64).unwrap_or(0),
        );
        if let Some(networks) = info.pointer("/NetworkSettings/Networks").and_then(Value::as_object) {
            for (name, net) in networks {
                let ip = net.get("IPAddress").and_then(Value::as_str).unwrap_or("-");
                out.push_str(&format!("Network {name}: {ip}\n"));
            }
        }
        if let Some(mounts) = info.get("Mounts").and_then(Value::as_array) {
            for m in mounts {
                let src = m.get("Source").and_then(Value::as_str).unwrap_or("-");
                let dst = m.get("Destination").and_then(Value::as_str).unwrap_or("-");
                out.push_str(&format!("Mount: {src} -> {dst}\n"));
            }
        }
        Ok(out)
    }

    async fn container_logs(&self, hostname: &str, container: &str, tail: u64) -> Result<String, HomelabError> {
        let table = self.require_endpoints()?;
        let endpoint = find_endpoint(&table, SERVICE, hostname, "docker_list_all_hosts")?;
        let url = format!(
            "{}/containers/{container}/logs?stdout=true&stderr=true&tail={tail}",
            api_base(endpoint)
        );
        let raw = self.client.get_bytes(&endpoint.display_name, &url, STATS_TIMEOUT).await?;
        let logs = demux_log_stream(&raw);
        if logs.trim().is_empty() {
            return Ok(format!("No log output for {container} on {}", endpoint.display_name));
        }
        Ok(format!("Last {tail} line(s) of {container} on {}:\n\n{logs}", endpoint.display_name))
    }
}

pub fn api_base(endpoint: &EndpointRecord) -> String {
    match endpoint.kind {
        ServiceKind::Podman => format!("{}/v4.0.0/libpod", endpoint.base_url()),
        _ => endpoint.base_url(),
    }
}

pub fn parse_containers(body: &Value) -> Vec<ContainerSummary> {
    let Some(items) = body.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .map(|c| {
            let name = c
                .get("Names")
                .and_then(Value::as_array)
                .and_then(|n| n.first())
                .and_then(Value::as_str)
                .unwrap_or("?")
                .trim_start_matches('/')
                .to_string();
            let field = |key: &str| c.get(key).and_then(Value::as_str).unwrap_or("").to_string();
            ContainerSummary {
                id: field("Id"),
                name,
                image: field("Image"),
                state: field("State"),
                status: field("Status"),
            }
        })
        .collect()
}

/// CPU% = delta conteneur / delta système × nb CPUs × 100.
pub fn cpu_percent(stats: &Value) -> Option<f64> {
    let num = |ptr: &str| stats.pointer(ptr).and_then(Value::as_f64);
    let cpu_delta = num("/cpu_stats/cpu_usage/total_usage")? - num("/precpu_stats/cpu_usage/total_usage").unwrap_or(0.0);
    let system_delta = num("/cpu_stats/system_cpu_usage")? - num("/precpu_stats/system_cpu_usage").unwrap_or(0.0);
    let cpus = num("/cpu_stats/online_cpus")
        .or_else(|| {
            stats
                .pointer("/cpu_stats/cpu_usage/percpu_usage")
                .and_then(Value::as_array)
                .map(|a| a.len() as f64)
        })
        .unwrap_or(1.0);
    if system_delta <= 0.0 || cpu_delta < 0.0 {
        return Some(0.0);
    }
    Some(cpu_delta / system_delta * cpus * 100.0)
}

pub fn parse_stats(name: &str, stats: &Value) -> ContainerStats {
    let mb = |ptr: &str| stats.pointer(ptr).and_then(Value::as_f64).map(|b| b / 1024.0 / 1024.0);
    ContainerStats {
        name: name.to_string(),
        cpu_percent: cpu_percent(stats),
        memory_mb: mb("/memory_stats/usage"),
        memory_limit_mb: mb("/memory_stats/limit"),
    }
}

/// Flux de logs Docker multiplexé : trames `[stream, 0, 0, 0, len(4 octets BE)] + payload`.
/// Un conteneur avec TTY renvoie du texte brut, rendu tel quel.
pub fn demux_log_stream(raw: &[u8]) -> String {
    let framed = raw.len() >= 8 && raw[0] <= 2 && raw[1..4] == [0, 0, 0];
    if !framed {
        return String::from_utf8_lossy(raw).into_owned();
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while rest.len() >= 8 {
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + len).min(rest.len());
        out.extend_from_slice(&rest[8..end]);
        rest = &rest[end..];
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[async_trait]
impl ToolServer for DockerServer {
    fn prefix(&self) -> &'static str {
        "docker_"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        let hosts: Vec<String> = self.endpoints().keys().cloned().collect();
        let host_param = || enum_param("Container host", &hosts);
        vec![
            ToolSpec::no_args("docker_list_all_hosts", "List configured Docker/Podman hosts"),
            ToolSpec::new(
                "docker_list_containers",
                "List all containers on a host",
                object_schema(vec![("hostname", host_param())], &["hostname"]),
            ),
            ToolSpec::new(
                "docker_get_stats",
                "CPU and memory usage of running containers (first 10)",
                object_schema(vec![("hostname", host_param())], &["hostname"]),
            ),
            ToolSpec::new(
                "docker_get_container_details",
                "Image, state, networks and mounts of one container",
                object_schema(
                    vec![("hostname", host_param()), ("container", string_param("Container name or id"))],
                    &["hostname", "container"],
                ),
            ),
            ToolSpec::new(
                "docker_get_container_logs",
                "Recent log lines of one container",
                object_schema(
                    vec![
                        ("hostname", host_param()),
                        ("container", string_param("Container name or id")),
                        ("tail", integer_param("Number of lines", DEFAULT_TAIL)),
                    ],
                    &["hostname", "container"],
                ),
            ),
            ToolSpec::no_args("docker_reload_inventory", "Re-resolve container hosts"),
        ]
    }

    async fn call(&self, tool: &str, args: &Value) -> String {
        let result = match tool {
            "docker_list_all_hosts" => self.list_all_hosts(),
            "docker_list_containers" => match required_str(tool, args, "hostname") {
                Ok(h) => self.list_containers(h).await,
                Err(e) => Err(e),
            },
            "docker_get_stats" => match required_str(tool, args, "hostname") {
                Ok(h) => self.stats(h).await,
                Err(e) => Err(e),
            },
            "docker_get_container_details" => {
                match (required_str(tool, args, "hostname"), required_str(tool, args, "container")) {
                    (Ok(h), Ok(c)) => self.container_details(h, c).await,
                    (Err(e), _) | (_, Err(e)) => Err(e),
                }
            }
            "docker_get_container_logs" => {
                match (required_str(tool, args, "hostname"), required_str(tool, args, "container")) {
                    (Ok(h), Ok(c)) => self.container_logs(h, c, u64_or(args, "tail", DEFAULT_TAIL)).await,
                    (Err(e), _) | (_, Err(e)) => Err(e),
                }
            }
            "docker_reload_inventory" => {
                self.cache.invalidate();
                let table = self.cache.get();
                Ok(format!("✓ Container hosts reloaded: {}", table.len()))
            }
            _ => return unknown_tool(self, tool),
        };
        render_result(result)
    }

    fn cache_populated(&self) -> bool {
        self.cache.is_populated()
    }
}
