/**
 * OUTILS UNIFI - contrôleur réseau (`unifi_*`)
 *
 * FONCTIONNEMENT :
 * - Équipements, clients et réseaux récupérés ensemble dans un seul snapshot
 * - Snapshot gardé dans un TtlCache (cinq minutes par défaut), relu au-delà
 * - `unifi_refresh_network_data` saute la lecture mais réécrit le snapshot frais
 */

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use super::{render_result, unknown_tool, ToolServer, ToolSpec};
use crate::cache::TtlCache;
use crate::config::UnifiConf;
use crate::env::EnvSnapshot;
use crate::errors::HomelabError;
use crate::remote::{RemoteClient, STATS_TIMEOUT};

const SERVICE: &str = "Unifi";
const CLIENTS_PER_NETWORK: usize = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifiSnapshot {
    pub devices: Vec<Value>,
    pub clients: Vec<Value>,
    pub networks: Vec<Value>,
}

#[async_trait]
pub trait UnifiSource: Send + Sync {
    async fn fetch(&self) -> Result<UnifiSnapshot, HomelabError>;
}

/// API du contrôleur, clé `X-API-KEY`.
pub struct UnifiApi {
    client: RemoteClient,
    host: String,
    site: String,
    api_key: Option<String>,
}

impl UnifiApi {
    /// `UNIFI_HOST` / `UNIFI_SITE` priment sur la config ; la clé vient de `UNIFI_API_KEY`.
    pub fn from_env(conf: &UnifiConf, env: &EnvSnapshot) -> Self {
        // contrôleurs en certificat auto-signé
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client: RemoteClient::with_client(SERVICE, http),
            host: env.get_or("UNIFI_HOST", &conf.host).to_string(),
            site: env.get_or("UNIFI_SITE", &conf.site).to_string(),
            api_key: env.get("UNIFI_API_KEY").map(str::to_string),
        }
    }

    fn base_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", self.host)
        }
    }

    /// `/proxy/network/api/s/<site>/<path>` (UniFi OS), repli `/api/s/<site>/<path>` sur 404.
    async fn get_data(&self, key: &str, path: &str) -> Result<Vec<Value>, HomelabError> {
        let base = self.base_url();
        let candidates = [
            format!("{base}/proxy/network/api/s/{}/{path}", self.site),
            format!("{base}/api/s/{}/{path}", self.site),
        ];

        let mut last_status = 404;
        for url in &candidates {
            let req = self.client.http().get(url).header("X-API-KEY", key);
            let resp = self.client.send_raw(&self.host, req, STATS_TIMEOUT).await?;
            let status = resp.status().as_u16();
            if status == 404 {
                debug!(url = %url, "unifi endpoint not found, trying legacy path");
                continue;
            }
            if !resp.status().is_success() {
                last_status = status;
                break;
            }
            let body: Value = resp
                .json()
                .await
                .map_err(|e| HomelabError::from_reqwest(SERVICE, &self.host, &e, STATS_TIMEOUT))?;
            return Ok(body.get("data").and_then(Value::as_array).cloned().unwrap_or_default());
        }
        Err(HomelabError::http(SERVICE, &self.host, last_status))
    }
}

#[async_trait]
impl UnifiSource for UnifiApi {
    async fn fetch(&self) -> Result<UnifiSnapshot, HomelabError> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(HomelabError::ConfigurationMissing {
                service: SERVICE.into(),
                hint: "Set UNIFI_API_KEY (Unifi Settings > Admins > API) and UNIFI_HOST".into(),
            });
        };
        let (devices, clients, networks) = futures::try_join!(
            self.get_data(key, "stat/device"),
            self.get_data(key, "stat/sta"),
            self.get_data(key, "rest/networkconf"),
        )?;
        Ok(UnifiSnapshot { devices, clients, networks })
    }
}

pub struct UnifiServer {
    cache: TtlCache<UnifiSnapshot>,
    source: Arc<dyn UnifiSource>,
}

impl UnifiServer {
    pub fn new(conf: &UnifiConf, env: &EnvSnapshot) -> Self {
        Self::with_source(Duration::seconds(conf.ttl_seconds), Arc::new(UnifiApi::from_env(conf, env)))
    }

    pub fn with_source(ttl: Duration, source: Arc<dyn UnifiSource>) -> Self {
        Self { cache: TtlCache::new(ttl), source }
    }

    pub async fn snapshot(&self, force: bool) -> Result<Arc<UnifiSnapshot>, HomelabError> {
        self.snapshot_at(OffsetDateTime::now_utc(), force).await
    }

    /// Cache si frais et `!force`, sinon fetch puis écriture dans le cache.
    /// Un fetch en échec laisse le cache tel quel.
    pub async fn snapshot_at(&self, now: OffsetDateTime, force: bool) -> Result<Arc<UnifiSnapshot>, HomelabError> {
        if !force {
            if let Some(cached) = self.cache.get_at(now) {
                debug!(age = ?self.cache.age_at(now), "unifi cache hit");
                return Ok(cached);
            }
        }
        let fresh = self.source.fetch().await?;
        info!(
            devices = fresh.devices.len(),
            clients = fresh.clients.len(),
            networks = fresh.networks.len(),
            force,
            "unifi data fetched"
        );
        Ok(self.cache.put_at(now, fresh))
    }
}

fn str_field<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("N/A")
}

fn type_label(kind: &str) -> String {
    match kind {
        "ugw" | "udm" => "Gateways".into(),
        "usw" => "Switches".into(),
        "uap" => "Access Points".into(),
        "unknown" => "Other".into(),
        other => other.to_uppercase(),
    }
}

fn is_online(device: &Value) -> bool {
    device.get("state").and_then(Value::as_i64) == Some(1)
}

fn is_wired(client: &Value) -> bool {
    client.get("is_wired").and_then(Value::as_bool).unwrap_or(false)
}

fn client_name(client: &Value) -> &str {
    client
        .get("hostname")
        .or_else(|| client.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
}

/// `_id` -> (nom, vlan)
fn network_names(snapshot: &UnifiSnapshot) -> BTreeMap<&str, (&str, String)> {
    snapshot
        .networks
        .iter()
        .filter_map(|n| {
            let id = n.get("_id")?.as_str()?;
            let vlan = n.get("vlan").map_or("N/A".to_string(), |v| v.to_string().trim_matches('"').to_string());
            Some((id, (n.get("name").and_then(Value::as_str).unwrap_or("Unknown"), vlan)))
        })
        .collect()
}

/// Clients groupés par `network_id`, du plus peuplé au moins peuplé.
fn clients_by_network(snapshot: &UnifiSnapshot) -> Vec<(&str, Vec<&Value>)> {
    let mut groups: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();
    for c in &snapshot.clients {
        let id = c.get("network_id").and_then(Value::as_str).unwrap_or("unknown");
        groups.entry(id).or_default().push(c);
    }
    let mut groups: Vec<_> = groups.into_iter().collect();
    groups.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));
    groups
}

pub fn format_devices(snapshot: &UnifiSnapshot) -> String {
    let mut by_type: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();
    for d in &snapshot.devices {
        by_type.entry(d.get("type").and_then(Value::as_str).unwrap_or("unknown")).or_default().push(d);
    }

    let mut out = format!("Network devices\nTotal: {}\n", snapshot.devices.len());
    for (kind, devices) in by_type {
        out.push_str(&format!("\n{} ({}):\n", type_label(kind), devices.len()));
        for d in devices {
            let status = if is_online(d) { "✓ Online" } else { "✗ Offline" };
            out.push_str(&format!("  • {} ({})\n", str_field(d, "name"), str_field(d, "model")));
            out.push_str(&format!("    IP: {} | Status: {status} | Version: {}\n", str_field(d, "ip"), str_field(d, "version")));
            match kind {
                "uap" => {
                    let stations = d.get("num_sta").and_then(Value::as_u64).unwrap_or(0);
                    out.push_str(&format!("    Connected clients: {stations}\n"));
                }
                "usw" => {
                    let ports = d.get("port_table").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);
                    let up = ports.iter().filter(|p| p.get("up").and_then(Value::as_bool).unwrap_or(false)).count();
                    out.push_str(&format!("    Ports: {up}/{} up\n", ports.len()));
                }
                _ => {}
            }
        }
    }
    out
}

pub fn format_clients(snapshot: &UnifiSnapshot) -> String {
    let networks = network_names(snapshot);
    let mut out = format!("Network clients\nTotal: {} active\n", snapshot.clients.len());
    for (id, clients) in clients_by_network(snapshot) {
        let (name, vlan) = networks.get(id).cloned().unwrap_or(("Unknown", "N/A".into()));
        out.push_str(&format!("\n{name} (VLAN {vlan}) - {} clients:\n", clients.len()));
        for c in clients.iter().take(CLIENTS_PER_NETWORK) {
            let link = if is_wired(c) { "Wired" } else { "Wireless" };
            out.push_str(&format!("  • {} ({})\n", client_name(c), str_field(c, "ip")));
            out.push_str(&format!("    MAC: {} | {link}\n", str_field(c, "mac")));
        }
        if clients.len() > CLIENTS_PER_NETWORK {
            out.push_str(&format!("  ... and {} more\n", clients.len() - CLIENTS_PER_NETWORK));
        }
    }
    out
}

pub fn format_summary(snapshot: &UnifiSnapshot) -> String {
    let online = snapshot.devices.iter().filter(|d| is_online(d)).count();
    let wired = snapshot.clients.iter().filter(|c| is_wired(c)).count();

    let mut out = String::from("Network summary\n\n");
    out.push_str(&format!("Networks/VLANs: {}\n", snapshot.networks.len()));
    out.push_str(&format!("Network devices: {}\n", snapshot.devices.len()));
    out.push_str(&format!("Active clients: {}\n\n", snapshot.clients.len()));

    out.push_str(&format!("Devices online: {online}/{}\n", snapshot.devices.len()));
    let mut types: BTreeMap<String, usize> = BTreeMap::new();
    for d in &snapshot.devices {
        *types.entry(type_label(d.get("type").and_then(Value::as_str).unwrap_or("unknown"))).or_default() += 1;
    }
    for (label, count) in types {
        out.push_str(&format!("  {label}: {count}\n"));
    }

    out.push_str(&format!("\nClients wired: {wired}, wireless: {}\n", snapshot.clients.len() - wired));

    let networks = network_names(snapshot);
    out.push_str("\nTop networks:\n");
    for (id, clients) in clients_by_network(snapshot).into_iter().take(5) {
        let (name, vlan) = networks.get(id).cloned().unwrap_or(("Unknown", "N/A".into()));
        out.push_str(&format!("  • {name} (VLAN {vlan}): {} clients\n", clients.len()));
    }
    out
}

#[async_trait]
impl ToolServer for UnifiServer {
    fn prefix(&self) -> &'static str {
        "unifi_"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec::no_args("unifi_get_network_devices", "Gateways, switches and access points with status (cached)"),
            ToolSpec::no_args("unifi_get_network_clients", "Active clients grouped by network (cached)"),
            ToolSpec::no_args("unifi_get_network_summary", "Counts of networks, devices and clients (cached)"),
            ToolSpec::no_args("unifi_refresh_network_data", "Fetch fresh data from the controller, bypassing the cache"),
        ]
    }

    async fn call(&self, tool: &str, _args: &Value) -> String {
        let result = match tool {
            "unifi_get_network_devices" => self.snapshot(false).await.map(|s| format_devices(&s)),
            "unifi_get_network_clients" => self.snapshot(false).await.map(|s| format_clients(&s)),
            "unifi_get_network_summary" => self.snapshot(false).await.map(|s| format_summary(&s)),
            "unifi_refresh_network_data" => self.snapshot(true).await.map(|s| {
                format!(
                    "✓ Unifi data refreshed: {} devices, {} clients, {} networks",
                    s.devices.len(),
                    s.clients.len(),
                    s.networks.len()
                )
            }),
            _ => return unknown_tool(self, tool),
        };
        render_result(result)
    }

    fn cache_populated(&self) -> bool {
        self.cache.is_populated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use time::macros::datetime;

    struct CountingSource {
        fetches: AtomicU64,
    }

    #[async_trait]
    impl UnifiSource for CountingSource {
        async fn fetch(&self) -> Result<UnifiSnapshot, HomelabError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(UnifiSnapshot { devices: vec![json!({"name": format!("fetch-{n}")})], ..Default::default() })
        }
    }

    fn server() -> (UnifiServer, Arc<CountingSource>) {
        let source = Arc::new(CountingSource { fetches: AtomicU64::new(0) });
        (UnifiServer::with_source(Duration::minutes(5), source.clone()), source)
    }

    #[tokio::test]
    async fn ttl_governs_refetch() {
        let (server, source) = server();
        let t0 = datetime!(2024-06-01 12:00 UTC);

        server.snapshot_at(t0, false).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        let cached = server.snapshot_at(t0 + Duration::minutes(4), false).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cached.devices[0]["name"], "fetch-1");

        let fresh = server.snapshot_at(t0 + Duration::minutes(6), false).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(fresh.devices[0]["name"], "fetch-2");
    }

    #[tokio::test]
    async fn force_refresh_writes_through() {
        let (server, source) = server();
        let t0 = datetime!(2024-06-01 12:00 UTC);

        server.snapshot_at(t0, false).await.unwrap();
        server.snapshot_at(t0 + Duration::minutes(1), true).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);

        // stamp du refresh : encore frais à t0 + 5 min
        let cached = server.snapshot_at(t0 + Duration::minutes(5), false).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(cached.devices[0]["name"], "fetch-2");
    }

    #[tokio::test]
    async fn missing_api_key_is_configuration_error() {
        let api = UnifiApi::from_env(&UnifiConf::default(), &EnvSnapshot::default());
        let err = api.fetch().await.unwrap_err();
        assert!(matches!(err, HomelabError::ConfigurationMissing { .. }));
    }

    #[test]
    fn summary_counts() {
        let snapshot = UnifiSnapshot {
            devices: vec![
                json!({"name": "gw", "type": "ugw", "state": 1}),
                json!({"name": "sw", "type": "usw", "state": 0, "port_table": [{"up": true}, {"up": false}]}),
            ],
            clients: vec![
                json!({"hostname": "nas", "network_id": "n1", "is_wired": true}),
                json!({"hostname": "phone", "network_id": "n1"}),
                json!({"name": "tv", "network_id": "n2"}),
            ],
            networks: vec![json!({"_id": "n1", "name": "LAN", "vlan": 1}), json!({"_id": "n2", "name": "IoT", "vlan": 20})],
        };

        let summary = format_summary(&snapshot);
        assert!(summary.contains("Devices online: 1/2"));
        assert!(summary.contains("Clients wired: 1, wireless: 2"));
        assert!(summary.contains("• LAN (VLAN 1): 2 clients"));

        let devices = format_devices(&snapshot);
        assert!(devices.contains("Ports: 1/2 up"));

        let clients = format_clients(&snapshot);
        assert!(clients.contains("IoT (VLAN 20) - 1 clients"));
        assert!(clients.contains("• tv (N/A)"));
    }
}
