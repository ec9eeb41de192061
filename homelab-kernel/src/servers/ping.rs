/**
 * OUTILS PING - joignabilité ICMP (`ping_*`)
 *
 * FONCTIONNEMENT :
 * - Cibles : chaque hôte d'inventaire (`ansible_host`, puis `static_ip`, puis le nom) ou `PING_TARGET<N>`
 * - Un groupe couvre aussi les hôtes de ses sous-groupes
 * - Balayage de groupe ou complet : un ping par hôte, on attend tout le monde
 * - Hôte injoignable = entrée en erreur dans le résultat, jamais un appel en échec
 */

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{enum_param, integer_param, object_schema, render_result, required_str, u64_or, unknown_tool, ToolServer, ToolSpec};
use crate::cache::ResolveCache;
use crate::endpoints::{resolve_ping_targets, ResolutionContext};
use crate::errors::HomelabError;
use crate::inventory::normalize;
use crate::models::{PingTable, PingTarget};
use crate::remote::fan_out;

const SERVICE: &str = "Ping";

#[derive(Debug, Clone, PartialEq)]
pub struct PingReply {
    pub packet_loss: f64,
    pub avg_rtt_ms: Option<f64>,
}

#[async_trait]
pub trait Pinger: Send + Sync {
    /// `Ok` seulement si au moins une réponse est reçue.
    async fn echo(&self, address: &str, count: u64, timeout_secs: u64) -> Result<PingReply, HomelabError>;
}

/// Binaire `ping` du système (`-c <count> -W <timeout>`).
pub struct SystemPing;

static RECEIVED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) packets transmitted, (\d+) (?:packets )?received").expect("valid ping summary pattern")
});
static LOSS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d.]+)% packet loss").expect("valid packet loss pattern"));
static RTT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"= [\d.]+/([\d.]+)/").expect("valid rtt pattern"));

/// Extrait (reçus, perte %, rtt moyen) de la sortie de `ping`.
pub fn parse_ping_output(output: &str) -> Option<(u64, f64, Option<f64>)> {
    let caps = RECEIVED.captures(output)?;
    let received = caps[2].parse().ok()?;
    let loss = LOSS
        .captures(output)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(if received == 0 { 100.0 } else { 0.0 });
    let rtt = RTT.captures(output).and_then(|c| c[1].parse().ok());
    Some((received, loss, rtt))
}

#[async_trait]
impl Pinger for SystemPing {
    async fn echo(&self, address: &str, count: u64, timeout_secs: u64) -> Result<PingReply, HomelabError> {
        let mut cmd = Command::new("ping");
        cmd.args(["-c", &count.to_string(), "-W", &timeout_secs.to_string(), address])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let deadline = Duration::from_secs(count * timeout_secs + 5);
        let output = match tokio::time::timeout(deadline, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(HomelabError::unexpected(SERVICE, address, format!("cannot run ping: {e}"))),
            Err(_) => return Err(HomelabError::timeout(SERVICE, address, deadline.as_secs())),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(address, status = ?output.status.code(), "ping finished");
        match parse_ping_output(&stdout) {
            Some((received, loss, rtt)) if received > 0 => Ok(PingReply { packet_loss: loss, avg_rtt_ms: rtt }),
            Some(_) => Err(HomelabError::connection(SERVICE, address, "no reply (100% packet loss)")),
            None => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let reason = stderr.lines().next().filter(|l| !l.is_empty()).unwrap_or("host unreachable");
                Err(HomelabError::connection(SERVICE, address, reason.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingOutcome {
    pub target: PingTarget,
    pub result: Result<PingReply, HomelabError>,
}

impl PingOutcome {
    pub fn reachable(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct PingServer {
    cache: ResolveCache<PingTable>,
    pinger: Arc<dyn Pinger>,
}

impl PingServer {
    pub fn new(ctx: ResolutionContext) -> Self {
        Self::with_pinger(ctx, Arc::new(SystemPing))
    }

    pub fn with_pinger(ctx: ResolutionContext, pinger: Arc<dyn Pinger>) -> Self {
        Self { cache: ResolveCache::new(move || resolve_ping_targets(&ctx)), pinger }
    }

    pub fn targets(&self) -> Arc<PingTable> {
        self.cache.get()
    }

    fn require_targets(&self) -> Result<Arc<PingTable>, HomelabError> {
        let table = self.targets();
        if table.is_empty() {
            return Err(HomelabError::ConfigurationMissing {
                service: SERVICE.into(),
                hint: "Set ANSIBLE_INVENTORY_PATH or define PING_TARGET1 / PING_TARGET1_NAME".into(),
            });
        }
        Ok(table)
    }

    async fn ping_each(&self, targets: Vec<PingTarget>, count: u64, timeout: u64) -> Vec<PingOutcome> {
        let mut outcomes = fan_out(targets, |target| async move {
            let result = self.pinger.echo(&target.address, count, timeout).await;
            PingOutcome { target, result }
        })
        .await;
        outcomes.sort_by(|a, b| {
            b.reachable()
                .cmp(&a.reachable())
                .then_with(|| a.target.display_name.cmp(&b.target.display_name))
        });
        outcomes
    }

    pub async fn ping_host(&self, hostname: &str, count: u64, timeout: u64) -> Result<PingOutcome, HomelabError> {
        let table = self.require_targets()?;
        let target = table
            .targets
            .get(hostname)
            .or_else(|| table.targets.get(&normalize(hostname)))
            .cloned()
            .ok_or_else(|| {
                HomelabError::not_found(SERVICE, "host", hostname, table.targets.keys().cloned(), "ping_list_hosts")
            })?;
        let result = self.pinger.echo(&target.address, count, timeout).await;
        Ok(PingOutcome { target, result })
    }

    pub async fn ping_group(&self, group: &str, count: u64, timeout: u64) -> Result<Vec<PingOutcome>, HomelabError> {
        let table = self.require_targets()?;
        // nom feuille, sans casse, puis dernier segment d'un chemin (`all/lab/gpu`)
        let leaf = group.rsplit('/').next().unwrap_or(group);
        let members = table
            .groups
            .get(group)
            .or_else(|| {
                table
                    .groups
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(group))
                    .map(|(_, members)| members)
            })
            .or_else(|| table.groups.get(leaf))
            .ok_or_else(|| {
                HomelabError::not_found(SERVICE, "group", group, table.groups.keys().cloned(), "ping_list_groups")
            })?;
        let targets = members.iter().filter_map(|name| table.targets.get(name).cloned()).collect();
        Ok(self.ping_each(targets, count, timeout).await)
    }

    pub async fn ping_all(&self, count: u64, timeout: u64) -> Result<Vec<PingOutcome>, HomelabError> {
        let table = self.require_targets()?;
        let targets = table.targets.values().cloned().collect();
        Ok(self.ping_each(targets, count, timeout).await)
    }

    fn list_groups(&self) -> Result<String, HomelabError> {
        let table = self.require_targets()?;
        let mut out = format!("Groups ({}):\n", table.groups.len());
        for (name, members) in &table.groups {
            out.push_str(&format!("  {name}: {} host(s)\n", members.len()));
        }
        Ok(out)
    }

    fn list_hosts(&self) -> Result<String, HomelabError> {
        let table = self.require_targets()?;
        let mut out = format!("Hosts ({}):\n", table.targets.len());
        for target in table.targets.values() {
            out.push_str(&format!("  {} - {} [{}]\n", target.display_name, target.address, target.groups.join(", ")));
        }
        Ok(out)
    }
}

fn clamp_args(args: &Value, count: u64, timeout: u64) -> (u64, u64) {
    (u64_or(args, "count", count).clamp(1, 20), u64_or(args, "timeout", timeout).clamp(1, 30))
}

fn outcome_line(o: &PingOutcome) -> String {
    match &o.result {
        Ok(r) => {
            let rtt = r.avg_rtt_ms.map_or("n/a".to_string(), |v| format!("{v:.1} ms"));
            format!("✓ {} ({}): avg {rtt}, {:.0}% loss", o.target.display_name, o.target.address, r.packet_loss)
        }
        Err(e) => format!("✗ {} ({}): {e}", o.target.display_name, o.target.address),
    }
}

pub fn render_outcomes(title: &str, outcomes: &[PingOutcome]) -> String {
    let reachable = outcomes.iter().filter(|o| o.reachable()).count();
    let mut out = format!("{title}\nReachable: {reachable}/{}\n\n", outcomes.len());
    for o in outcomes {
        out.push_str(&outcome_line(o));
        out.push('\n');
    }
    out
}

#[async_trait]
impl ToolServer for PingServer {
    fn prefix(&self) -> &'static str {
        "ping_"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        let table = self.targets();
        let hosts: Vec<String> = table.targets.keys().cloned().collect();
        let groups: Vec<String> = table.groups.keys().cloned().collect();
        vec![
            ToolSpec::no_args("ping_list_groups", "List groups available for group pings"),
            ToolSpec::no_args("ping_list_hosts", "List ping targets with their addresses"),
            ToolSpec::new(
                "ping_host",
                "Ping one host",
                object_schema(
                    vec![
                        ("hostname", enum_param("Host", &hosts)),
                        ("count", integer_param("Echo requests", 4)),
                        ("timeout", integer_param("Seconds per reply", 5)),
                    ],
                    &["hostname"],
                ),
            ),
            ToolSpec::new(
                "ping_group",
                "Ping every host of a group concurrently",
                object_schema(
                    vec![
                        ("group", enum_param("Group", &groups)),
                        ("count", integer_param("Echo requests", 2)),
                        ("timeout", integer_param("Seconds per reply", 3)),
                    ],
                    &["group"],
                ),
            ),
            ToolSpec::new(
                "ping_all",
                "Ping every known host concurrently",
                object_schema(
                    vec![("count", integer_param("Echo requests", 2)), ("timeout", integer_param("Seconds per reply", 3))],
                    &[],
                ),
            ),
            ToolSpec::no_args("ping_reload_inventory", "Re-resolve ping targets"),
        ]
    }

    async fn call(&self, tool: &str, args: &Value) -> String {
        let result = match tool {
            "ping_list_groups" => self.list_groups(),
            "ping_list_hosts" => self.list_hosts(),
            "ping_host" => {
                let (count, timeout) = clamp_args(args, 4, 5);
                match required_str(tool, args, "hostname") {
                    Ok(h) => self.ping_host(h, count, timeout).await.map(|o| outcome_line(&o)),
                    Err(e) => Err(e),
                }
            }
            "ping_group" => {
                let (count, timeout) = clamp_args(args, 2, 3);
                match required_str(tool, args, "group") {
                    Ok(g) => self
                        .ping_group(g, count, timeout)
                        .await
                        .map(|o| render_outcomes(&format!("Group {g}"), &o)),
                    Err(e) => Err(e),
                }
            }
            "ping_all" => {
                let (count, timeout) = clamp_args(args, 2, 3);
                self.ping_all(count, timeout).await.map(|o| render_outcomes("All hosts", &o))
            }
            "ping_reload_inventory" => {
                self.cache.invalidate();
                Ok(format!("✓ Ping targets reloaded: {}", self.cache.get().targets.len()))
            }
            _ => return unknown_tool(self, tool),
        };
        render_result(result)
    }

    fn cache_populated(&self) -> bool {
        self.cache.is_populated()
    }
}
