/**
 * UPS - onduleurs via le protocole texte NUT (upsd, port 3493)
 *
 * ÉCHANGE PAR REQUÊTE :
 *   [USERNAME u / PASSWORD p]  si des identifiants sont résolus
 *   LIST VAR <ups>             -> BEGIN LIST VAR / VAR <ups> <nom> "<valeur>" ... / END LIST VAR
 *   LOGOUT
 * Connexion et lecture bornées à 5 s au total. Une réponse `ERR ...` devient une HomelabError.
 */

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{
    enum_param, find_endpoint, object_schema, optional_str, render_result, required_str, string_param, unknown_tool,
    ToolServer, ToolSpec,
};
use crate::cache::ResolveCache;
use crate::endpoints::{resolve_endpoints, ResolutionContext, NUT};
use crate::errors::HomelabError;
use crate::models::{EndpointRecord, EndpointTable};
use crate::remote::{fan_out, DEFAULT_TIMEOUT};

const SERVICE: &str = "UPS";

const STATUS_CODES: &[(&str, &str)] = &[
    ("OL", "Online"),
    ("OB", "On Battery"),
    ("LB", "Low Battery"),
    ("HB", "High Battery"),
    ("RB", "Replace Battery"),
    ("CHRG", "Charging"),
    ("DISCHRG", "Discharging"),
    ("BYPASS", "Bypass Mode"),
    ("CAL", "Calibrating"),
    ("OFF", "Offline"),
    ("OVER", "Overloaded"),
    ("TRIM", "Trimming Voltage"),
    ("BOOST", "Boosting Voltage"),
    ("FSD", "Forced Shutdown"),
];

/// `ups.status` brut -> libellés lisibles ; code inconnu conservé tel quel.
pub fn describe_status(raw: &str) -> Vec<String> {
    let labels: Vec<String> = raw
        .split_whitespace()
        .map(|code| {
            STATUS_CODES
                .iter()
                .find(|(c, _)| *c == code)
                .map_or_else(|| code.to_string(), |(_, label)| label.to_string())
        })
        .collect();
    if labels.is_empty() {
        vec!["Unknown".to_string()]
    } else {
        labels
    }
}

/// `VAR <ups> <nom> "<valeur>"` -> (nom, valeur).
pub fn parse_var_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("VAR ")?;
    let (_ups, rest) = rest.split_once(' ')?;
    let (name, value) = rest.split_once(' ')?;
    let value = value.trim();
    let value = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(value);
    Some((name.to_string(), value.replace("\\\"", "\"")))
}

/// Secondes restantes -> `1h 5m` / `12 min`.
pub fn format_runtime(raw: &str) -> Option<String> {
    let secs = raw.trim().parse::<f64>().ok()? as u64;
    let (hours, minutes) = (secs / 3600, (secs % 3600) / 60);
    Some(if hours > 0 { format!("{hours}h {minutes}m") } else { format!("{minutes} min") })
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpsReading {
    pub ups: String,
    pub vars: BTreeMap<String, String>,
}

impl UpsReading {
    pub fn var(&self, key: &str) -> &str {
        self.vars.get(key).map_or("N/A", String::as_str)
    }

    pub fn status_raw(&self) -> &str {
        self.vars.get("ups.status").map_or("", String::as_str)
    }

    pub fn is_online(&self) -> bool {
        self.status_raw().split_whitespace().any(|c| c == "OL")
    }

    pub fn on_battery(&self) -> bool {
        self.status_raw().split_whitespace().any(|c| c == "OB")
    }

    fn icon(&self) -> &'static str {
        if self.is_online() {
            "✓"
        } else if self.on_battery() {
            "⚠"
        } else {
            "✗"
        }
    }
}

/// Client NUT minimal, une connexion par requête.
#[derive(Debug, Clone)]
pub struct NutClient {
    timeout: Duration,
}

impl Default for NutClient {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(DEFAULT_TIMEOUT) }
    }
}

impl NutClient {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn list_vars(&self, endpoint: &EndpointRecord, ups: &str) -> Result<UpsReading, HomelabError> {
        let host = endpoint.display_name.as_str();
        match tokio::time::timeout(self.timeout, self.exchange(endpoint, ups)).await {
            Ok(result) => result,
            Err(_) => Err(HomelabError::timeout(SERVICE, host, self.timeout.as_secs())),
        }
    }

    async fn exchange(&self, endpoint: &EndpointRecord, ups: &str) -> Result<UpsReading, HomelabError> {
        let host = endpoint.display_name.as_str();
        let io_err = |e: std::io::Error| HomelabError::connection(SERVICE, host, e.to_string());

        let stream = TcpStream::connect(&endpoint.address).await.map_err(io_err)?;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        if let Some(creds) = &endpoint.credentials {
            if let Some(user) = creds.username.as_deref().filter(|u| !u.is_empty()) {
                if !creds.secret.is_empty() {
                    command(&mut write, &format!("USERNAME {user}")).await.map_err(io_err)?;
                    expect_ok(&mut lines, endpoint, ups).await?;
                    command(&mut write, &format!("PASSWORD {}", creds.secret)).await.map_err(io_err)?;
                    expect_ok(&mut lines, endpoint, ups).await?;
                }
            }
        }

        command(&mut write, &format!("LIST VAR {ups}")).await.map_err(io_err)?;
        let mut reading = UpsReading { ups: ups.to_string(), vars: BTreeMap::new() };
        while let Some(line) = lines.next_line().await.map_err(io_err)? {
            let line = line.trim();
            if line.starts_with("ERR") {
                return Err(nut_error(endpoint, ups, line));
            }
            if line.starts_with("END LIST VAR") {
                break;
            }
            if let Some((name, value)) = parse_var_line(line) {
                reading.vars.insert(name, value);
            }
        }

        // fermeture polie ; une erreur ici ne change rien au résultat
        if command(&mut write, "LOGOUT").await.is_err() {
            debug!(host, "NUT logout not delivered");
        }
        Ok(reading)
    }
}

async fn command(write: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    write.write_all(format!("{line}\n").as_bytes()).await?;
    write.flush().await
}

async fn expect_ok(lines: &mut Lines<BufReader<OwnedReadHalf>>, endpoint: &EndpointRecord, ups: &str) -> Result<(), HomelabError> {
    let host = endpoint.display_name.as_str();
    match lines.next_line().await {
        Ok(Some(line)) if line.starts_with("ERR") => Err(nut_error(endpoint, ups, line.trim())),
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(HomelabError::connection(SERVICE, host, "connection closed during login")),
        Err(e) => Err(HomelabError::connection(SERVICE, host, e.to_string())),
    }
}

fn nut_error(endpoint: &EndpointRecord, ups: &str, line: &str) -> HomelabError {
    let host = endpoint.display_name.as_str();
    let code = line.trim_start_matches("ERR").trim();
    match code {
        "UNKNOWN-UPS" => HomelabError::not_found(
            SERVICE,
            "UPS device",
            ups,
            endpoint.devices.iter().map(|d| d.name.clone()),
            "ups_list_hosts",
        ),
        "ACCESS-DENIED" | "USERNAME-REQUIRED" | "PASSWORD-REQUIRED" | "INVALID-PASSWORD" | "INVALID-USERNAME" => {
            HomelabError::auth(SERVICE, host, format!("upsd refused login ({code}); check NUT_USERNAME / NUT_PASSWORD"))
        }
        _ => HomelabError::unexpected(SERVICE, host, format!("upsd answered {code}")),
    }
}

/// Une ligne de collecte : serveur, onduleur, lecture.
pub type UpsOutcome = (String, String, Result<UpsReading, HomelabError>);

pub struct UpsServer {
    cache: ResolveCache<EndpointTable>,
    nut: NutClient,
}

impl UpsServer {
    pub fn new(ctx: ResolutionContext) -> Self {
        Self::with_client(ctx, NutClient::default())
    }

    pub fn with_client(ctx: ResolutionContext, nut: NutClient) -> Self {
        Self { cache: ResolveCache::new(move || resolve_endpoints(&NUT, &ctx)), nut }
    }

    pub fn endpoints(&self) -> Arc<EndpointTable> {
        self.cache.get()
    }

    fn require_endpoints(&self) -> Result<Arc<EndpointTable>, HomelabError> {
        let table = self.endpoints();
        if table.is_empty() {
            return Err(HomelabError::ConfigurationMissing {
                service: SERVICE.into(),
                hint: "Add hosts to the nut_servers inventory group, or set NUT_<NAME>_HOST".into(),
            });
        }
        Ok(table)
    }

    /// Interroge chaque onduleur de chaque serveur NUT en parallèle.
    pub async fn collect(&self) -> Result<Vec<UpsOutcome>, HomelabError> {
        let table = self.require_endpoints()?;
        let pairs: Vec<(&EndpointRecord, String)> = table
            .values()
            .flat_map(|ep| ep.devices.iter().map(move |d| (ep, d.name.clone())))
            .collect();
        Ok(fan_out(pairs, |(ep, ups)| async move {
            let result = self.nut.list_vars(ep, &ups).await;
            if let Err(e) = &result {
                warn!(host = %ep.display_name, ups = %ups, error = %e, "NUT query failed");
            }
            (ep.display_name.clone(), ups, result)
        })
        .await)
    }

    fn list_hosts(&self) -> Result<String, HomelabError> {
        let table = self.require_endpoints()?;
        let mut out = format!("NUT servers ({}):\n\n", table.len());
        for ep in table.values() {
            out.push_str(&format!("{} ({})\n", ep.display_name, ep.address));
            for d in &ep.devices {
                match &d.description {
                    Some(desc) => out.push_str(&format!("  - {}: {desc}\n", d.name)),
                    None => out.push_str(&format!("  - {}\n", d.name)),
                }
            }
        }
        Ok(out)
    }

    async fn status_text(&self) -> Result<String, HomelabError> {
        let outcomes = self.collect().await?;
        let mut out = String::from("UPS status\n\n");
        let mut all_online = true;
        for (server, ups, result) in &outcomes {
            match result {
                Ok(r) => {
                    all_online &= r.is_online();
                    out.push_str(&reading_summary(server, r));
                }
                Err(e) => {
                    all_online = false;
                    out.push_str(&format!("✗ {ups} on {server}: {e}\n"));
                }
            }
            out.push('\n');
        }
        out.push_str(&format!("Total UPS devices: {}\n", outcomes.len()));
        if all_online {
            out.push_str("Status: all systems online ✓\n");
        } else {
            out.push_str("Status: ⚠ ALERT - one or more UPS on battery, offline or unreachable\n");
        }
        Ok(out)
    }

    async fn details_text(&self, hostname: &str, ups_name: Option<&str>) -> Result<String, HomelabError> {
        let table = self.require_endpoints()?;
        let ep = find_endpoint(&table, SERVICE, hostname, "ups_list_hosts")?;
        let ups = match ups_name {
            Some(name) => ep.devices.iter().find(|d| d.name == name).ok_or_else(|| {
                HomelabError::not_found(SERVICE, "UPS device", name, ep.devices.iter().map(|d| d.name.clone()), "ups_list_hosts")
            })?,
            None => ep.devices.first().ok_or_else(|| HomelabError::ConfigurationMissing {
                service: SERVICE.into(),
                hint: format!("No ups_devices configured for {}", ep.display_name),
            })?,
        };

        let reading = self.nut.list_vars(ep, &ups.name).await?;
        let mut out = format!("UPS {} on {}\n\n", ups.name, ep.display_name);
        if reading.vars.is_empty() {
            out.push_str("No data available from UPS\n");
            return Ok(out);
        }
        for (category, vars) in categorize(&reading.vars) {
            out.push_str(&format!("{category}:\n"));
            for (k, v) in vars {
                out.push_str(&format!("  {k}: {v}\n"));
            }
            out.push('\n');
        }
        Ok(out)
    }

    async fn battery_text(&self) -> Result<String, HomelabError> {
        let outcomes = self.collect().await?;
        let mut out = String::from("Battery runtime estimates\n\n");
        for (server, ups, result) in outcomes {
            match result {
                Ok(r) => out.push_str(&format!(
                    "{} {ups} ({server})\n  Charge: {}%\n  Runtime remaining: {}\n  Load: {}%\n\n",
                    r.icon(),
                    r.var("battery.charge"),
                    format_runtime(r.var("battery.runtime")).unwrap_or_else(|| "N/A".into()),
                    r.var("ups.load"),
                )),
                Err(e) => out.push_str(&format!("✗ {ups} ({server}): {e}\n\n")),
            }
        }
        Ok(out)
    }
}

fn reading_summary(server: &str, r: &UpsReading) -> String {
    let mut out = format!("{} {} on {server}\n", r.icon(), r.ups);
    out.push_str(&format!("  Model: {} {}\n", r.var("ups.mfr"), r.var("ups.model")));
    out.push_str(&format!("  Status: {}\n", describe_status(r.status_raw()).join(", ")));
    out.push_str(&format!("  Battery: {}%", r.var("battery.charge")));
    if let Some(runtime) = format_runtime(r.var("battery.runtime")) {
        out.push_str(&format!(" ({runtime} remaining)"));
    }
    out.push_str(&format!("\n  Load: {}%\n", r.var("ups.load")));
    if r.vars.contains_key("input.voltage") || r.vars.contains_key("output.voltage") {
        out.push_str(&format!("  Voltage: IN={}V OUT={}V\n", r.var("input.voltage"), r.var("output.voltage")));
    }
    out
}

const CATEGORIES: &[(&str, &[&str])] = &[
    ("Device info", &["device.", "ups.mfr", "ups.model", "ups.serial", "ups.firmware"]),
    ("Status", &["ups.status", "ups.alarm"]),
    ("Battery", &["battery."]),
    ("Input", &["input."]),
    ("Output", &["output."]),
    ("Load", &["ups.load", "ups.power", "ups.realpower"]),
];

/// Regroupe les variables par catégorie ; le reste va dans `Other`. Catégories vides omises.
pub fn categorize(vars: &BTreeMap<String, String>) -> Vec<(&'static str, Vec<(&str, &str)>)> {
    let mut groups: Vec<(&'static str, Vec<(&str, &str)>)> = CATEGORIES.iter().map(|(c, _)| (*c, Vec::new())).collect();
    let mut other = Vec::new();
    for (k, v) in vars {
        match CATEGORIES.iter().position(|(_, prefixes)| prefixes.iter().any(|p| k.starts_with(p))) {
            Some(i) => groups[i].1.push((k.as_str(), v.as_str())),
            None => other.push((k.as_str(), v.as_str())),
        }
    }
    groups.push(("Other", other));
    groups.retain(|(_, vars)| !vars.is_empty());
    groups
}

#[async_trait]
impl ToolServer for UpsServer {
    fn prefix(&self) -> &'static str {
        "ups_"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        let hosts: Vec<String> = self.endpoints().keys().cloned().collect();
        vec![
            ToolSpec::no_args("ups_list_hosts", "NUT servers and their UPS devices"),
            ToolSpec::no_args("ups_get_status", "Status of every UPS, with an alert when one is not on line power"),
            ToolSpec::new(
                "ups_get_details",
                "All variables of one UPS, grouped by category",
                object_schema(
                    vec![
                        ("hostname", enum_param("NUT server", &hosts)),
                        ("ups_name", string_param("UPS device name (first device when omitted)")),
                    ],
                    &["hostname"],
                ),
            ),
            ToolSpec::no_args("ups_get_battery_info", "Battery charge and runtime estimate of every UPS"),
            ToolSpec::no_args("ups_reload_inventory", "Re-resolve NUT servers"),
        ]
    }

    async fn call(&self, tool: &str, args: &Value) -> String {
        let result = match tool {
            "ups_list_hosts" => self.list_hosts(),
            "ups_get_status" => self.status_text().await,
            "ups_get_details" => match required_str(tool, args, "hostname") {
                Ok(h) => self.details_text(h, optional_str(args, "ups_name")).await,
                Err(e) => Err(e),
            },
            "ups_get_battery_info" => self.battery_text().await,
            "ups_reload_inventory" => {
                self.cache.invalidate();
                Ok(format!("✓ NUT servers reloaded: {}", self.cache.get().len()))
            }
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

    #[test]
    fn var_lines() {
        assert_eq!(
            parse_var_line(r#"VAR ups battery.charge "100""#),
            Some(("battery.charge".into(), "100".into()))
        );
        assert_eq!(
            parse_var_line(r#"VAR apc ups.model "Back-UPS XS 1500G""#),
            Some(("ups.model".into(), "Back-UPS XS 1500G".into()))
        );
        assert_eq!(parse_var_line("BEGIN LIST VAR ups"), None);
    }

    #[test]
    fn status_labels() {
        assert_eq!(describe_status("OL CHRG"), vec!["Online", "Charging"]);
        assert_eq!(describe_status("OB LB"), vec!["On Battery", "Low Battery"]);
        assert_eq!(describe_status("XYZ"), vec!["XYZ"]);
        assert_eq!(describe_status(""), vec!["Unknown"]);
    }

    #[test]
    fn online_detection_uses_whole_codes() {
        let mut r = UpsReading { ups: "ups".into(), vars: BTreeMap::new() };
        r.vars.insert("ups.status".into(), "OB DISCHRG".into());
        assert!(!r.is_online());
        assert!(r.on_battery());
        r.vars.insert("ups.status".into(), "OL".into());
        assert!(r.is_online());
    }

    #[test]
    fn runtime_format() {
        assert_eq!(format_runtime("3900").as_deref(), Some("1h 5m"));
        assert_eq!(format_runtime("720.0").as_deref(), Some("12 min"));
        assert_eq!(format_runtime("N/A"), None);
    }

    #[test]
    fn categories_skip_empty_and_collect_other() {
        let vars: BTreeMap<String, String> = [
            ("battery.charge", "90"),
            ("ups.status", "OL"),
            ("driver.name", "usbhid-ups"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let cats = categorize(&vars);
        let names: Vec<&str> = cats.iter().map(|(c, _)| *c).collect();
        assert_eq!(names, vec!["Status", "Battery", "Other"]);
        assert_eq!(cats[2].1, vec![("driver.name", "usbhid-ups")]);
    }
}
