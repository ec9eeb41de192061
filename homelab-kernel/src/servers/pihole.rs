/**
 * PI-HOLE - statistiques DNS via l'API v6 authentifiée
 *
 * FONCTIONNEMENT :
 * - Endpoints : groupe PiHole de l'inventaire, sinon PIHOLE_<NAME>_HOST
 * - Chaque requête passe par le SessionCache (sid en paramètre de requête)
 * - Un 401 sur une requête authentifiée = session révoquée : oubliée, réessai au prochain appel
 * - Fan-out sur tous les serveurs ; un serveur en erreur reste une ligne du résultat
 */

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use super::{render_result, unknown_tool, ToolServer, ToolSpec};
use crate::cache::ResolveCache;
use crate::endpoints::{resolve_endpoints, ResolutionContext, PIHOLE};
use crate::errors::HomelabError;
use crate::models::{EndpointRecord, EndpointTable};
use crate::remote::{fan_out, RemoteClient, DEFAULT_TIMEOUT};
use crate::session::{Authenticator, PiholeAuthenticator, SessionCache};

const SERVICE: &str = "Pi-hole";

#[derive(Debug, Clone, PartialEq)]
pub struct PiholeStats {
    pub total_queries: u64,
    pub blocked: u64,
    pub percent_blocked: f64,
    pub active_clients: u64,
    pub domains_blocked: u64,
}

pub struct PiholeServer {
    cache: ResolveCache<EndpointTable>,
    sessions: SessionCache,
    client: RemoteClient,
}

impl PiholeServer {
    pub fn new(ctx: ResolutionContext) -> Self {
        let client = RemoteClient::new(SERVICE);
        let auth = Arc::new(PiholeAuthenticator::new(client.clone()));
        Self::with_parts(ctx, client, auth)
    }

    pub fn with_parts(ctx: ResolutionContext, client: RemoteClient, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            cache: ResolveCache::new(move || resolve_endpoints(&PIHOLE, &ctx)),
            sessions: SessionCache::new(authenticator),
            client,
        }
    }

    pub fn endpoints(&self) -> Arc<EndpointTable> {
        self.cache.get()
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    pub fn reload(&self) -> usize {
        self.cache.invalidate();
        self.sessions.clear();
        self.cache.get().len()
    }

    fn require_endpoints(&self) -> Result<Arc<EndpointTable>, HomelabError> {
        let table = self.endpoints();
        if table.is_empty() {
            return Err(HomelabError::ConfigurationMissing {
                service: SERVICE.into(),
                hint: "Add hosts to the PiHole inventory group, or set PIHOLE_<NAME>_HOST and PIHOLE_API_KEY_<NAME>"
                    .into(),
            });
        }
        Ok(table)
    }

    pub async fn fetch_stats(&self, endpoint: &EndpointRecord) -> Result<PiholeStats, HomelabError> {
        let session = self.sessions.get_session(endpoint).await?;
        let url = format!("{}/api/stats/summary", endpoint.base_url());
        let req = self.client.http().get(&url).query(&[("sid", session.token.as_str())]);

        match self.client.json(&endpoint.display_name, req, DEFAULT_TIMEOUT).await {
            Ok(body) => Ok(parse_summary(&body)),
            Err(HomelabError::Http { status: 401, .. }) => {
                self.sessions.forget(&endpoint.display_name);
                Err(HomelabError::auth(SERVICE, &endpoint.display_name, "session expired or revoked; retry"))
            }
            Err(e) => Err(e),
        }
    }

    /// Stats de tous les serveurs, en parallèle ; l'ordre suit la table.
    pub async fn collect_stats(&self) -> Result<Vec<(String, Result<PiholeStats, HomelabError>)>, HomelabError> {
        let table = self.require_endpoints()?;
        let results = fan_out(table.values(), |ep| async move {
            let result = self.fetch_stats(ep).await;
            if let Err(e) = &result {
                warn!(host = %ep.display_name, error = %e, "pihole query failed");
            }
            (ep.display_name.clone(), result)
        })
        .await;
        Ok(results)
    }

    async fn stats_text(&self) -> Result<String, HomelabError> {
        let results = self.collect_stats().await?;
        let mut out = String::from("Pi-hole statistics\n\n");
        for (name, result) in results {
            match result {
                Ok(s) => out.push_str(&format!(
                    "✓ {name}\n  Queries: {}\n  Blocked: {} ({:.1}%)\n  Active clients: {}\n  Domains on blocklist: {}\n",
                    s.total_queries, s.blocked, s.percent_blocked, s.active_clients, s.domains_blocked
                )),
                Err(e) => out.push_str(&format!("✗ {name}\n{}\n", indent(&e.render()))),
            }
        }
        Ok(out)
    }

    async fn status_text(&self) -> Result<String, HomelabError> {
        let results = self.collect_stats().await?;
        let online = results.iter().filter(|(_, r)| r.is_ok()).count();
        let mut out = format!("Pi-hole status - Online: {online}/{}\n\n", results.len());
        for (name, result) in results {
            match result {
                Ok(_) => out.push_str(&format!("✓ {name}: online\n")),
                Err(e) => out.push_str(&format!("✗ {name}: {e}\n")),
            }
        }
        Ok(out)
    }
}

fn indent(text: &str) -> String {
    text.lines().filter(|l| !l.is_empty()).map(|l| format!("  {l}")).collect::<Vec<_>>().join("\n")
}

/// `/api/stats/summary` : queries.{total, blocked, percent_blocked}, clients.active, gravity.domains_being_blocked.
pub fn parse_summary(body: &Value) -> PiholeStats {
    let uint = |ptr: &str| body.pointer(ptr).and_then(Value::as_u64).unwrap_or(0);
    PiholeStats {
        total_queries: uint("/queries/total"),
        blocked: uint("/queries/blocked"),
        percent_blocked: body.pointer("/queries/percent_blocked").and_then(Value::as_f64).unwrap_or(0.0),
        active_clients: uint("/clients/active"),
        domains_blocked: uint("/gravity/domains_being_blocked"),
    }
}

#[async_trait]
impl ToolServer for PiholeServer {
    fn prefix(&self) -> &'static str {
        "pihole_"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec::no_args("pihole_get_stats", "Query and blocking statistics of every Pi-hole"),
            ToolSpec::no_args("pihole_get_status", "Which Pi-hole servers answer authenticated requests"),
            ToolSpec::no_args("pihole_reload_inventory", "Re-resolve Pi-hole servers and drop cached sessions"),
        ]
    }

    async fn call(&self, tool: &str, _args: &Value) -> String {
        let result = match tool {
            "pihole_get_stats" => self.stats_text().await,
            "pihole_get_status" => self.status_text().await,
            "pihole_reload_inventory" => Ok(format!("✓ Pi-hole servers reloaded: {}", self.reload())),
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

    #[test]
    fn summary_fields() {
        let body = json!({
            "queries": {"total": 1200, "blocked": 300, "percent_blocked": 25.0},
            "clients": {"active": 14},
            "gravity": {"domains_being_blocked": 150000}
        });
        let s = parse_summary(&body);
        assert_eq!(s.total_queries, 1200);
        assert_eq!(s.blocked, 300);
        assert_eq!(s.percent_blocked, 25.0);
        assert_eq!(s.active_clients, 14);
        assert_eq!(s.domains_blocked, 150000);
    }

    #[test]
    fn partial_summary_defaults_to_zero() {
        let s = parse_summary(&json!({"queries": {"total": 5}}));
        assert_eq!(s.total_queries, 5);
        assert_eq!(s.blocked, 0);
    }
}
