/**
 * DISPATCHER - routage des appels d'outils vers les sous-serveurs
 *
 * FONCTIONNEMENT :
 * - Registre ordonné de sous-serveurs, chacun identifié par son préfixe (`docker_`, `ping_`...)
 * - Un appel est routé vers le premier sous-serveur dont le préfixe correspond
 * - `homelab_get_tool_catalog` est servi ici : liste des outils groupés par préfixe
 * - Chaque appel porte un call_id (uuid v4) dans un span tracing
 *
 * Un outil inconnu donne un texte NotFound, jamais une erreur remontée.
 */

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::errors::HomelabError;
use crate::servers::{ToolServer, ToolSpec};

pub const CATALOG_TOOL: &str = "homelab_get_tool_catalog";

#[derive(Default)]
pub struct Dispatcher {
    servers: Vec<Arc<dyn ToolServer>>,
    calls: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Un préfixe déjà enregistré est refusé (le premier reste en place).
    pub fn register(&mut self, server: Arc<dyn ToolServer>) -> &mut Self {
        let prefix = server.prefix();
        if self.servers.iter().any(|s| s.prefix() == prefix) {
            warn!(prefix, "sub-server prefix already registered, ignoring");
            return self;
        }
        info!(prefix, tools = server.tools().len(), "sub-server registered");
        self.servers.push(server);
        self
    }

    pub fn servers(&self) -> &[Arc<dyn ToolServer>] {
        &self.servers
    }

    pub fn route(&self, tool: &str) -> Option<&Arc<dyn ToolServer>> {
        self.servers.iter().find(|s| tool.starts_with(s.prefix()))
    }

    /// Outils par préfixe (sans `_` final), catalogue inclus sous `homelab`.
    pub fn catalog(&self) -> BTreeMap<String, Vec<ToolSpec>> {
        let mut catalog: BTreeMap<String, Vec<ToolSpec>> = self
            .servers
            .iter()
            .map(|s| (s.prefix().trim_end_matches('_').to_string(), s.tools()))
            .collect();
        catalog.insert(
            "homelab".into(),
            vec![ToolSpec::no_args(CATALOG_TOOL, "List every available tool grouped by service")],
        );
        catalog
    }

    pub fn tool_count(&self) -> usize {
        self.catalog().values().map(Vec::len).sum()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub async fn call(&self, tool: &str, args: &Value) -> String {
        let call_id = Uuid::new_v4();
        self.calls.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("tool_call", %call_id, tool);

        async move {
            let started = Instant::now();
            let text = if tool == CATALOG_TOOL {
                self.catalog_text()
            } else if let Some(server) = self.route(tool) {
                server.call(tool, args).await
            } else {
                warn!("unknown tool");
                self.unknown(tool)
            };
            info!(elapsed_ms = started.elapsed().as_millis() as u64, failed = text.starts_with('✗'), "tool call done");
            text
        }
        .instrument(span)
        .await
    }

    fn unknown(&self, tool: &str) -> String {
        let names = self.catalog().into_values().flatten().map(|t| t.name);
        HomelabError::not_found("homelab", "tool", tool, names, CATALOG_TOOL).render()
    }

    fn catalog_text(&self) -> String {
        let catalog = self.catalog();
        let total: usize = catalog.values().map(Vec::len).sum();
        let mut out = format!("Homelab tools ({total})\n");
        for (service, tools) in catalog {
            out.push_str(&format!("\n{service} ({}):\n", tools.len()));
            for t in tools {
                out.push_str(&format!("  {} - {}\n", t.name, t.description));
            }
        }
        out
    }
}
