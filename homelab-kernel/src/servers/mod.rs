/**
 * SOUS-SERVEURS - un par domaine, chacun propriétaire de ses caches
 *
 * FONCTIONNEMENT :
 * - Outils nommés avec paramètres JSON-schema (enums construits depuis la résolution courante)
 * - Chaque appel répond par du texte ; les échecs y sont rendus, rien ne s'échappe
 */

pub mod ansible;
pub mod docker;
pub mod ollama;
pub mod pihole;
pub mod ping;
pub mod unifi;
pub mod ups;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::errors::HomelabError;
use crate::inventory::normalize;
use crate::models::{EndpointRecord, EndpointTable};

pub use ansible::AnsibleServer;
pub use docker::DockerServer;
pub use ollama::OllamaServer;
pub use pihole::PiholeServer;
pub use ping::PingServer;
pub use unifi::UnifiServer;
pub use ups::UpsServer;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self { name: name.into(), description: description.into(), input_schema }
    }

    pub fn no_args(name: &str, description: &str) -> Self {
        Self::new(name, description, object_schema(Vec::new(), &[]))
    }
}

#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Préfixe des noms d'outils (`docker_`, `ping_`...).
    fn prefix(&self) -> &'static str;

    fn tools(&self) -> Vec<ToolSpec>;

    async fn call(&self, tool: &str, args: &Value) -> String;

    /// Etat du cache de résolution, pour /system/health.
    fn cache_populated(&self) -> bool;
}

/// Réponse standard pour un outil inconnu du sous-serveur.
pub fn unknown_tool(server: &dyn ToolServer, tool: &str) -> String {
    let names: Vec<String> = server.tools().into_iter().map(|t| t.name).collect();
    HomelabError::not_found(server.prefix().trim_end_matches('_'), "tool", tool, names, "homelab_get_tool_catalog")
        .render()
}

pub fn object_schema(properties: Vec<(&str, Value)>, required: &[&str]) -> Value {
    let props: Map<String, Value> = properties.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    json!({
        "type": "object",
        "properties": props,
        "required": required,
    })
}

pub fn string_param(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

/// Paramètre chaîne avec énumération dynamique (vide => pas d'enum).
pub fn enum_param(description: &str, values: &[String]) -> Value {
    let mut param = string_param(description);
    if !values.is_empty() {
        param["enum"] = json!(values);
    }
    param
}

pub fn integer_param(description: &str, default: u64) -> Value {
    json!({ "type": "integer", "description": description, "default": default })
}

pub fn required_str<'a>(tool: &str, args: &'a Value, key: &str) -> Result<&'a str, HomelabError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HomelabError::invalid_argument(tool, format!("missing required parameter '{key}'")))
}

pub fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

/// Entier optionnel ; accepte aussi `"4"`.
pub fn u64_or(args: &Value, key: &str, default: u64) -> u64 {
    match args.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

/// Cherche un endpoint par display name (forme brute acceptée : `Dns_1.lan` -> `dns-1`).
pub fn find_endpoint<'a>(
    table: &'a EndpointTable,
    service: &str,
    hostname: &str,
    list_tool: &str,
) -> Result<&'a EndpointRecord, HomelabError> {
    table
        .get(hostname)
        .or_else(|| table.get(&normalize(hostname)))
        .ok_or_else(|| HomelabError::not_found(service, "host", hostname, table.keys().cloned(), list_tool))
}

/// Aplatit un Result d'outil en texte.
pub fn render_result(result: Result<String, HomelabError>) -> String {
    result.unwrap_or_else(|e| e.render())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_helpers() {
        let schema = object_schema(
            vec![("hostname", enum_param("Host", &["a".into(), "b".into()])), ("count", integer_param("Count", 4))],
            &["hostname"],
        );
        assert_eq!(schema["properties"]["hostname"]["enum"], json!(["a", "b"]));
        assert_eq!(schema["properties"]["count"]["default"], json!(4));
        assert_eq!(schema["required"], json!(["hostname"]));

        assert!(enum_param("Host", &[]).get("enum").is_none());
    }

    #[test]
    fn argument_helpers() {
        let args = json!({"hostname": " cyber ", "count": "3", "tail": 50, "empty": ""});
        assert_eq!(required_str("t", &args, "hostname").unwrap(), "cyber");
        assert!(matches!(
            required_str("t", &args, "empty"),
            Err(HomelabError::InvalidArgument { .. })
        ));
        assert_eq!(u64_or(&args, "count", 4), 3);
        assert_eq!(u64_or(&args, "tail", 100), 50);
        assert_eq!(u64_or(&args, "missing", 100), 100);
        assert_eq!(optional_str(&args, "empty"), None);
    }
}
