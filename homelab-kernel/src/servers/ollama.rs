/**
 * OUTILS OLLAMA - serveurs de modèles et état du proxy LiteLLM (`ollama_*`)
 */

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{
    enum_param, find_endpoint, object_schema, render_result, required_str, string_param, unknown_tool, ToolServer,
    ToolSpec,
};
use crate::cache::ResolveCache;
use crate::config::LiteLlmConf;
use crate::endpoints::{resolve_endpoints, ResolutionContext, OLLAMA};
use crate::errors::HomelabError;
use crate::models::{EndpointRecord, EndpointTable};
use crate::remote::{fan_out, RemoteClient, DEFAULT_TIMEOUT, QUICK_TIMEOUT};

const SERVICE: &str = "Ollama";

#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    pub size_gb: f64,
    pub modified_at: String,
}

pub struct OllamaServer {
    cache: ResolveCache<EndpointTable>,
    client: RemoteClient,
    litellm: LiteLlmConf,
}

impl OllamaServer {
    pub fn new(ctx: ResolutionContext, litellm: LiteLlmConf) -> Self {
        Self::with_client(ctx, litellm, RemoteClient::new(SERVICE))
    }

    pub fn with_client(ctx: ResolutionContext, litellm: LiteLlmConf, client: RemoteClient) -> Self {
        // LITELLM_HOST / LITELLM_PORT priment sur le fichier de config
        let litellm = LiteLlmConf {
            host: ctx.env.get("LITELLM_HOST").map(str::to_string).unwrap_or(litellm.host),
            port: ctx.env.get("LITELLM_PORT").and_then(|p| p.parse().ok()).unwrap_or(litellm.port),
        };
        let cache = ResolveCache::new(move || resolve_endpoints(&OLLAMA, &ctx));
        Self { cache, client, litellm }
    }

    pub fn endpoints(&self) -> Arc<EndpointTable> {
        self.cache.get()
    }

    fn require_endpoints(&self) -> Result<Arc<EndpointTable>, HomelabError> {
        let table = self.endpoints();
        if table.is_empty() {
            return Err(HomelabError::ConfigurationMissing {
                service: SERVICE.into(),
                hint: "Add hosts to the ollama_servers inventory group, or set OLLAMA_<NAME>_ENDPOINT".into(),
            });
        }
        Ok(table)
    }

    pub async fn models(&self, endpoint: &EndpointRecord, timeout: u64) -> Result<Vec<ModelInfo>, HomelabError> {
        let url = format!("{}/api/tags", endpoint.base_url());
        let body = self.client.get_json(&endpoint.display_name, &url, timeout).await?;
        Ok(parse_models(&body))
    }

    async fn list_hosts(&self) -> Result<String, HomelabError> {
        let table = self.require_endpoints()?;
        let results = fan_out(table.values(), |ep| async move {
            (ep, self.models(ep, QUICK_TIMEOUT).await)
        })
        .await;

        let online = results.iter().filter(|(_, r)| r.is_ok()).count();
        let mut out = format!("Ollama servers - Online: {online}/{}\n\n", results.len());
        for (ep, result) in results {
            match result {
                Ok(models) => out.push_str(&format!("✓ {} ({}): {} model(s)\n", ep.display_name, ep.address, models.len())),
                Err(e) => out.push_str(&format!("✗ {} ({}): {e}\n", ep.display_name, ep.address)),
            }
        }
        Ok(out)
    }

    async fn list_models(&self, hostname: &str) -> Result<String, HomelabError> {
        let table = self.require_endpoints()?;
        let ep = find_endpoint(&table, SERVICE, hostname, "ollama_list_hosts")?;
        let models = self.models(ep, DEFAULT_TIMEOUT).await?;
        if models.is_empty() {
            return Ok(format!("No models installed on {}", ep.display_name));
        }
        let total: f64 = models.iter().map(|m| m.size_gb).sum();
        let mut out = format!("{} model(s) on {} ({total:.1} GB)\n\n", models.len(), ep.display_name);
        for m in &models {
            out.push_str(&format!("  {} - {:.1} GB (modified {})\n", m.name, m.size_gb, m.modified_at));
        }
        Ok(out)
    }

    async fn model_info(&self, hostname: &str, model_name: &str) -> Result<String, HomelabError> {
        let table = self.require_endpoints()?;
        let ep = find_endpoint(&table, SERVICE, hostname, "ollama_list_hosts")?;
        let models = self.models(ep, DEFAULT_TIMEOUT).await?;
        let Some(model) = match_model(&models, model_name) else {
            let names = models.iter().map(|m| m.name.clone());
            return Err(HomelabError::not_found(SERVICE, "model", model_name, names, "ollama_list_models"));
        };

        let url = format!("{}/api/show", ep.base_url());
        let body = json!({ "name": model.name });
        let info = self.client.post_json(&ep.display_name, &url, &body, DEFAULT_TIMEOUT).await?;
        let detail = |key: &str| info.pointer(&format!("/details/{key}")).and_then(Value::as_str).unwrap_or("-").to_string();

        Ok(format!(
            "Model {} on {}\nSize: {:.1} GB\nFamily: {}\nParameters: {}\nQuantization: {}\nFormat: {}\n",
            model.name,
            ep.display_name,
            model.size_gb,
            detail("family"),
            detail("parameter_size"),
            detail("quantization_level"),
            detail("format"),
        ))
    }

    async fn running_models(&self) -> Result<String, HomelabError> {
        let table = self.require_endpoints()?;
        let results = fan_out(table.values(), |ep| async move {
            let url = format!("{}/api/ps", ep.base_url());
            (ep, self.client.get_json(&ep.display_name, &url, QUICK_TIMEOUT).await)
        })
        .await;

        let mut out = String::from("Loaded models\n\n");
        for (ep, result) in results {
            match result {
                Ok(body) => {
                    let loaded = parse_models(&body);
                    if loaded.is_empty() {
                        out.push_str(&format!("{}: idle\n", ep.display_name));
                    }
                    for m in loaded {
                        out.push_str(&format!("{}: {} ({:.1} GB)\n", ep.display_name, m.name, m.size_gb));
                    }
                }
                Err(e) => out.push_str(&format!("{}: ✗ {e}\n", ep.display_name)),
            }
        }
        Ok(out)
    }

    async fn litellm_status(&self) -> Result<String, HomelabError> {
        let host = format!("{}:{}", self.litellm.host, self.litellm.port);
        let url = format!("http://{host}/health/liveliness");
        match self.client.send("litellm", self.client.http().get(&url), QUICK_TIMEOUT).await {
            Ok(_) => Ok(format!("✓ LiteLLM proxy online at {host}")),
            Err(e) => Err(HomelabError::connection("LiteLLM", &host, e.to_string())),
        }
    }
}

/// `{"models": [{"name", "size", "modified_at"}]}` (même forme pour /api/tags et /api/ps).
pub fn parse_models(body: &Value) -> Vec<ModelInfo> {
    body.get("models")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .map(|m| ModelInfo {
                    name: m.get("name").and_then(Value::as_str).unwrap_or("?").to_string(),
                    size_gb: m.get("size").and_then(Value::as_f64).unwrap_or(0.0) / 1_073_741_824.0,
                    modified_at: m
                        .get("modified_at")
                        .and_then(Value::as_str)
                        .map(|s| s.chars().take(10).collect())
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Nom exact, sinon premier modèle dont le nom commence par `wanted` (`llama3` -> `llama3:8b`).
pub fn match_model<'a>(models: &'a [ModelInfo], wanted: &str) -> Option<&'a ModelInfo> {
    models
        .iter()
        .find(|m| m.name == wanted)
        .or_else(|| models.iter().find(|m| m.name.starts_with(wanted)))
}

#[async_trait]
impl ToolServer for OllamaServer {
    fn prefix(&self) -> &'static str {
        "ollama_"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        let hosts: Vec<String> = self.endpoints().keys().cloned().collect();
        vec![
            ToolSpec::no_args("ollama_list_hosts", "Reachability and model count of every Ollama server"),
            ToolSpec::new(
                "ollama_list_models",
                "Models installed on one server",
                object_schema(vec![("hostname", enum_param("Ollama server", &hosts))], &["hostname"]),
            ),
            ToolSpec::new(
                "ollama_get_model_info",
                "Details of one model (prefix match on the name)",
                object_schema(
                    vec![("hostname", enum_param("Ollama server", &hosts)), ("model_name", string_param("Model name"))],
                    &["hostname", "model_name"],
                ),
            ),
            ToolSpec::no_args("ollama_get_running_models", "Models currently loaded in memory on every server"),
            ToolSpec::no_args("ollama_get_litellm_status", "Reachability of the LiteLLM proxy"),
            ToolSpec::no_args("ollama_reload_inventory", "Re-resolve Ollama servers"),
        ]
    }

    async fn call(&self, tool: &str, args: &Value) -> String {
        let result = match tool {
            "ollama_list_hosts" => self.list_hosts().await,
            "ollama_list_models" => match required_str(tool, args, "hostname") {
                Ok(h) => self.list_models(h).await,
                Err(e) => Err(e),
            },
            "ollama_get_model_info" => {
                match (required_str(tool, args, "hostname"), required_str(tool, args, "model_name")) {
                    (Ok(h), Ok(m)) => self.model_info(h, m).await,
                    (Err(e), _) | (_, Err(e)) => Err(e),
                }
            }
            "ollama_get_running_models" => self.running_models().await,
            "ollama_get_litellm_status" => self.litellm_status().await,
            "ollama_reload_inventory" => {
                self.cache.invalidate();
                Ok(format!("✓ Ollama servers reloaded: {}", self.cache.get().len()))
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
    fn model_prefix_matching() {
        let body = json!({"models": [
            {"name": "llama3:8b", "size": 4_661_224_676u64, "modified_at": "2024-05-01T10:00:00Z"},
            {"name": "llama3:70b", "size": 39_969_745_349u64},
            {"name": "mistral:latest", "size": 1_073_741_824u64}
        ]});
        let models = parse_models(&body);
        assert_eq!(models.len(), 3);
        assert_eq!(models[0].modified_at, "2024-05-01");
        assert_eq!(models[2].size_gb, 1.0);

        assert_eq!(match_model(&models, "llama3").unwrap().name, "llama3:8b");
        assert_eq!(match_model(&models, "llama3:70b").unwrap().name, "llama3:70b");
        assert!(match_model(&models, "phi").is_none());
    }

    #[test]
    fn missing_models_key_is_empty() {
        assert!(parse_models(&json!({})).is_empty());
    }
}
