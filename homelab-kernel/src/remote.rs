/**
 * CLIENT DISTANT - helpers HTTP communs aux sous-serveurs
 *
 * FONCTIONNEMENT :
 * - RemoteClient enveloppe reqwest et traduit les erreurs en HomelabError
 * - fan_out interroge toutes les cibles en parallèle et garde chaque résultat
 */

use futures::future::join_all;
use reqwest::{RequestBuilder, Response};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::errors::{redact, HomelabError};

/// Timeouts par type d'appel (secondes).
pub const QUICK_TIMEOUT: u64 = 3;
pub const DEFAULT_TIMEOUT: u64 = 5;
pub const STATS_TIMEOUT: u64 = 10;

#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    service: &'static str,
}

impl RemoteClient {
    pub fn new(service: &'static str) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("homelab-kernel/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, service }
    }

    pub fn with_client(service: &'static str, http: reqwest::Client) -> Self {
        Self { http, service }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Envoie avec timeout ; transport en erreur => HomelabError classée. Le statut n'est pas vérifié.
    pub async fn send_raw(&self, host: &str, req: RequestBuilder, timeout_secs: u64) -> Result<Response, HomelabError> {
        req.timeout(Duration::from_secs(timeout_secs))
            .send()
            .await
            .map_err(|e| HomelabError::from_reqwest(self.service, host, &e, timeout_secs))
    }

    /// Comme `send_raw`, mais tout statut non 2xx devient `HomelabError::Http`.
    pub async fn send(&self, host: &str, req: RequestBuilder, timeout_secs: u64) -> Result<Response, HomelabError> {
        let resp = self.send_raw(host, req, timeout_secs).await?;
        let status = resp.status();
        if !status.is_success() {
            debug!(service = self.service, host, status = status.as_u16(), "remote returned error status");
            return Err(HomelabError::http(self.service, host, status.as_u16()));
        }
        Ok(resp)
    }

    pub async fn json(&self, host: &str, req: RequestBuilder, timeout_secs: u64) -> Result<Value, HomelabError> {
        let resp = self.send(host, req, timeout_secs).await?;
        resp.json::<Value>()
            .await
            .map_err(|e| HomelabError::from_reqwest(self.service, host, &e, timeout_secs))
    }

    pub async fn get_json(&self, host: &str, url: &str, timeout_secs: u64) -> Result<Value, HomelabError> {
        debug!(service = self.service, host, url = %redact(url), "GET");
        self.json(host, self.http.get(url), timeout_secs).await
    }

    pub async fn get_bytes(&self, host: &str, url: &str, timeout_secs: u64) -> Result<Vec<u8>, HomelabError> {
        debug!(service = self.service, host, url = %redact(url), "GET (raw)");
        let resp = self.send(host, self.http.get(url), timeout_secs).await?;
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| HomelabError::from_reqwest(self.service, host, &e, timeout_secs))
    }

    pub async fn post_json(&self, host: &str, url: &str, body: &Value, timeout_secs: u64) -> Result<Value, HomelabError> {
        debug!(service = self.service, host, url = %redact(url), "POST");
        self.json(host, self.http.post(url).json(body), timeout_secs).await
    }
}

/// Lance `f` sur chaque élément en parallèle et attend tout ; l'ordre d'entrée est conservé.
/// Un échec reste une valeur dans le résultat agrégé, jamais un abandon de l'ensemble.
pub async fn fan_out<T, R, F, Fut>(items: impl IntoIterator<Item = T>, f: F) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    join_all(items.into_iter().map(f)).await
}

/// Ajoute `:port` si l'adresse n'en porte pas déjà un.
pub fn with_port(address: &str, port: u16) -> String {
    if has_port(address) {
        address.to_string()
    } else {
        format!("{address}:{port}")
    }
}

/// Retire un éventuel `:port` final (IPv6 nue laissée intacte).
pub fn strip_port(address: &str) -> &str {
    if has_port(address) {
        address.rsplit_once(':').map_or(address, |(host, _)| host)
    } else {
        address
    }
}

fn has_port(address: &str) -> bool {
    let trimmed = address.trim_start_matches("http://").trim_start_matches("https://");
    match trimmed.rsplit_once(':') {
        // plusieurs `:` sans crochets = IPv6 sans port
        Some((host, port)) => {
            !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit())
                && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_appended_only_when_missing() {
        assert_eq!(with_port("10.0.0.5", 2375), "10.0.0.5:2375");
        assert_eq!(with_port("10.0.0.5:2376", 2375), "10.0.0.5:2376");
        assert_eq!(with_port("docker.lan", 2375), "docker.lan:2375");
        assert_eq!(with_port("[fe80::1]:80", 8080), "[fe80::1]:80");
    }

    #[test]
    fn strip_port_keeps_bare_hosts() {
        assert_eq!(strip_port("10.0.0.5:22"), "10.0.0.5");
        assert_eq!(strip_port("nas.lan"), "nas.lan");
        assert_eq!(strip_port("fe80::1"), "fe80::1");
    }

    #[tokio::test]
    async fn fan_out_preserves_order_and_failures() {
        let results = fan_out(vec![1u64, 2, 3], |n| async move {
            tokio::time::sleep(Duration::from_millis(30 - n * 10)).await;
            if n == 2 { Err(format!("host{n} down")) } else { Ok(n) }
        })
        .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0], Ok(1));
        assert_eq!(results[1], Err("host2 down".to_string()));
        assert_eq!(results[2], Ok(3));
    }
}
