/**
 * SESSIONS PI-HOLE - cache de tokens par display name
 *
 * CYCLE :
 *   aucune session -> authentification -> valide -> (accès après expiration) -> authentification...
 *   un échec d'authentification n'est jamais mis en cache : l'appel suivant réessaie.
 *
 * EXPIRATION :
 *   expires_at = maintenant + validité annoncée - marge ; un token n'est plus servi dès now >= expires_at.
 *   marge = 30s, ramenée à la moitié de la validité quand celle-ci est <= 30s (token jamais périmé à l'émission).
 *   Validité nulle ou négative : réponse rejetée.
 *   Deux rafraîchissements concurrents pour le même hôte sont tolérés (le dernier écrit gagne).
 */

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::errors::HomelabError;
use crate::models::{EndpointRecord, SessionToken};
use crate::remote::{RemoteClient, DEFAULT_TIMEOUT};
use crate::state::{new_state, Shared};

pub const SAFETY_MARGIN: Duration = Duration::seconds(30);
pub const DEFAULT_VALIDITY: Duration = Duration::seconds(300);

const SERVICE: &str = "Pi-hole";

/// Réponse d'authentification : token + durée de validité déclarée par le serveur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub token: String,
    pub validity: Duration,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, endpoint: &EndpointRecord) -> Result<AuthGrant, HomelabError>;
}

pub struct SessionCache {
    sessions: Shared<HashMap<String, SessionToken>>,
    authenticator: Arc<dyn Authenticator>,
}

impl SessionCache {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { sessions: new_state(HashMap::new()), authenticator }
    }

    pub async fn get_session(&self, endpoint: &EndpointRecord) -> Result<SessionToken, HomelabError> {
        self.get_session_at(OffsetDateTime::now_utc(), endpoint).await
    }

    pub async fn get_session_at(&self, now: OffsetDateTime, endpoint: &EndpointRecord) -> Result<SessionToken, HomelabError> {
        if let Some(token) = self.cached_at(now, &endpoint.display_name) {
            return Ok(token);
        }

        debug!(host = %endpoint.display_name, "authenticating");
        let grant = match self.authenticator.authenticate(endpoint).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(host = %endpoint.display_name, error = %e, "authentication failed");
                return Err(e);
            }
        };

        if grant.validity <= Duration::ZERO {
            return Err(HomelabError::unexpected(
                SERVICE,
                &endpoint.display_name,
                format!("session validity must be positive, got {}s", grant.validity.whole_seconds()),
            ));
        }
        let token = SessionToken {
            display_name: endpoint.display_name.clone(),
            token: grant.token,
            expires_at: now + grant.validity - expiry_margin(grant.validity),
        };
        self.sessions.lock().insert(endpoint.display_name.clone(), token.clone());
        info!(host = %endpoint.display_name, validity_s = grant.validity.whole_seconds(), "session established");
        Ok(token)
    }

    /// Token encore valide à `now`, sans réseau.
    pub fn cached_at(&self, now: OffsetDateTime, display_name: &str) -> Option<SessionToken> {
        self.sessions
            .lock()
            .get(display_name)
            .filter(|t| t.is_valid_at(now))
            .cloned()
    }

    /// Oublie une session révoquée côté serveur (401 sur une requête authentifiée).
    pub fn forget(&self, display_name: &str) {
        self.sessions.lock().remove(display_name);
    }

    pub fn clear(&self) {
        self.sessions.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Marge retranchée à la validité ; toujours < validité.
pub fn expiry_margin(validity: Duration) -> Duration {
    SAFETY_MARGIN.min(validity / 2)
}

/// POST `http://<host:port>/api/auth` avec `{"password": ...}`.
pub struct PiholeAuthenticator {
    client: RemoteClient,
}

impl PiholeAuthenticator {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Authenticator for PiholeAuthenticator {
    async fn authenticate(&self, endpoint: &EndpointRecord) -> Result<AuthGrant, HomelabError> {
        let host = endpoint.display_name.as_str();
        let Some(creds) = endpoint.credentials.as_ref() else {
            return Err(HomelabError::ConfigurationMissing {
                service: SERVICE.into(),
                hint: format!(
                    "Set PIHOLE_API_KEY_{} or the pihole_api_key host variable",
                    host.to_uppercase().replace('-', "_")
                ),
            });
        };

        let url = format!("{}/api/auth", endpoint.base_url());
        let req = self.client.http().post(&url).json(&json!({ "password": creds.secret }));
        let resp = self.client.send_raw(host, req, DEFAULT_TIMEOUT).await?;

        match resp.status().as_u16() {
            200..=299 => {}
            401 => return Err(HomelabError::auth(SERVICE, host, "invalid API key or password")),
            403 => return Err(HomelabError::auth(SERVICE, host, "access forbidden for this API key")),
            other => return Err(HomelabError::http(SERVICE, host, other)),
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| HomelabError::from_reqwest(SERVICE, host, &e, DEFAULT_TIMEOUT))?;
        parse_auth_response(host, &body)
    }
}

/// `{"session": {"valid": true, "sid": "...", "validity": 300}}`
pub fn parse_auth_response(host: &str, body: &Value) -> Result<AuthGrant, HomelabError> {
    let session = &body["session"];
    if !session["valid"].as_bool().unwrap_or(false) {
        let reason = session["message"].as_str().unwrap_or("session rejected");
        return Err(HomelabError::auth(SERVICE, host, reason));
    }
    let Some(sid) = session["sid"].as_str().filter(|s| !s.is_empty()) else {
        return Err(HomelabError::unexpected(SERVICE, host, "authentication response carried no session id"));
    };
    let validity = session["validity"]
        .as_i64()
        .map(Duration::seconds)
        .unwrap_or(DEFAULT_VALIDITY);
    Ok(AuthGrant { token: sid.to_string(), validity })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Credentials, EndpointSource, ServiceKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAuth {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Authenticator for CountingAuth {
        async fn authenticate(&self, endpoint: &EndpointRecord) -> Result<AuthGrant, HomelabError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(HomelabError::auth(SERVICE, &endpoint.display_name, "bad password"));
            }
            Ok(AuthGrant { token: format!("sid-{n}"), validity: Duration::seconds(300) })
        }
    }

    fn endpoint() -> EndpointRecord {
        let mut ep = EndpointRecord::new("dns1", "10.0.0.2:80", ServiceKind::Pihole, EndpointSource::Inventory);
        ep.credentials = Some(Credentials { username: None, secret: "pw".into() });
        ep
    }

    #[tokio::test]
    async fn token_reused_inside_window_and_refreshed_after_margin() {
        let auth = Arc::new(CountingAuth { calls: AtomicUsize::new(0), fail: false });
        let cache = SessionCache::new(auth.clone());
        let t0 = OffsetDateTime::now_utc();

        let first = cache.get_session_at(t0, &endpoint()).await.unwrap();
        assert_eq!(first.expires_at, t0 + Duration::seconds(270));

        let later = cache.get_session_at(t0 + Duration::seconds(100), &endpoint()).await.unwrap();
        assert_eq!(later.token, first.token);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);

        let refreshed = cache.get_session_at(t0 + Duration::seconds(280), &endpoint()).await.unwrap();
        assert_ne!(refreshed.token, first.token);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn token_is_not_served_at_exact_expiry() {
        let auth = Arc::new(CountingAuth { calls: AtomicUsize::new(0), fail: false });
        let cache = SessionCache::new(auth.clone());
        let t0 = OffsetDateTime::now_utc();

        cache.get_session_at(t0, &endpoint()).await.unwrap();
        assert!(cache.cached_at(t0 + Duration::seconds(269), "dns1").is_some());
        assert!(cache.cached_at(t0 + Duration::seconds(270), "dns1").is_none());
    }

    struct FixedValidity(Duration);

    #[async_trait]
    impl Authenticator for FixedValidity {
        async fn authenticate(&self, _endpoint: &EndpointRecord) -> Result<AuthGrant, HomelabError> {
            Ok(AuthGrant { token: "sid".into(), validity: self.0 })
        }
    }

    #[tokio::test]
    async fn short_validity_still_yields_a_live_token() {
        let t0 = OffsetDateTime::now_utc();
        for secs in [1, 20, 30, 31] {
            let cache = SessionCache::new(Arc::new(FixedValidity(Duration::seconds(secs))));
            let token = cache.get_session_at(t0, &endpoint()).await.unwrap();
            assert!(token.expires_at > t0, "validity {secs}s");
            assert!(token.is_valid_at(t0));
        }

        let cache = SessionCache::new(Arc::new(FixedValidity(Duration::seconds(20))));
        let token = cache.get_session_at(t0, &endpoint()).await.unwrap();
        assert_eq!(token.expires_at, t0 + Duration::seconds(10));
        assert!(cache.cached_at(t0 + Duration::seconds(10), "dns1").is_none());
    }

    #[tokio::test]
    async fn non_positive_validity_is_rejected() {
        let cache = SessionCache::new(Arc::new(FixedValidity(Duration::ZERO)));
        let err = cache.get_session_at(OffsetDateTime::now_utc(), &endpoint()).await.unwrap_err();
        assert!(matches!(err, HomelabError::UnexpectedRemote { .. }));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failures_are_never_cached() {
        let auth = Arc::new(CountingAuth { calls: AtomicUsize::new(0), fail: true });
        let cache = SessionCache::new(auth.clone());
        let now = OffsetDateTime::now_utc();

        let err = cache.get_session_at(now, &endpoint()).await.unwrap_err();
        assert!(matches!(err, HomelabError::AuthenticationFailed { .. }));
        assert!(cache.is_empty());

        cache.get_session_at(now, &endpoint()).await.unwrap_err();
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forget_drops_one_session() {
        let auth = Arc::new(CountingAuth { calls: AtomicUsize::new(0), fail: false });
        let cache = SessionCache::new(auth.clone());
        let now = OffsetDateTime::now_utc();

        cache.get_session_at(now, &endpoint()).await.unwrap();
        cache.forget("dns1");
        cache.get_session_at(now, &endpoint()).await.unwrap();
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn auth_response_parsing() {
        let ok = json!({"session": {"valid": true, "sid": "abc", "validity": 1800}});
        let grant = parse_auth_response("dns1", &ok).unwrap();
        assert_eq!(grant.token, "abc");
        assert_eq!(grant.validity, Duration::seconds(1800));

        let default_validity = json!({"session": {"valid": true, "sid": "abc"}});
        assert_eq!(parse_auth_response("dns1", &default_validity).unwrap().validity, DEFAULT_VALIDITY);

        let rejected = json!({"session": {"valid": false, "message": "password incorrect"}});
        assert!(matches!(
            parse_auth_response("dns1", &rejected),
            Err(HomelabError::AuthenticationFailed { .. })
        ));
    }
}
