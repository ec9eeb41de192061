/**
 * ERREURS HOMELAB - taxonomie unique pour tous les sous-serveurs
 *
 * RÔLE :
 * Chaque outil convertit ses échecs en HomelabError puis en texte via render().
 * Aucune erreur ne traverse la frontière d'un appel d'outil.
 *
 * FORMAT RENDU :
 *   ✗ <service> <type>[ (code)]
 *   <message>
 *   Host: <hôte>
 *   → <remédiation>
 *
 * SÉCURITÉ : tout texte rendu ou loggé passe par redact().
 */

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

const MAX_LISTED: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HomelabError {
    #[error("no {service} configuration found")]
    ConfigurationMissing { service: String, hint: String },

    #[error("{kind} '{name}' not found")]
    NotFound {
        service: String,
        kind: String,
        name: String,
        available: Vec<String>,
        list_tool: String,
    },

    #[error("authentication failed: {reason}")]
    AuthenticationFailed { service: String, host: String, reason: String },

    #[error("cannot connect: {reason}")]
    ConnectionFailed { service: String, host: String, reason: String },

    #[error("no response within {seconds}s")]
    Timeout { service: String, host: String, seconds: u64 },

    #[error("HTTP {status}: {reason}")]
    Http { service: String, host: String, status: u16, reason: String },

    #[error("{reason}")]
    UnexpectedRemote { service: String, host: String, reason: String },

    #[error("invalid argument for {tool}: {reason}")]
    InvalidArgument { tool: String, reason: String },
}

impl HomelabError {
    pub fn not_found<I, S>(service: &str, kind: &str, name: &str, available: I, list_tool: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        HomelabError::NotFound {
            service: service.into(),
            kind: kind.into(),
            name: name.into(),
            available: available.into_iter().map(Into::into).collect(),
            list_tool: list_tool.into(),
        }
    }

    pub fn connection(service: &str, host: &str, reason: impl Into<String>) -> Self {
        HomelabError::ConnectionFailed { service: service.into(), host: host.into(), reason: reason.into() }
    }

    pub fn timeout(service: &str, host: &str, seconds: u64) -> Self {
        HomelabError::Timeout { service: service.into(), host: host.into(), seconds }
    }

    pub fn unexpected(service: &str, host: &str, reason: impl Into<String>) -> Self {
        HomelabError::UnexpectedRemote { service: service.into(), host: host.into(), reason: reason.into() }
    }

    pub fn auth(service: &str, host: &str, reason: impl Into<String>) -> Self {
        HomelabError::AuthenticationFailed { service: service.into(), host: host.into(), reason: reason.into() }
    }

    pub fn http(service: &str, host: &str, status: u16) -> Self {
        let (reason, _) = http_status_hint(status);
        HomelabError::Http { service: service.into(), host: host.into(), status, reason: reason.into() }
    }

    pub fn invalid_argument(tool: &str, reason: impl Into<String>) -> Self {
        HomelabError::InvalidArgument { tool: tool.into(), reason: reason.into() }
    }

    /// Classe une erreur reqwest : timeout, connexion, statut HTTP, corps illisible.
    pub fn from_reqwest(service: &str, host: &str, err: &reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            return Self::timeout(service, host, timeout_secs);
        }
        if let Some(status) = err.status() {
            return Self::http(service, host, status.as_u16());
        }
        if err.is_connect() {
            return Self::connection(service, host, redact(&err.to_string()));
        }
        if err.is_decode() {
            return Self::unexpected(service, host, "invalid response body");
        }
        Self::unexpected(service, host, redact(&err.to_string()))
    }

    pub fn service(&self) -> &str {
        match self {
            HomelabError::ConfigurationMissing { service, .. }
            | HomelabError::NotFound { service, .. }
            | HomelabError::AuthenticationFailed { service, .. }
            | HomelabError::ConnectionFailed { service, .. }
            | HomelabError::Timeout { service, .. }
            | HomelabError::Http { service, .. }
            | HomelabError::UnexpectedRemote { service, .. } => service,
            HomelabError::InvalidArgument { tool, .. } => tool,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            HomelabError::AuthenticationFailed { host, .. }
            | HomelabError::ConnectionFailed { host, .. }
            | HomelabError::Timeout { host, .. }
            | HomelabError::Http { host, .. }
            | HomelabError::UnexpectedRemote { host, .. } => Some(host),
            _ => None,
        }
    }

    fn kind_label(&self) -> String {
        match self {
            HomelabError::ConfigurationMissing { .. } => "Configuration Missing".into(),
            HomelabError::NotFound { .. } => "Not Found".into(),
            HomelabError::AuthenticationFailed { .. } => "Authentication Failed".into(),
            HomelabError::ConnectionFailed { .. } => "Connection Failed".into(),
            HomelabError::Timeout { .. } => "Timeout".into(),
            HomelabError::Http { status, .. } => format!("HTTP Error ({status})"),
            HomelabError::UnexpectedRemote { .. } => "Error".into(),
            HomelabError::InvalidArgument { .. } => "Invalid Argument".into(),
        }
    }

    pub fn remediation(&self) -> String {
        match self {
            HomelabError::ConfigurationMissing { hint, .. } => hint.clone(),
            HomelabError::NotFound { list_tool, .. } => format!("Use {list_tool} to see valid names"),
            HomelabError::AuthenticationFailed { .. } => {
                "Check the API key or password configured for this host".into()
            }
            HomelabError::ConnectionFailed { .. } => {
                "Verify the host is online, the service is running and the port is reachable".into()
            }
            HomelabError::Timeout { .. } => "The host may be overloaded or unreachable; retry later".into(),
            HomelabError::Http { status, .. } => http_status_hint(*status).1.into(),
            HomelabError::UnexpectedRemote { .. } => "Check the service logs for details".into(),
            HomelabError::InvalidArgument { .. } => "Check the tool parameters".into(),
        }
    }

    /// Texte destiné à l'utilisateur, secrets masqués.
    pub fn render(&self) -> String {
        let mut out = format!("✗ {} {}\n\n{}\n", self.service(), self.kind_label(), self);

        if let HomelabError::NotFound { available, .. } = self {
            if !available.is_empty() {
                let shown: Vec<&str> = available.iter().take(MAX_LISTED).map(String::as_str).collect();
                out.push_str(&format!("\nAvailable: {}", shown.join(", ")));
                if available.len() > MAX_LISTED {
                    out.push_str(&format!(" (+{} more)", available.len() - MAX_LISTED));
                }
                out.push('\n');
            }
        }
        if let Some(host) = self.host() {
            out.push_str(&format!("\nHost: {host}\n"));
        }
        out.push_str(&format!("\n→ {}\n", self.remediation()));
        redact(&out)
    }
}

fn http_status_hint(status: u16) -> (&'static str, &'static str) {
    match status {
        400 => ("bad request", "Check the request parameters"),
        401 => ("authentication required", "Check the API key or credentials"),
        403 => ("permission denied", "Verify the credentials have access to this resource"),
        404 => ("endpoint or resource not found", "Verify the API path and that the resource exists"),
        429 => ("rate limited", "Wait before retrying"),
        500 => ("internal server error", "Check the service logs"),
        502 => ("bad gateway", "Check the upstream service behind the proxy"),
        503 => ("service unavailable", "The service may be starting or in maintenance; retry later"),
        504 => ("gateway timeout", "The upstream service is slow or unreachable"),
        _ => ("unexpected status", "Check the service status and logs"),
    }
}

static SECRET_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b((?:[a-z0-9]+_)*(?:api[_-]?key|apikey|password|passwd|token|secret|sid)(?:_[a-z0-9]+)*)(["']?\s*[:=]\s*["']?)([^\s"'&,}]+)"#)
        .expect("valid redaction pattern")
});

static BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]+=*")
        .expect("valid redaction pattern")
});

/// Masque clés, mots de passe, tokens et sid.
pub fn redact(text: &str) -> String {
    let masked = SECRET_ASSIGNMENT.replace_all(text, "${1}${2}***");
    BEARER.replace_all(&masked, "Bearer ***").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_service_host_and_remediation() {
        let err = HomelabError::auth("Pi-hole", "dns1", "invalid password");
        let text = err.render();
        assert!(text.starts_with("✗ Pi-hole Authentication Failed"));
        assert!(text.contains("Host: dns1"));
        assert!(text.contains("→ Check the API key"));
    }

    #[test]
    fn http_errors_carry_status_hint() {
        let err = HomelabError::http("Docker", "cyber", 404);
        let text = err.render();
        assert!(text.contains("HTTP Error (404)"));
        assert!(text.contains("endpoint or resource not found"));
    }

    #[test]
    fn not_found_lists_at_most_ten_names() {
        let names: Vec<String> = (0..13).map(|i| format!("host{i}")).collect();
        let err = HomelabError::not_found("Ping", "host", "ghost", names, "ping_list_hosts");
        let text = err.render();
        assert!(text.contains("host9"));
        assert!(!text.contains("host10,"));
        assert!(text.contains("(+3 more)"));
        assert!(text.contains("Use ping_list_hosts"));
    }

    #[test]
    fn redact_masks_secrets() {
        assert_eq!(redact("GET /api/stats?sid=abc123&x=1"), "GET /api/stats?sid=***&x=1");
        assert_eq!(redact(r#"{"password": "hunter2"}"#), r#"{"password": "***"}"#);
        assert_eq!(redact("X-API-KEY: deadbeef"), "X-API-KEY: ***");
        assert_eq!(redact("Authorization: Bearer eyJhbGc.iOi"), "Authorization: Bearer ***");
        assert_eq!(redact("inside=ok"), "inside=ok");
    }

    #[test]
    fn redact_masks_env_style_assignments() {
        assert_eq!(redact("PIHOLE_API_KEY_DELL=abc"), "PIHOLE_API_KEY_DELL=***");
        assert_eq!(redact("NUT_PASSWORD=hunter2 NUT_USERNAME=mon"), "NUT_PASSWORD=*** NUT_USERNAME=mon");
        assert_eq!(redact("UNIFI_API_KEY: k3y"), "UNIFI_API_KEY: ***");
        assert_eq!(redact("pihole_api_key: abc"), "pihole_api_key: ***");
        assert_eq!(redact("DOCKER_CYBER_ENDPOINT=10.0.0.5"), "DOCKER_CYBER_ENDPOINT=10.0.0.5");
    }

    #[test]
    fn rendered_text_is_redacted() {
        let err = HomelabError::unexpected("Pi-hole", "dns1", "rejected token=s3cr3t");
        assert!(!err.render().contains("s3cr3t"));
    }
}
