/*!
Faux services homelab pour tests d'intégration

Chaque faux serveur écoute sur 127.0.0.1 (port éphémère), tourne dans une tâche tokio
et s'arrête quand la valeur est droppée. Les compteurs permettent de vérifier le cache
côté kernel (nombre d'authentifications, de requêtes...).
*/

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

async fn serve(app: Router) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::warn!("fake server stopped: {}", e);
        }
    });
    Ok((addr, task))
}

/// Adresse locale sur laquelle rien n'écoute (connexion refusée).
pub async fn closed_port_address() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr.to_string())
}

#[derive(Clone)]
struct PiholeState {
    password: String,
    validity: i64,
    summary: Value,
    sessions: Arc<Mutex<HashSet<String>>>,
    auth_calls: Arc<AtomicUsize>,
    stats_calls: Arc<AtomicUsize>,
}

/// Pi-hole v6 : `POST /api/auth` et `GET /api/stats/summary?sid=...`.
pub struct FakePihole {
    addr: SocketAddr,
    state: PiholeState,
    task: JoinHandle<()>,
}

impl FakePihole {
    pub async fn start(password: &str) -> Result<Self> {
        Self::start_with_validity(password, 300).await
    }

    pub async fn start_with_validity(password: &str, validity: i64) -> Result<Self> {
        let state = PiholeState {
            password: password.to_string(),
            validity,
            summary: json!({
                "queries": {"total": 1200, "blocked": 300, "percent_blocked": 25.0},
                "clients": {"active": 14},
                "gravity": {"domains_being_blocked": 150000}
            }),
            sessions: Arc::new(Mutex::new(HashSet::new())),
            auth_calls: Arc::new(AtomicUsize::new(0)),
            stats_calls: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new()
            .route("/api/auth", post(pihole_auth))
            .route("/api/stats/summary", get(pihole_summary))
            .with_state(state.clone());
        let (addr, task) = serve(app).await?;
        log::info!("fake pihole listening on {}", addr);
        Ok(Self { addr, state, task })
    }

    /// `host:port`
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn auth_calls(&self) -> usize {
        self.state.auth_calls.load(Ordering::SeqCst)
    }

    pub fn stats_calls(&self) -> usize {
        self.state.stats_calls.load(Ordering::SeqCst)
    }

    /// Invalide tous les sid émis (simule un redémarrage du Pi-hole).
    pub fn revoke_sessions(&self) {
        if let Ok(mut sessions) = self.state.sessions.lock() {
            sessions.clear();
        }
    }
}

impl Drop for FakePihole {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pihole_auth(State(s): State<PiholeState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let n = s.auth_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if body["password"].as_str() != Some(s.password.as_str()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"session": {"valid": false, "message": "password incorrect"}})),
        );
    }
    let sid = format!("sid-{n}");
    if let Ok(mut sessions) = s.sessions.lock() {
        sessions.insert(sid.clone());
    }
    (StatusCode::OK, Json(json!({"session": {"valid": true, "sid": sid, "validity": s.validity}})))
}

async fn pihole_summary(
    State(s): State<PiholeState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    s.stats_calls.fetch_add(1, Ordering::SeqCst);
    let known = params
        .get("sid")
        .map(|sid| s.sessions.lock().map(|set| set.contains(sid)).unwrap_or(false))
        .unwrap_or(false);
    if !known {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": {"key": "unauthorized"}})));
    }
    (StatusCode::OK, Json(s.summary.clone()))
}

/// API JSON figée : chaque chemin répond le même corps en GET et en POST.
/// Sert de faux Docker (`/containers/json`) ou Ollama (`/api/tags`, `/api/show`).
pub struct FakeJsonApi {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeJsonApi {
    pub async fn start(routes: Vec<(&str, Value)>) -> Result<Self> {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut app = Router::new();
        for (path, body) in routes {
            let (get_body, post_body) = (body.clone(), body);
            let (get_hits, post_hits) = (hits.clone(), hits.clone());
            app = app.route(
                path,
                get(move || {
                    get_hits.fetch_add(1, Ordering::SeqCst);
                    let body = get_body.clone();
                    async move { Json(body) }
                })
                .post(move || {
                    post_hits.fetch_add(1, Ordering::SeqCst);
                    let body = post_body.clone();
                    async move { Json(body) }
                }),
            );
        }
        let (addr, task) = serve(app).await?;
        Ok(Self { addr, hits, task })
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for FakeJsonApi {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Démon NUT minimal : USERNAME / PASSWORD / LIST VAR / LOGOUT.
pub struct FakeNut {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct NutState {
    ups: String,
    vars: Vec<(String, String)>,
    login: Option<(String, String)>,
}

impl FakeNut {
    pub async fn start(ups: &str, vars: &[(&str, &str)]) -> Result<Self> {
        Self::start_inner(NutState {
            ups: ups.to_string(),
            vars: vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            login: None,
        })
        .await
    }

    /// Exige un login : LIST VAR refusé (`ERR ACCESS-DENIED`) sans USERNAME/PASSWORD valides.
    pub async fn start_with_login(ups: &str, vars: &[(&str, &str)], user: &str, password: &str) -> Result<Self> {
        Self::start_inner(NutState {
            ups: ups.to_string(),
            vars: vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            login: Some((user.to_string(), password.to_string())),
        })
        .await
    }

    async fn start_inner(state: NutState) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = nut_session(stream, state).await {
                        log::warn!("fake nut session error: {}", e);
                    }
                });
            }
        });
        Ok(Self { addr, task })
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for FakeNut {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn nut_session(stream: tokio::net::TcpStream, state: NutState) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let (mut user, mut pass) = (None::<String>, None::<String>);

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let reply = if let Some(u) = line.strip_prefix("USERNAME ") {
            user = Some(u.to_string());
            "OK\n".to_string()
        } else if let Some(p) = line.strip_prefix("PASSWORD ") {
            pass = Some(p.to_string());
            "OK\n".to_string()
        } else if let Some(ups) = line.strip_prefix("LIST VAR ") {
            let allowed = match &state.login {
                Some((u, p)) => user.as_deref() == Some(u.as_str()) && pass.as_deref() == Some(p.as_str()),
                None => true,
            };
            if !allowed {
                "ERR ACCESS-DENIED\n".to_string()
            } else if ups != state.ups {
                "ERR UNKNOWN-UPS\n".to_string()
            } else {
                let mut out = format!("BEGIN LIST VAR {ups}\n");
                for (k, v) in &state.vars {
                    out.push_str(&format!("VAR {ups} {k} \"{v}\"\n"));
                }
                out.push_str(&format!("END LIST VAR {ups}\n"));
                out
            }
        } else if line == "LOGOUT" {
            write.write_all(b"OK Goodbye\n").await?;
            break;
        } else {
            "ERR UNKNOWN-COMMAND\n".to_string()
        };
        write.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}
