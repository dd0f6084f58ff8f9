use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::audit::{token_prefix, AuditLogger};
use crate::auth::TokenStore;
use crate::config::{self, HubConfig};
use crate::supervisor::registry::ServerRegistry;

/// Everything a request handler needs, built once at startup and passed
/// as axum state. No module-level singletons.
#[derive(Clone)]
pub struct HubContext {
    pub config: Arc<HubConfig>,
    pub registry: Arc<ServerRegistry>,
    pub store: Arc<TokenStore>,
    pub audit: Arc<AuditLogger>,
}

impl HubContext {
    pub fn new(config: HubConfig) -> Self {
        let registry = Arc::new(ServerRegistry::new(config.proxy.clone()));
        let store = Arc::new(TokenStore::open(&config.paths.keys_file));
        let audit = Arc::new(AuditLogger::new(&config.paths.audit_log));
        Self {
            config: Arc::new(config),
            registry,
            store,
            audit,
        }
    }
}

/// Authorized server names for the current request, injected by the
/// token middleware.
#[derive(Clone)]
pub struct AuthorizedServers(pub Vec<String>);

pub fn router(ctx: HubContext) -> Router {
    let authed = Router::new()
        .route("/api/servers", get(get_servers))
        .route("/api/servers/status", get(get_server_status))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), require_token));

    // Management surface for the local operator (what the dashboard
    // drives). Token-gated routes above are the only thing remote
    // clients should ever be handed.
    let management = Router::new()
        .route("/api/groups/launch", post(launch_servers))
        .route("/api/servers/running", get(get_running_servers))
        .route("/api/servers/{name}/stop", post(stop_server_by_name))
        .route("/api/servers/stop-all", post(stop_all_servers))
        .route("/api/keys", get(get_api_keys))
        .route("/api/keys/{token}", delete(revoke_api_key));

    Router::new()
        .route("/api/health", get(health_check))
        .merge(authed)
        .merge(management)
        .with_state(ctx)
}

/// Accept both `Authorization: Bearer <token>` and a bare token.
fn extract_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    Some(raw.strip_prefix("Bearer ").unwrap_or(raw))
}

/// Reject the request before any handler runs unless the presented
/// token validates. Unknown and revoked tokens get the same answer.
async fn require_token(State(ctx): State<HubContext>, mut req: Request, next: Next) -> Response {
    let Some(token) = extract_token(req.headers()).map(str::to_owned) else {
        ctx.audit
            .log("gateway.authorize", req.uri().path(), "denied", "no credential")
            .await;
        return unauthorized("API key required");
    };

    let servers = match ctx.store.authorize(&token).await {
        Ok(servers) => servers,
        Err(err) => {
            ctx.audit
                .log("gateway.authorize", req.uri().path(), "denied", &err.to_string())
                .await;
            return unauthorized("Invalid API key");
        }
    };

    ctx.audit
        .log("gateway.authorize", &token_prefix(&token), "allowed", req.uri().path())
        .await;
    req.extensions_mut().insert(AuthorizedServers(servers));
    next.run(req).await
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"success": false, "error": message})),
    )
        .into_response()
}

/// Endpoints for the token's server group, restricted to names present
/// in the current spec source. Nothing outside the authorized set is
/// ever mentioned in the response.
async fn get_servers(
    State(ctx): State<HubContext>,
    Extension(AuthorizedServers(authorized)): Extension<AuthorizedServers>,
) -> Json<serde_json::Value> {
    // Re-read the spec source per request, same philosophy as the
    // store's reload-before-validate: dashboard edits are visible
    // without a restart.
    let specs = config::load_server_specs(&ctx.config.paths.servers_config);
    let host = &ctx.config.proxy.sse_host;

    let mut names = authorized;
    names.sort();

    let mut servers = Vec::new();
    for name in names {
        let Some(spec) = specs.get(&name) else {
            continue;
        };
        let port = spec
            .sse_port
            .unwrap_or_else(|| ctx.registry.ports().predict(&name));
        servers.push(json!({
            "name": name,
            "transport": {
                "type": "sse",
                "url": format!("http://{host}:{port}/sse"),
            },
        }));
    }

    Json(json!({"success": true, "servers": servers}))
}

/// Point-in-time liveness for the token's server group. Authorization is
/// independent of liveness; this is how callers notice a member that was
/// stopped out of band.
async fn get_server_status(
    State(ctx): State<HubContext>,
    Extension(AuthorizedServers(authorized)): Extension<AuthorizedServers>,
) -> Json<serde_json::Value> {
    let mut names = authorized;
    names.sort();

    let mut servers = Vec::new();
    for name in names {
        let running = ctx.registry.is_running(&name).await;
        servers.push(json!({"name": name, "running": running}));
    }

    Json(json!({"success": true, "servers": servers}))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

// ── Management surface ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LaunchRequest {
    servers: Vec<String>,
}

/// Select and start a server group, issuing a credential scoped to the
/// subset that came up. Partial success is reported, not failed.
async fn launch_servers(
    State(ctx): State<HubContext>,
    Json(request): Json<LaunchRequest>,
) -> Response {
    let specs = config::load_server_specs(&ctx.config.paths.servers_config);
    let outcome = match ctx
        .registry
        .launch_group(&ctx.store, &specs, &request.servers)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::warn!("Group launch failed: {}", err);
            return store_unavailable(&err);
        }
    };

    if let Some(token) = &outcome.token {
        ctx.audit
            .log(
                "credential.issue",
                &token_prefix(token),
                "issued",
                &format!("servers: {}", outcome.started.join(", ")),
            )
            .await;
    }

    Json(json!({
        "success": !outcome.started.is_empty(),
        "started": outcome.started,
        "api_key": outcome.token,
    }))
    .into_response()
}

async fn stop_server_by_name(
    State(ctx): State<HubContext>,
    Path(name): Path<String>,
) -> Json<serde_json::Value> {
    let stopped = ctx.registry.stop_server(&name).await;
    ctx.audit
        .log(
            "server.stop",
            &name,
            if stopped { "stopped" } else { "unknown" },
            "",
        )
        .await;
    Json(json!({"success": stopped}))
}

async fn stop_all_servers(State(ctx): State<HubContext>) -> Json<serde_json::Value> {
    ctx.registry.stop_all().await;
    ctx.audit.log("server.stop", "*", "stopped", "").await;
    Json(json!({"success": true}))
}

async fn get_running_servers(State(ctx): State<HubContext>) -> Json<serde_json::Value> {
    Json(json!({"success": true, "servers": ctx.registry.running_names().await}))
}

/// Full token→credential listing, for the operator's key management
/// view. The snapshot is a copy; nothing here aliases the live store.
async fn get_api_keys(State(ctx): State<HubContext>) -> Json<serde_json::Value> {
    let keys = ctx.store.list_all().await;
    Json(json!({"success": true, "keys": keys}))
}

async fn revoke_api_key(
    State(ctx): State<HubContext>,
    Path(token): Path<String>,
) -> Response {
    match ctx.store.revoke(&token).await {
        Ok(true) => {
            ctx.audit
                .log("credential.revoke", &token_prefix(&token), "revoked", "")
                .await;
            Json(json!({"success": true})).into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "Unknown API key"})),
        )
            .into_response(),
        Err(err) => store_unavailable(&err),
    }
}

fn store_unavailable(err: &crate::error::HubError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "error": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PathsSection, ServerSection};
    use crate::supervisor::test_support::{fake_proxy, sleep_spec};
    use axum::http::HeaderValue;
    use std::collections::HashMap;
    use std::io::Write;

    fn test_context(dir: &std::path::Path) -> HubContext {
        let config = HubConfig {
            server: ServerSection::default(),
            paths: PathsSection {
                servers_config: dir.join("servers_config.json").to_string_lossy().into_owned(),
                keys_file: dir.join("api_keys.json").to_string_lossy().into_owned(),
                audit_log: dir.join("audit.log").to_string_lossy().into_owned(),
            },
            proxy: fake_proxy(dir, false),
            launch: Default::default(),
        };
        HubContext::new(config)
    }

    fn write_specs(dir: &std::path::Path, names: &[&str]) {
        let specs: HashMap<&str, serde_json::Value> = names
            .iter()
            .map(|&n| (n, json!({"command": "sleep", "args": ["60"]})))
            .collect();
        let mut file = std::fs::File::create(dir.join("servers_config.json")).unwrap();
        write!(file, "{}", json!({"mcpServers": specs})).unwrap();
    }

    #[test]
    fn test_extract_token_forms() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("abc123"));
        assert_eq!(extract_token(&headers), Some("abc123"));

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123"),
        );
        assert_eq!(extract_token(&headers), Some("abc123"));
    }

    #[tokio::test]
    async fn test_get_servers_filters_to_authorized_and_known() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        write_specs(dir.path(), &["alpha", "beta"]);

        // Token authorizes alpha plus a name the spec source dropped.
        let authorized = AuthorizedServers(vec!["alpha".into(), "vanished".into()]);
        let Json(body) = get_servers(State(ctx), Extension(authorized)).await;

        assert_eq!(body["success"], true);
        let servers = body["servers"].as_array().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0]["name"], "alpha");
        assert_eq!(servers[0]["transport"]["type"], "sse");
        let url = servers[0]["transport"]["url"].as_str().unwrap();
        assert!(url.starts_with("http://127.0.0.1:3"));
        assert!(url.ends_with("/sse"));
        // beta exists in the spec source but the token does not cover it.
        assert!(!body.to_string().contains("beta"));
    }

    #[tokio::test]
    async fn test_partial_launch_scenario() {
        // Spec source has A and B; B's command is unresolvable. The
        // issued token must cover A only, and the gateway must omit B.
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());

        let mut specs = HashMap::new();
        specs.insert("a".to_string(), sleep_spec());
        specs.insert(
            "b".to_string(),
            crate::config::ServerSpec {
                command: "no-such-binary-glorp".to_string(),
                args: Vec::new(),
                env: Default::default(),
                sse_port: None,
            },
        );
        let file = serde_json::to_string(&json!({
            "mcpServers": {
                "a": {"command": "sleep", "args": ["60"]},
                "b": {"command": "no-such-binary-glorp"},
            }
        }))
        .unwrap();
        std::fs::write(dir.path().join("servers_config.json"), file).unwrap();

        let outcome = ctx
            .registry
            .launch_group(&ctx.store, &specs, &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome.started, vec!["a"]);
        let token = outcome.token.unwrap();

        let (ok, servers) = ctx.store.validate(&token).await;
        assert!(ok);

        let Json(body) = get_servers(
            State(ctx.clone()),
            Extension(AuthorizedServers(servers)),
        )
        .await;
        let entries = body["servers"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["name"], "a");

        ctx.registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_status_reports_out_of_band_stop() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        write_specs(dir.path(), &["a", "b"]);

        let mut specs = HashMap::new();
        specs.insert("a".to_string(), sleep_spec());
        specs.insert("b".to_string(), sleep_spec());
        let outcome = ctx
            .registry
            .launch_group(&ctx.store, &specs, &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome.started, vec!["a", "b"]);
        let token = outcome.token.unwrap();

        // b goes away out of band; the credential is untouched.
        ctx.registry.stop_server("b").await;

        let (ok, servers) = ctx.store.validate(&token).await;
        assert!(ok);
        let mut sorted = servers.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["a", "b"]);

        let Json(body) = get_server_status(
            State(ctx.clone()),
            Extension(AuthorizedServers(servers)),
        )
        .await;
        let entries = body["servers"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["name"], "a");
        assert_eq!(entries[0]["running"], true);
        assert_eq!(entries[1]["name"], "b");
        assert_eq!(entries[1]["running"], false);

        ctx.registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_end_to_end_auth_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        write_specs(dir.path(), &["alpha"]);
        let token = ctx.store.issue(vec!["alpha".into()]).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(ctx);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let health = raw_get(addr, "/api/health", None).await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains(r#""status":"ok""#));

        let denied = raw_get(addr, "/api/servers", None).await;
        assert!(denied.starts_with("HTTP/1.1 401"));
        assert!(!denied.contains("alpha"));

        let bogus = raw_get(addr, "/api/servers", Some("Bearer wrong")).await;
        assert!(bogus.starts_with("HTTP/1.1 401"));

        let bearer = format!("Bearer {token}");
        let allowed = raw_get(addr, "/api/servers", Some(&bearer)).await;
        assert!(allowed.starts_with("HTTP/1.1 200"));
        assert!(allowed.contains("alpha"));

        // Raw token form works too.
        let raw_form = raw_get(addr, "/api/servers", Some(&token)).await;
        assert!(raw_form.starts_with("HTTP/1.1 200"));
    }

    #[tokio::test]
    async fn test_management_flow_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        write_specs(dir.path(), &["a"]);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(ctx);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Launch a group with one known and one unknown name.
        let launched = raw_request(
            addr,
            "POST",
            "/api/groups/launch",
            None,
            Some(r#"{"servers": ["a", "missing"]}"#),
        )
        .await;
        assert!(launched.starts_with("HTTP/1.1 200"));
        let body = body_json(&launched);
        assert_eq!(body["success"], true);
        assert_eq!(body["started"], json!(["a"]));
        let token = body["api_key"].as_str().unwrap().to_string();

        let running = raw_get(addr, "/api/servers/running", None).await;
        assert!(body_json(&running)["servers"]
            .as_array()
            .unwrap()
            .contains(&json!("a")));

        // The issued key works until revoked.
        let bearer = format!("Bearer {token}");
        let listing = raw_get(addr, "/api/servers", Some(&bearer)).await;
        assert!(listing.starts_with("HTTP/1.1 200"));

        let keys = raw_get(addr, "/api/keys", None).await;
        assert!(body_json(&keys)["keys"].get(&token).is_some());

        let revoked = raw_request(addr, "DELETE", &format!("/api/keys/{token}"), None, None).await;
        assert!(revoked.starts_with("HTTP/1.1 200"));
        let denied = raw_get(addr, "/api/servers", Some(&bearer)).await;
        assert!(denied.starts_with("HTTP/1.1 401"));

        // Revoking twice is a miss.
        let again = raw_request(addr, "DELETE", &format!("/api/keys/{token}"), None, None).await;
        assert!(again.starts_with("HTTP/1.1 404"));

        let stopped = raw_request(addr, "POST", "/api/servers/stop-all", None, None).await;
        assert!(stopped.starts_with("HTTP/1.1 200"));
        let running = raw_get(addr, "/api/servers/running", None).await;
        assert!(body_json(&running)["servers"].as_array().unwrap().is_empty());
    }

    async fn raw_get(addr: std::net::SocketAddr, path: &str, auth: Option<&str>) -> String {
        raw_request(addr, "GET", path, auth, None).await
    }

    async fn raw_request(
        addr: std::net::SocketAddr,
        method: &str,
        path: &str,
        auth: Option<&str>,
        body: Option<&str>,
    ) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut headers = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n");
        if let Some(value) = auth {
            headers.push_str(&format!("Authorization: {value}\r\n"));
        }
        let body = body.unwrap_or("");
        if !body.is_empty() {
            headers.push_str("Content-Type: application/json\r\n");
        }
        headers.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ));
        stream.write_all(headers.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    fn body_json(response: &str) -> serde_json::Value {
        let body = response
            .split("\r\n\r\n")
            .nth(1)
            .expect("response has a body");
        serde_json::from_str(body).expect("body is JSON")
    }
}
