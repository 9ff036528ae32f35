//! HTTP/JSON control plane
//!
//! The management surface for the forwarder: lifecycle, router
//! inspection and mutation, the public-IP store, and version info.
//! Mounted under `/api` by the binary.
//!
//! | Verb + path                 | Body             | Result           |
//! |-----------------------------|------------------|------------------|
//! | `POST /start`               | none             | 204, 500+reason  |
//! | `POST /stop`                | none             | 204              |
//! | `GET /version`              | none             | `{version,date}` |
//! | `GET /router`               | none             | `RouterExport`   |
//! | `PUT /router/resolver`      | `ResolverExport` | 204, 400+reason  |
//! | `PUT /router/routes/{index}`| `RouteExport`    | 204, 400+reason  |
//! | `PUT /myip`                 | `{ip}`           | 204, 400+reason  |

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::Json;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::myip::MyIp;
use crate::config::{version, Config, VersionInfo};
use crate::dns::router::{RouteExport, RouterExport};
use crate::dns::server::Forwarder;
use crate::dns::ResolverExport;

/// Shared state of the API handlers.
#[derive(Clone)]
pub struct ApiState {
    /// The forwarder under management.
    pub forwarder: Arc<Forwarder>,
    /// The loaded configuration.
    pub config: Arc<Config>,
    /// The public-IP store.
    pub myip: Arc<MyIp>,
}

/// Build the API router.
pub fn api_router(state: ApiState) -> axum::Router {
    axum::Router::new()
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/version", get(get_version))
        .route("/router", get(get_router))
        .route("/router/resolver", put(put_resolver))
        .route("/router/routes/{index}", put(put_route))
        .route("/myip", put(put_myip))
        .with_state(state)
}

/// Start the forwarder, applying the configured default resolver first.
async fn start(State(state): State<ApiState>) -> Result<StatusCode, (StatusCode, String)> {
    match &state.config.file.resolver {
        None => warn!("no resolver configured yet"),
        Some(export) => {
            if let Err(e) = state.forwarder.router().set_resolver(export).await {
                warn!(error = %e, "failed to set configured resolver");
            } else {
                info!(address = %export.address, "set resolver from config");
            }
        }
    }

    state
        .forwarder
        .start()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("start failure: {e}")))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop(State(state): State<ApiState>) -> StatusCode {
    state.forwarder.stop().await;
    StatusCode::NO_CONTENT
}

async fn get_version() -> Json<VersionInfo> {
    Json(version())
}

async fn get_router(State(state): State<ApiState>) -> Json<RouterExport> {
    Json(state.forwarder.router().export().await)
}

async fn put_resolver(
    State(state): State<ApiState>,
    Json(export): Json<ResolverExport>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .forwarder
        .router()
        .set_resolver(&export)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_route(
    State(state): State<ApiState>,
    Path(index): Path<usize>,
    Json(mut export): Json<RouteExport>,
) -> Result<StatusCode, (StatusCode, String)> {
    export.index = index;
    state
        .forwarder
        .router()
        .set_route(&export)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct MyIpBody {
    ip: String,
}

async fn put_myip(
    State(state): State<ApiState>,
    Json(body): Json<MyIpBody>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .myip
        .set(&body.ip)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    info!(ip = %body.ip, "set public IP");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::dns::router::Router;

    fn test_state() -> ApiState {
        let roots = Arc::new(rustls::RootCertStore::empty());
        let router = Arc::new(Router::new(Arc::clone(&roots)));
        let myip = Arc::new(MyIp::new());
        let forwarder = Arc::new(Forwarder::new(router, Arc::clone(&myip)));
        let config = Arc::new(Config {
            file: crate::config::ConfigFile::default(),
            roots,
            dir: std::env::temp_dir(),
        });
        ApiState {
            forwarder,
            config,
            myip,
        }
    }

    async fn send(
        state: &ApiState,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, Vec<u8>) {
        let request = match body {
            Some(json) => Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };

        let response = api_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, bytes.to_vec())
    }

    // ========================================================================
    // Version & Router Export
    // ========================================================================

    #[tokio::test]
    async fn test_get_version() {
        let state = test_state();
        let (status, body) = send(&state, "GET", "/version", None).await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json.get("version").is_some());
        assert!(json.get("date").is_some());
    }

    #[tokio::test]
    async fn test_get_router_empty() {
        let state = test_state();
        let (status, body) = send(&state, "GET", "/router", None).await;
        assert_eq!(status, StatusCode::OK);

        let export: RouterExport = serde_json::from_slice(&body).unwrap();
        assert!(export.resolver.is_none());
        assert!(export.routes.is_empty());
    }

    // ========================================================================
    // Router Mutation
    // ========================================================================

    #[tokio::test]
    async fn test_put_resolver_and_export() {
        let state = test_state();
        let (status, _) = send(
            &state,
            "PUT",
            "/router/resolver",
            Some(serde_json::json!({"protocol": "udp", "address": "127.0.0.1:5301"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = send(&state, "GET", "/router", None).await;
        let export: RouterExport = serde_json::from_slice(&body).unwrap();
        assert_eq!(export.resolver.unwrap().address, "127.0.0.1:5301");

        state.forwarder.router().close().await;
    }

    #[tokio::test]
    async fn test_put_resolver_invalid_address() {
        let state = test_state();
        let (status, body) = send(
            &state,
            "PUT",
            "/router/resolver",
            Some(serde_json::json!({"address": "bogus"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.is_empty());
    }

    #[tokio::test]
    async fn test_put_route_uses_path_index() {
        let state = test_state();
        let (status, _) = send(
            &state,
            "PUT",
            "/router/routes/3",
            Some(serde_json::json!({
                "name": "cdn",
                "resolver": {"protocol": "udp", "address": "127.0.0.1:5302"},
                "zones": ["example.com"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = send(&state, "GET", "/router", None).await;
        let export: RouterExport = serde_json::from_slice(&body).unwrap();
        assert_eq!(export.routes.len(), 1);
        assert_eq!(export.routes[0].index, 3);
        assert_eq!(export.routes[0].name, "cdn");

        state.forwarder.router().close().await;
    }

    #[tokio::test]
    async fn test_put_route_reserved_index() {
        let state = test_state();
        let (status, _) = send(
            &state,
            "PUT",
            "/router/routes/0",
            Some(serde_json::json!({"name": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // ========================================================================
    // Lifecycle & MyIP
    // ========================================================================

    #[tokio::test]
    async fn test_start_without_listeners_is_500() {
        let state = test_state();
        let (status, body) = send(&state, "POST", "/start", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(String::from_utf8_lossy(&body).contains("start failure"));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_204() {
        let state = test_state();
        let (status, _) = send(&state, "POST", "/stop", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_put_myip() {
        let state = test_state();
        let (status, _) = send(
            &state,
            "PUT",
            "/myip",
            Some(serde_json::json!({"ip": "203.0.113.5"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.myip.v4().is_some());

        let (status, _) = send(
            &state,
            "PUT",
            "/myip",
            Some(serde_json::json!({"ip": "192.168.1.1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
