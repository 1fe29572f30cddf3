use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{
    store::{EntryMeta, Error, NewSecret},
    AppState,
};

/// Header carrying the delete token for owner-only routes.
pub const DELETE_TOKEN_HEADER: &str = "x-delete-token";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Run blocking storage work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(Error::StorageUnavailable(format!("worker failed: {e}"))))
}

fn error_response(e: Error) -> Response {
    let (status, message) = match &e {
        Error::NotFound => (StatusCode::NOT_FOUND, "not found or expired"),
        // Same body for malformed and wrong keys.
        Error::InvalidKey | Error::KeyInvalid => (StatusCode::FORBIDDEN, "invalid key"),
        Error::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
        Error::KeyLimitReached => (StatusCode::CONFLICT, "key limit reached"),
        Error::CreateFailed(_) => {
            tracing::error!(error = %e, "create failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
        Error::StorageUnavailable(_) => {
            tracing::error!(error = %e, "storage unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
        }
    };
    (status, Json(json!({"error": message}))).into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn delete_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DELETE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn missing_token() -> Response {
    error_response(Error::Unauthorized)
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateParams {
    /// Seconds until expiry.
    pub ttl: Option<i64>,
    pub reads: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateResponse {
    pub id: String,
    pub key_id: String,
    pub key: String,
    pub delete_token: String,
    pub expires_at: i64,
    pub remaining_reads: i64,
}

pub async fn create_secret(
    State(state): State<AppState>,
    Query(params): Query<CreateParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return bad_request("secret body is empty");
    }
    if body.len() > state.max_secret_bytes {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({"error": format!("secret exceeds {} bytes", state.max_secret_bytes)})),
        )
            .into_response();
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_owned();
    let ttl_seconds = params.ttl.unwrap_or(state.default_ttl_seconds);
    let max_reads = params.reads.unwrap_or(1);

    let manager = state.manager.clone();
    let result = blocking(move || {
        manager.create_secret(NewSecret {
            plaintext: &body,
            content_type: &content_type,
            ttl_seconds,
            max_reads,
        })
    })
    .await;

    match result {
        Ok(created) => (
            StatusCode::CREATED,
            Json(CreateResponse {
                id: created.entry_id,
                key_id: created.key_id,
                key: created.key,
                delete_token: created.delete_token,
                expires_at: created.meta.expires_at,
                remaining_reads: created.meta.remaining_reads,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// ── Read ──────────────────────────────────────────────────────────────────────

pub async fn read_secret(
    State(state): State<AppState>,
    Path((id, key)): Path<(String, String)>,
) -> Response {
    let manager = state.manager.clone();
    match blocking(move || manager.read_secret(&id, &key)).await {
        Ok(revealed) => {
            let mut headers = meta_headers(&revealed.meta);
            let content_type = HeaderValue::from_str(&revealed.content_type)
                .unwrap_or(HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
            headers.insert(header::CONTENT_TYPE, content_type);
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            (StatusCode::OK, headers, revealed.plaintext).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ── Head ──────────────────────────────────────────────────────────────────────

fn meta_headers(meta: &EntryMeta) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-hush-remaining-reads", HeaderValue::from(meta.remaining_reads));
    headers.insert("x-hush-expires-at", HeaderValue::from(meta.expires_at));
    headers.insert("x-hush-created-at", HeaderValue::from(meta.created_at));
    if let Some(accessed) = meta.accessed_at {
        headers.insert("x-hush-accessed-at", HeaderValue::from(accessed));
    }
    if let Ok(ct) = HeaderValue::from_str(&meta.content_type) {
        headers.insert("x-hush-content-type", ct);
    }
    headers
}

pub async fn head_secret(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let manager = state.manager.clone();
    match blocking(move || manager.read_meta(&id)).await {
        Ok(meta) => (StatusCode::OK, meta_headers(&meta)).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Keys ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MintRequest {
    /// An existing, currently usable key of the secret.
    pub key: String,
    pub ttl_seconds: Option<i64>,
    pub max_reads: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MintResponse {
    pub key_id: String,
    pub key: String,
    pub expires_at: Option<i64>,
    pub remaining_reads: Option<i64>,
}

pub async fn mint_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MintRequest>,
) -> Response {
    let manager = state.manager.clone();
    let result = blocking(move || {
        manager.mint_key(&id, &body.key, body.ttl_seconds, body.max_reads)
    })
    .await;

    match result {
        Ok(minted) => (
            StatusCode::CREATED,
            Json(MintResponse {
                key_id: minted.key_id,
                key: minted.key,
                expires_at: minted.meta.expires_at,
                remaining_reads: minted.meta.remaining_reads,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(token) = delete_token(&headers) else {
        return missing_token();
    };
    let manager = state.manager.clone();
    match blocking(move || manager.list_keys(&id, &token)).await {
        Ok(keys) => Json(json!({ "keys": keys })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn revoke_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, key_id)): Path<(String, String)>,
) -> Response {
    let Some(token) = delete_token(&headers) else {
        return missing_token();
    };
    let manager = state.manager.clone();
    match blocking(move || manager.revoke_key(&id, &key_id, &token)).await {
        Ok(()) => Json(json!({"revoked": true})).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Delete ────────────────────────────────────────────────────────────────────

pub async fn delete_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(token) = delete_token(&headers) else {
        return missing_token();
    };
    let manager = state.manager.clone();
    match blocking(move || manager.delete_secret(&id, &token)).await {
        Ok(()) => Json(json!({"deleted": true})).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Prune ─────────────────────────────────────────────────────────────────────

pub async fn prune_secrets(State(state): State<AppState>) -> Response {
    let manager = state.manager.clone();
    match blocking(move || manager.delete_expired()).await {
        Ok(report) => {
            info!(entries = report.entries, keys = report.keys, "manual prune");
            Json(json!({"entries": report.entries, "keys": report.keys})).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request},
        Router,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::server::router;
    use crate::store::{Limits, Manager, MemoryStorage};

    fn app_with(api_key: Option<&str>) -> Router {
        let state = AppState {
            manager: Arc::new(Manager::new(MemoryStorage::new().into(), Limits::default())),
            api_key: api_key.map(str::to_owned),
            default_ttl_seconds: 3600,
            max_secret_bytes: 64,
        };
        router(state, None)
    }

    async fn send(app: &Router, req: Request<Body>) -> Response {
        app.clone().oneshot(req).await.unwrap()
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    async fn create(app: &Router, payload: &str, reads: i64) -> CreateResponse {
        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("/secrets?reads={reads}&ttl=600"))
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(payload.to_owned()))
            .unwrap();
        let resp = send(app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        serde_json::from_slice(&body_bytes(resp).await).unwrap()
    }

    fn get(uri: String) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = app_with(None);
        let resp = send(&app, get("/health".into())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_read_then_gone() {
        let app = app_with(None);
        let created = create(&app, "hunter2", 1).await;
        assert_eq!(created.remaining_reads, 1);

        let resp = send(&app, get(format!("/secrets/{}/{}", created.id, created.key))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(resp.headers()["x-hush-remaining-reads"], "0");
        assert_eq!(body_bytes(resp).await, b"hunter2");

        let resp = send(&app, get(format!("/secrets/{}/{}", created.id, created.key))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wrong_and_malformed_keys_look_alike() {
        let app = app_with(None);
        let created = create(&app, "data", 2).await;
        let wrong = "ab".repeat(32);

        let a = send(&app, get(format!("/secrets/{}/{wrong}", created.id))).await;
        let b = send(&app, get(format!("/secrets/{}/zz", created.id))).await;
        assert_eq!(a.status(), StatusCode::FORBIDDEN);
        assert_eq!(b.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_bytes(a).await, body_bytes(b).await);
    }

    #[tokio::test]
    async fn head_reports_meta_without_consuming() {
        let app = app_with(None);
        let created = create(&app, "data", 2).await;
        for _ in 0..2 {
            let req = Request::builder()
                .method(Method::HEAD)
                .uri(format!("/secrets/{}", created.id))
                .body(Body::empty())
                .unwrap();
            let resp = send(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(resp.headers()["x-hush-remaining-reads"], "2");
        }
    }

    #[tokio::test]
    async fn delete_requires_token() {
        let app = app_with(None);
        let created = create(&app, "data", 2).await;
        let delete = |token: Option<&str>| {
            let mut req = Request::builder()
                .method(Method::DELETE)
                .uri(format!("/secrets/{}", created.id));
            if let Some(t) = token {
                req = req.header(DELETE_TOKEN_HEADER, t);
            }
            req.body(Body::empty()).unwrap()
        };

        assert_eq!(send(&app, delete(None)).await.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            send(&app, delete(Some("wrong"))).await.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            send(&app, delete(Some(&created.delete_token))).await.status(),
            StatusCode::OK
        );
        assert_eq!(
            send(&app, delete(Some(&created.delete_token))).await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn mint_list_and_revoke() {
        let app = app_with(None);
        let created = create(&app, "shared", 5).await;

        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("/secrets/{}/keys", created.id))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"key": created.key, "max_reads": 1}).to_string(),
            ))
            .unwrap();
        let resp = send(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let minted: MintResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(minted.remaining_reads, Some(1));

        let req = Request::builder()
            .uri(format!("/secrets/{}/keys", created.id))
            .header(DELETE_TOKEN_HEADER, &created.delete_token)
            .body(Body::empty())
            .unwrap();
        let resp = send(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let listed: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(listed["keys"].as_array().map(Vec::len), Some(2));

        let req = Request::builder()
            .method(Method::DELETE)
            .uri(format!("/secrets/{}/keys/{}", created.id, minted.key_id))
            .header(DELETE_TOKEN_HEADER, &created.delete_token)
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, req).await.status(), StatusCode::OK);

        // A revoked key reads like a spent one.
        let resp = send(&app, get(format!("/secrets/{}/{}", created.id, minted.key))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = send(&app, get(format!("/secrets/{}/{}", created.id, created.key))).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    fn mint_request(id: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(format!("/secrets/{id}/keys"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn secret_size_limit_only_applies_to_create() {
        let app = app_with(None);
        let created = create(&app, "small", 5).await;

        // Well past the 64-byte secret limit, but an ordinary JSON body.
        let body = json!({
            "key": created.key,
            "ttl_seconds": 600,
            "max_reads": 2,
        });
        assert!(body.to_string().len() > 64);
        let resp = send(&app, mint_request(&created.id, body)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/secrets")
            .body(Body::from("y".repeat(65)))
            .unwrap();
        assert_eq!(send(&app, req).await.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn minting_past_the_key_limit_conflicts() {
        let app = app_with(None);
        let created = create(&app, "busy", 5).await;
        let max = Limits::default().max_keys_per_entry;
        for _ in 1..max {
            let resp = send(&app, mint_request(&created.id, json!({"key": created.key}))).await;
            assert_eq!(resp.status(), StatusCode::CREATED);
        }
        let resp = send(&app, mint_request(&created.id, json!({"key": created.key}))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(
            body_bytes(resp).await,
            json!({"error": "key limit reached"}).to_string().into_bytes()
        );
    }

    #[tokio::test]
    async fn api_key_guards_create_and_prune() {
        let app = app_with(Some("admin-key"));
        let req = Request::builder()
            .method(Method::POST)
            .uri("/secrets")
            .body(Body::from("x"))
            .unwrap();
        assert_eq!(send(&app, req).await.status(), StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/prune")
            .header(header::AUTHORIZATION, "Bearer admin-key")
            .body(Body::empty())
            .unwrap();
        let resp = send(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let report: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(report["entries"], 0);
    }

    #[tokio::test]
    async fn rejects_bad_create_requests() {
        let app = app_with(None);
        let req = Request::builder()
            .method(Method::POST)
            .uri("/secrets")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/secrets?reads=lots")
            .body(Body::from("x"))
            .unwrap();
        assert_eq!(send(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/secrets")
            .body(Body::from("x".repeat(65)))
            .unwrap();
        assert_eq!(send(&app, req).await.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
