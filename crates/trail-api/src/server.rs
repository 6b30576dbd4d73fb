//! Axum server and routes.

use crate::document::Document;
use axum::{
    extract::{Path, Query, Request, State},
    http::HeaderMap,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use trail_engine::{
    with_scope, Event, ItemKey, ReifyOptions, RequestScope, Tracked, Trail, TrailError, Version,
    VersionId, VersionListOptions,
};
use uuid::Uuid;

/// Shared state: the versioning engine plus the host's document table.
pub struct AppState {
    pub trail: Arc<Trail>,
    documents: RwLock<HashMap<i64, Tracked<Document>>>,
    next_id: AtomicI64,
}

impl AppState {
    pub fn new(trail: Arc<Trail>) -> Self {
        Self {
            trail,
            documents: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

/// Response envelope shared by every route.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            code: 200,
            message: "Success".to_string(),
            data: Some(data),
        })
    }

    fn error(code: i32, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            code,
            message: message.into(),
            data: None,
        })
    }

    fn from_trail_error(err: TrailError) -> Json<Self> {
        let code = match &err {
            TrailError::NotFound(_) => 404,
            TrailError::Policy(_) | TrailError::Record(_) | TrailError::InvalidState(_) => 400,
            TrailError::Recording(_) | TrailError::Codec(_) => 500,
        };
        if code == 500 {
            tracing::error!(error = %err, "versioned write failed");
        }
        Self::error(code, err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct DocumentView {
    pub document: Document,
    /// Version written by this request, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotView {
    pub document: Document,
    pub live: bool,
    /// Version the snapshot was rebuilt from; absent for the state before
    /// tracking began.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<VersionId>,
}

#[derive(Debug, Deserialize)]
pub struct CreateDocumentRequest {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDocumentRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AtQuery {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreQuery {
    pub version_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct VersionListQuery {
    #[serde(default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/documents", post(handle_create))
        .route(
            "/documents/:id",
            get(handle_get).put(handle_update).delete(handle_delete),
        )
        .route("/documents/:id/versions", get(handle_versions))
        .route("/documents/:id/at", get(handle_at))
        .route("/documents/:id/restore", post(handle_restore))
        .route("/versions", get(handle_version_list))
        .route("/health", get(handle_health))
        .layer(middleware::from_fn(request_scope))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs each request inside its own versioning scope: `x-actor` becomes the
/// actor, request id and user agent become version metadata.
async fn request_scope(req: Request, next: Next) -> Response {
    let scope = scope_from_headers(req.headers());
    with_scope(scope, next.run(req)).await
}

fn scope_from_headers(headers: &HeaderMap) -> RequestScope {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let request_id = header("x-request-id").unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut scope = RequestScope::new().with_metadata("request_id", request_id.into());
    if let Some(actor) = header("x-actor") {
        scope = scope.with_actor(actor);
    }
    if let Some(agent) = header("user-agent") {
        scope = scope.with_metadata("user_agent", agent.into());
    }
    scope
}

async fn handle_create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDocumentRequest>,
) -> Json<ApiResponse<DocumentView>> {
    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let mut tracked = Tracked::new(Document {
        id: Some(id),
        title: req.title,
        body: req.body,
        status: req.status,
        updated_at: Utc::now(),
    });
    let mut documents = state.documents.write().await;
    match save_in_unit(&state.trail, &mut tracked, Event::Create).await {
        Ok(version) => {
            let document = tracked.get().clone();
            documents.insert(id, tracked);
            ApiResponse::ok(DocumentView { document, version })
        }
        Err(e) => ApiResponse::from_trail_error(e),
    }
}

async fn handle_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Json<ApiResponse<Document>> {
    match state.documents.read().await.get(&id) {
        Some(doc) => ApiResponse::ok(doc.get().clone()),
        None => ApiResponse::error(404, format!("document {} not found", id)),
    }
}

async fn handle_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateDocumentRequest>,
) -> Json<ApiResponse<DocumentView>> {
    let mut documents = state.documents.write().await;
    let Some(current) = documents.get(&id) else {
        return ApiResponse::error(404, format!("document {} not found", id));
    };
    let mut tracked = current.clone();
    if let Some(title) = req.title {
        tracked.title = title;
    }
    if let Some(body) = req.body {
        tracked.body = body;
    }
    if let Some(status) = req.status {
        tracked.status = Some(status);
    }
    if !tracked.changed_attributes().is_empty() {
        tracked.updated_at = Utc::now();
    }
    match save_in_unit(&state.trail, &mut tracked, Event::Update).await {
        Ok(version) => {
            let document = tracked.get().clone();
            documents.insert(id, tracked);
            ApiResponse::ok(DocumentView { document, version })
        }
        Err(e) => ApiResponse::from_trail_error(e),
    }
}

async fn handle_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Json<ApiResponse<DocumentView>> {
    let mut documents = state.documents.write().await;
    let Some(current) = documents.get(&id) else {
        return ApiResponse::error(404, format!("document {} not found", id));
    };
    let mut tracked = current.clone();
    match save_in_unit(&state.trail, &mut tracked, Event::Destroy).await {
        Ok(version) => {
            documents.remove(&id);
            ApiResponse::ok(DocumentView {
                document: tracked.into_inner(),
                version,
            })
        }
        Err(e) => ApiResponse::from_trail_error(e),
    }
}

/// One mutation in its own unit of work. The caller applies the host write
/// only after this returns `Ok`, so a failed recording leaves both untouched.
async fn save_in_unit(
    trail: &Trail,
    tracked: &mut Tracked<Document>,
    event: Event,
) -> Result<Option<Version>, TrailError> {
    let mut uow = trail.begin().await?;
    uow.on_commit(|versions| {
        for v in versions {
            tracing::info!(
                item_type = %v.item_type,
                item_id = %v.item_id,
                event = %v.event,
                version_id = %v.id,
                "version committed"
            );
        }
    });
    let version = match event {
        Event::Create => uow.create(tracked).await?,
        Event::Update => uow.save(tracked).await?,
        Event::Destroy => uow.destroy(tracked).await?,
    };
    uow.commit().await?;
    Ok(version)
}

async fn handle_versions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Json<ApiResponse<Vec<Version>>> {
    let key = ItemKey::new(<Document as trail_engine::Trackable>::ITEM_TYPE, id.to_string());
    match state.trail.history(&key).await {
        Ok(versions) if versions.is_empty() => {
            ApiResponse::error(404, format!("no versions for document {}", id))
        }
        Ok(versions) => ApiResponse::ok(versions),
        Err(e) => ApiResponse::from_trail_error(e),
    }
}

async fn handle_at(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(q): Query<AtQuery>,
) -> Json<ApiResponse<SnapshotView>> {
    let documents = state.documents.read().await;
    let live = documents.get(&id);
    match state
        .trail
        .version_at::<Document>(&id.to_string(), live, q.timestamp)
        .await
    {
        Ok(Some(snapshot)) => {
            let version_id = match snapshot.liveness() {
                trail_engine::Liveness::Reified { version_id } => version_id,
                trail_engine::Liveness::Live => None,
            };
            ApiResponse::ok(SnapshotView {
                live: snapshot.is_live(),
                version_id,
                document: snapshot.into_inner(),
            })
        }
        Ok(None) => ApiResponse::error(
            404,
            format!("document {} did not exist at {}", id, q.timestamp.to_rfc3339()),
        ),
        Err(e) => ApiResponse::from_trail_error(e),
    }
}

/// Bring a document back to the state right after `version_id`; recorded as
/// an update, or as a create when the document was deleted.
async fn handle_restore(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(q): Query<RestoreQuery>,
) -> Json<ApiResponse<DocumentView>> {
    let version = match state.trail.store().get(VersionId(q.version_id)).await {
        Ok(Some(v)) => v,
        Ok(None) => return ApiResponse::error(404, format!("version {} not found", q.version_id)),
        Err(e) => return ApiResponse::from_trail_error(e.into()),
    };
    if version.item_key() != ItemKey::new("Document", id.to_string()) {
        return ApiResponse::error(
            400,
            format!("version {} does not belong to document {}", version.id, id),
        );
    }
    let mut documents = state.documents.write().await;
    let live = documents.get(&id);
    let mut restored = match state
        .trail
        .reify::<Document>(&version, live, ReifyOptions::default())
        .await
    {
        Ok(r) => r,
        Err(e) => return ApiResponse::from_trail_error(e),
    };
    restored.updated_at = Utc::now();
    match save_in_unit(&state.trail, &mut restored, Event::Update).await {
        Ok(written) => {
            let document = restored.get().clone();
            documents.insert(id, restored);
            ApiResponse::ok(DocumentView {
                document,
                version: written,
            })
        }
        Err(e) => ApiResponse::from_trail_error(e),
    }
}

async fn handle_version_list(
    State(state): State<Arc<AppState>>,
    Query(q): Query<VersionListQuery>,
) -> Json<ApiResponse<Vec<Version>>> {
    let event = match q.event.as_deref().map(|e| Event::parse(e).ok_or(e)) {
        None => None,
        Some(Ok(event)) => Some(event),
        Some(Err(bad)) => return ApiResponse::error(400, format!("unknown event: {}", bad)),
    };
    let opts = VersionListOptions {
        item_type: q.item_type,
        actor: q.actor,
        event,
        since: q.since,
        limit: q.limit,
        offset: q.offset,
    };
    match state.trail.store().list(&opts).await {
        Ok(versions) => ApiResponse::ok(versions),
        Err(e) => ApiResponse::from_trail_error(e.into()),
    }
}

async fn handle_health() -> &'static str {
    "ok"
}
