//! HTTP API layer exposing the drive: file and folder endpoints,
//! permissions, groups, settings and the filtered notification stream.

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use drive_hub_core::acl::Grant;
use drive_hub_core::auth::TokenVerifier;
use drive_hub_core::cache::FolderView;
use drive_hub_core::drive::{Drive, FilePermissionsView};
use drive_hub_core::error::Error;
use drive_hub_core::events::NotificationBus;
use drive_hub_core::ledger::{EntityGrant, FileId, FileRecord, GroupGrant, GroupId, GroupRecord};
use drive_hub_core::settings::Settings;

/// Authentication context extracted from request headers.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub entity: String,
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        if let Some(auth) = headers.get("Authorization").and_then(|v| v.to_str().ok()) {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                if let Some(verifier) = &state.verifier {
                    if let Ok(claims) = verifier.verify(token).await {
                        return Ok(Self {
                            entity: claims.sub,
                        });
                    }
                }
            }
        }
        let entity = headers
            .get("X-Entity-Id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        match entity {
            Some(entity) if !entity.is_empty() => Ok(Self { entity }),
            _ => Err(StatusCode::UNAUTHORIZED),
        }
    }
}

/// Shared application state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub drive: Arc<Drive>,
    pub notifications: NotificationBus,
    pub verifier: Option<Arc<dyn TokenVerifier>>,
}

#[derive(Serialize, Deserialize)]
struct CreateFileRequest {
    parent: Option<u64>,
    name: String,
    #[serde(default)]
    is_public: bool,
    /// Base64-encoded file body.
    #[serde(default)]
    content: String,
}

#[derive(Serialize, Deserialize)]
struct CreateFolderRequest {
    parent: Option<u64>,
    name: String,
}

#[derive(Serialize, Deserialize)]
struct IdResponse {
    id: u64,
}

#[derive(Deserialize)]
struct UpdateFileRequest {
    name: Option<String>,
    labels: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct DeleteParams {
    #[serde(default)]
    permanent: bool,
}

#[derive(Serialize, Deserialize)]
struct PurgeRequest {
    ids: Vec<u64>,
}

#[derive(Serialize, Deserialize)]
struct GrantBody {
    #[serde(default)]
    read: bool,
    #[serde(default)]
    write: bool,
}

#[derive(Serialize, Deserialize)]
struct EntityGrantBody {
    entity: String,
    #[serde(default)]
    read: bool,
    #[serde(default)]
    write: bool,
}

#[derive(Serialize, Deserialize)]
struct GroupGrantBody {
    group: u64,
    #[serde(default)]
    read: bool,
    #[serde(default)]
    write: bool,
}

#[derive(Serialize, Deserialize)]
struct PermissionUpdateRequest {
    is_public: bool,
    #[serde(default)]
    entities: Vec<EntityGrantBody>,
    #[serde(default)]
    groups: Vec<GroupGrantBody>,
}

#[derive(Serialize, Deserialize)]
struct GroupCreateRequest {
    name: String,
}

#[derive(Deserialize)]
struct GroupRenameRequest {
    name: String,
}

fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::AccessDenied(_) => StatusCode::FORBIDDEN,
        Error::FileNotFound(_) | Error::GroupNotFound(_) => StatusCode::NOT_FOUND,
        Error::NotAFolder(_) | Error::ParentCycle(_) | Error::Invalid(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::TransientSync { .. } | Error::FatalSync(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Storage(_) | Error::Encryption(_) | Error::Ledger(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub fn router(
    drive: Arc<Drive>,
    notifications: NotificationBus,
    verifier: Option<Arc<dyn TokenVerifier>>,
) -> Router {
    let state = AppState {
        drive,
        notifications,
        verifier,
    };
    Router::new()
        .route("/health", get(health))
        .route("/files", post(create_file))
        .route(
            "/files/{id}",
            get(get_file).patch(update_file).delete(delete_file),
        )
        .route("/files/{id}/content", get(get_content).put(put_content))
        .route("/files/{id}/path", get(get_path))
        .route("/files/{id}/restore", post(restore_file))
        .route(
            "/files/{id}/permissions",
            get(get_permissions).put(set_permissions),
        )
        .route(
            "/files/{id}/permissions/entities/{entity}",
            put(grant_entity).delete(revoke_entity),
        )
        .route(
            "/files/{id}/permissions/groups/{group}",
            put(grant_group).delete(revoke_group),
        )
        .route("/folders", post(create_folder))
        .route("/folders/{id}", get(list_folder))
        .route("/trash/purge", post(purge_files))
        .route("/groups", get(list_groups).post(create_group))
        .route(
            "/groups/{id}",
            get(get_group).patch(rename_group).delete(delete_group),
        )
        .route(
            "/groups/{id}/members/{entity}",
            put(add_member).delete(remove_member),
        )
        .route("/settings", get(get_settings).put(put_settings))
        .route("/events", get(event_stream))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn create_file(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateFileRequest>,
) -> Result<Json<IdResponse>, StatusCode> {
    let parent = req.parent.map(FileId).unwrap_or(FileId::ROOT);
    let content = BASE64
        .decode(req.content.as_bytes())
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let id = state
        .drive
        .add_file(
            &auth.entity,
            parent,
            &req.name,
            Bytes::from(content),
            req.is_public,
        )
        .await
        .map_err(|err| error_status(&err))?;
    Ok(Json(IdResponse { id: id.0 }))
}

async fn get_file(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<u64>,
) -> Result<Json<FileRecord>, StatusCode> {
    let id = FileId(id);
    let record = state
        .drive
        .ledger()
        .file(id)
        .await
        .map_err(|err| error_status(&err))?
        .ok_or(StatusCode::NOT_FOUND)?;
    let allowed = state
        .drive
        .ledger()
        .has_read_access(id, &auth.entity)
        .await
        .map_err(|err| error_status(&err))?;
    if allowed {
        Ok(Json(record))
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

async fn update_file(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<u64>,
    Json(req): Json<UpdateFileRequest>,
) -> StatusCode {
    let id = FileId(id);
    if let Some(name) = &req.name {
        if let Err(err) = state.drive.rename(&auth.entity, id, name).await {
            return error_status(&err);
        }
    }
    if let Some(labels) = req.labels {
        if let Err(err) = state.drive.set_labels(&auth.entity, id, labels).await {
            return error_status(&err);
        }
    }
    StatusCode::NO_CONTENT
}

async fn delete_file(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<u64>,
    Query(params): Query<DeleteParams>,
) -> StatusCode {
    let id = FileId(id);
    let outcome = if params.permanent {
        state.drive.delete_permanently(&auth.entity, id).await
    } else {
        state.drive.delete(&auth.entity, id).await
    };
    match outcome {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

async fn restore_file(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<u64>,
) -> StatusCode {
    match state.drive.restore(&auth.entity, FileId(id)).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

async fn get_content(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, StatusCode> {
    let bytes = state
        .drive
        .file_content(&auth.entity, FileId(id))
        .await
        .map_err(|err| error_status(&err))?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

async fn put_content(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<u64>,
    body: Bytes,
) -> StatusCode {
    match state
        .drive
        .set_file_content(&auth.entity, FileId(id), body)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

async fn get_path(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(id): Path<u64>,
) -> Result<Json<Vec<FileId>>, StatusCode> {
    state
        .drive
        .path(FileId(id))
        .map(Json)
        .map_err(|err| error_status(&err))
}

async fn create_folder(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateFolderRequest>,
) -> Result<Json<IdResponse>, StatusCode> {
    let parent = req.parent.map(FileId).unwrap_or(FileId::ROOT);
    let id = state
        .drive
        .create_folder(&auth.entity, parent, &req.name)
        .await
        .map_err(|err| error_status(&err))?;
    Ok(Json(IdResponse { id: id.0 }))
}

async fn list_folder(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<u64>,
) -> Result<Json<FolderView>, StatusCode> {
    state
        .drive
        .list_folder(&auth.entity, FileId(id))
        .await
        .map(Json)
        .map_err(|err| error_status(&err))
}

async fn purge_files(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<PurgeRequest>,
) -> StatusCode {
    let ids: Vec<FileId> = req.ids.into_iter().map(FileId).collect();
    match state
        .drive
        .delete_batch_permanently(&auth.entity, &ids)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

async fn get_permissions(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<u64>,
) -> Result<Json<FilePermissionsView>, StatusCode> {
    let id = FileId(id);
    let allowed = state
        .drive
        .ledger()
        .has_read_access(id, &auth.entity)
        .await
        .map_err(|err| error_status(&err))?;
    if !allowed {
        return Err(StatusCode::FORBIDDEN);
    }
    state
        .drive
        .file_permissions(id)
        .await
        .map(Json)
        .map_err(|err| error_status(&err))
}

async fn set_permissions(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<u64>,
    Json(req): Json<PermissionUpdateRequest>,
) -> StatusCode {
    let entity_grants = req
        .entities
        .into_iter()
        .map(|body| EntityGrant {
            entity: body.entity,
            grant: Grant::new(body.read, body.write),
        })
        .collect();
    let group_grants = req
        .groups
        .into_iter()
        .map(|body| GroupGrant {
            group: GroupId(body.group),
            grant: Grant::new(body.read, body.write),
        })
        .collect();
    match state
        .drive
        .set_permissions(
            &auth.entity,
            FileId(id),
            entity_grants,
            group_grants,
            req.is_public,
        )
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

async fn grant_entity(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((id, entity)): Path<(u64, String)>,
    Json(req): Json<GrantBody>,
) -> StatusCode {
    match state
        .drive
        .set_entity_permission(
            &auth.entity,
            FileId(id),
            &entity,
            Grant::new(req.read, req.write),
        )
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

async fn revoke_entity(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((id, entity)): Path<(u64, String)>,
) -> StatusCode {
    match state
        .drive
        .remove_entity_from_file(&auth.entity, FileId(id), &entity)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

async fn grant_group(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((id, group)): Path<(u64, u64)>,
    Json(req): Json<GrantBody>,
) -> StatusCode {
    match state
        .drive
        .set_group_permission(
            &auth.entity,
            FileId(id),
            GroupId(group),
            Grant::new(req.read, req.write),
        )
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

async fn revoke_group(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((id, group)): Path<(u64, u64)>,
) -> StatusCode {
    match state
        .drive
        .remove_group_from_file(&auth.entity, FileId(id), GroupId(group))
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

async fn list_groups(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<Vec<GroupRecord>>, StatusCode> {
    state
        .drive
        .groups()
        .await
        .map(Json)
        .map_err(|err| error_status(&err))
}

async fn create_group(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<GroupCreateRequest>,
) -> Result<Json<IdResponse>, StatusCode> {
    let id = state
        .drive
        .create_group(&auth.entity, &req.name)
        .await
        .map_err(|err| error_status(&err))?;
    Ok(Json(IdResponse { id: id.0 }))
}

async fn get_group(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(id): Path<u64>,
) -> Result<Json<GroupRecord>, StatusCode> {
    state
        .drive
        .group(GroupId(id))
        .await
        .map(Json)
        .map_err(|err| error_status(&err))
}

async fn rename_group(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<u64>,
    Json(req): Json<GroupRenameRequest>,
) -> StatusCode {
    match state
        .drive
        .rename_group(&auth.entity, GroupId(id), &req.name)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

async fn delete_group(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<u64>,
) -> StatusCode {
    match state.drive.delete_group(&auth.entity, GroupId(id)).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

async fn add_member(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((id, entity)): Path<(u64, String)>,
) -> StatusCode {
    match state
        .drive
        .add_entity_to_group(&auth.entity, GroupId(id), &entity)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

async fn remove_member(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((id, entity)): Path<(u64, String)>,
) -> StatusCode {
    match state
        .drive
        .remove_entity_from_group(&auth.entity, GroupId(id), &entity)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

async fn get_settings(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Json<Settings> {
    Json(state.drive.settings())
}

async fn put_settings(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(settings): Json<Settings>,
) -> StatusCode {
    match state.drive.set_settings(&auth.entity, settings).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => error_status(&err),
    }
}

use axum::response::sse::{self, Sse};
use futures::{Stream, StreamExt};
use std::convert::Infallible;

/// Notification stream, filtered so a viewer only sees events for files
/// they may read. Group, settings and system events pass through.
async fn event_stream(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Sse<impl Stream<Item = Result<sse::Event, Infallible>>> {
    let rx = state.notifications.subscribe();
    let drive = state.drive.clone();
    let viewer = auth.entity.clone();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(move |res| {
        let drive = drive.clone();
        let viewer = viewer.clone();
        async move {
            let note = res.ok()?;
            if let Some(id) = note.file_id() {
                let allowed = drive
                    .ledger()
                    .has_read_access(id, &viewer)
                    .await
                    .unwrap_or(false);
                if !allowed {
                    return None;
                }
            }
            let data = serde_json::to_string(&note).ok()?;
            Some(Ok(sse::Event::default().data(data)))
        }
    });
    Sse::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{self, Body},
        http::Request,
    };
    use drive_hub_core::drive::memory_selector;
    use drive_hub_core::encryption::AesGcmEncryption;
    use drive_hub_core::ledger::memory::MemoryLedger;
    use drive_hub_core::ledger::Ledger;
    use drive_hub_core::sync::{SyncOptions, Synchronizer};
    use serde_json::json;
    use std::time::Duration;
    use tower::util::ServiceExt;

    const MANAGER: &str = "root";

    async fn test_app() -> (Router, Synchronizer) {
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new(MANAGER));
        let sync = Synchronizer::start(
            ledger.clone(),
            SyncOptions {
                debounce: Duration::from_millis(10),
                shutdown_grace: Duration::from_secs(1),
            },
        )
        .await
        .unwrap();
        let drive = Arc::new(
            Drive::new(
                ledger,
                sync.cache(),
                sync.local_events(),
                Arc::new(AesGcmEncryption::new(&[9u8; 32]).unwrap()),
                memory_selector(),
            )
            .await
            .unwrap(),
        );
        let app = router(drive, sync.notifications(), None);
        (app, sync)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    fn post_json(uri: &str, user: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("X-Entity-Id", user)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn put_json(uri: &str, user: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header("X-Entity-Id", user)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_as(uri: &str, user: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("X-Entity-Id", user)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_file(app: &Router, user: &str, name: &str, content: &[u8], public: bool) -> u64 {
        let resp = app
            .clone()
            .oneshot(post_json(
                "/files",
                user,
                json!({
                    "name": name,
                    "content": BASE64.encode(content),
                    "is_public": public
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        json_body(resp).await["id"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn requests_without_identity_are_rejected() {
        let (app, _sync) = test_app().await;
        let req = Request::builder().uri("/files/0").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn file_crud_round_trip() {
        let (app, _sync) = test_app().await;
        let id = create_file(&app, MANAGER, "notes.txt", b"hello", false).await;

        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}"), MANAGER))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = json_body(resp).await;
        assert_eq!(v["name"], "notes.txt");
        assert_eq!(v["file_size"], 5);
        assert_eq!(v["is_public"], false);

        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}/content"), MANAGER))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello");

        // Rename via PATCH.
        let req = Request::builder()
            .method("PATCH")
            .uri(format!("/files/{id}"))
            .header("X-Entity-Id", MANAGER)
            .header("content-type", "application/json")
            .body(Body::from(json!({"name": "renamed.txt"}).to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}"), MANAGER))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["name"], "renamed.txt");

        // Replace content with a raw body.
        let req = Request::builder()
            .method("PUT")
            .uri(format!("/files/{id}/content"))
            .header("X-Entity-Id", MANAGER)
            .body(Body::from(&b"fresh bytes"[..]))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}/content"), MANAGER))
            .await
            .unwrap();
        let bytes = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"fresh bytes");

        // Soft delete, restore, then delete for good.
        let req = Request::builder()
            .method("DELETE")
            .uri(format!("/files/{id}"))
            .header("X-Entity-Id", MANAGER)
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            app.clone().oneshot(req).await.unwrap().status(),
            StatusCode::NO_CONTENT
        );
        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}"), MANAGER))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["is_deleted"], true);

        let req = Request::builder()
            .method("POST")
            .uri(format!("/files/{id}/restore"))
            .header("X-Entity-Id", MANAGER)
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            app.clone().oneshot(req).await.unwrap().status(),
            StatusCode::NO_CONTENT
        );

        let req = Request::builder()
            .method("DELETE")
            .uri(format!("/files/{id}?permanent=true"))
            .header("X-Entity-Id", MANAGER)
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            app.clone().oneshot(req).await.unwrap().status(),
            StatusCode::NO_CONTENT
        );
        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}"), MANAGER))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn private_content_is_forbidden_to_strangers() {
        let (app, _sync) = test_app().await;
        let id = create_file(&app, MANAGER, "secret.txt", b"hush", false).await;

        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}/content"), "mallory"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}"), "mallory"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        // A read grant opens both.
        let resp = app
            .clone()
            .oneshot(put_json(
                &format!("/files/{id}/permissions/entities/mallory"),
                MANAGER,
                json!({"read": true}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}/content"), "mallory"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hush");

        // But not writing.
        let req = Request::builder()
            .method("PUT")
            .uri(format!("/files/{id}/content"))
            .header("X-Entity-Id", "mallory")
            .body(Body::from(&b"overwrite"[..]))
            .unwrap();
        assert_eq!(
            app.clone().oneshot(req).await.unwrap().status(),
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn folder_listing_is_filtered_per_viewer() {
        let (app, _sync) = test_app().await;
        let resp = app
            .clone()
            .oneshot(post_json("/folders", MANAGER, json!({"name": "docs"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let folder = json_body(resp).await["id"].as_u64().unwrap();

        let resp = app
            .clone()
            .oneshot(post_json(
                "/files",
                MANAGER,
                json!({
                    "parent": folder,
                    "name": "open.txt",
                    "content": BASE64.encode(b"open"),
                    "is_public": true
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app
            .clone()
            .oneshot(post_json(
                "/files",
                MANAGER,
                json!({
                    "parent": folder,
                    "name": "closed.txt",
                    "content": BASE64.encode(b"closed"),
                    "is_public": false
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        settle().await;

        let resp = app
            .clone()
            .oneshot(get_as(&format!("/folders/{folder}"), MANAGER))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["children"].as_array().unwrap().len(), 2);

        let resp = app
            .clone()
            .oneshot(get_as(&format!("/folders/{folder}"), "bob"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = json_body(resp).await;
        let children = v["children"].as_array().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0]["name"], "open.txt");

        // Path endpoint resolves through the cache.
        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{folder}/path"), MANAGER))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await, json!([0, folder]));
    }

    #[tokio::test]
    async fn permission_batch_flips_visibility() {
        let (app, _sync) = test_app().await;
        let id = create_file(&app, MANAGER, "memo.txt", b"memo", false).await;

        let resp = app
            .clone()
            .oneshot(put_json(
                &format!("/files/{id}/permissions"),
                MANAGER,
                json!({
                    "is_public": true,
                    "entities": [{"entity": "bob", "read": true, "write": true}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}/permissions"), MANAGER))
            .await
            .unwrap();
        let v = json_body(resp).await;
        assert_eq!(v["is_public"], true);
        assert_eq!(v["entity_grants"][0]["entity"], "bob");
        assert_eq!(v["entity_grants"][0]["write"], true);

        // Anyone reads now.
        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}/content"), "anyone"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"memo");
    }

    #[tokio::test]
    async fn group_access_flows_through_membership() {
        let (app, _sync) = test_app().await;
        let id = create_file(&app, MANAGER, "team.txt", b"team data", false).await;

        // Group lifecycle is manager-gated.
        let resp = app
            .clone()
            .oneshot(post_json("/groups", "bob", json!({"name": "rogues"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app
            .clone()
            .oneshot(post_json("/groups", MANAGER, json!({"name": "team"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let group = json_body(resp).await["id"].as_u64().unwrap();

        let req = Request::builder()
            .method("PUT")
            .uri(format!("/groups/{group}/members/bob"))
            .header("X-Entity-Id", MANAGER)
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            app.clone().oneshot(req).await.unwrap().status(),
            StatusCode::NO_CONTENT
        );

        let resp = app
            .clone()
            .oneshot(put_json(
                &format!("/files/{id}/permissions/groups/{group}"),
                MANAGER,
                json!({"read": true}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}/content"), "bob"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(get_as(&format!("/groups/{group}"), MANAGER))
            .await
            .unwrap();
        let v = json_body(resp).await;
        assert_eq!(v["members"], json!(["bob"]));

        // Deleting the group closes the door.
        let req = Request::builder()
            .method("DELETE")
            .uri(format!("/groups/{group}"))
            .header("X-Entity-Id", MANAGER)
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            app.clone().oneshot(req).await.unwrap().status(),
            StatusCode::NO_CONTENT
        );
        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}/content"), "bob"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let resp = app
            .clone()
            .oneshot(get_as(&format!("/groups/{group}"), MANAGER))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn purge_is_manager_only() {
        let (app, _sync) = test_app().await;
        let id = create_file(&app, "bob", "mine.txt", b"data", false).await;

        let resp = app
            .clone()
            .oneshot(post_json("/trash/purge", "bob", json!({"ids": [id]})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app
            .clone()
            .oneshot(post_json("/trash/purge", MANAGER, json!({"ids": [id]})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = app
            .clone()
            .oneshot(get_as(&format!("/files/{id}"), "bob"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn settings_require_the_manager_role() {
        let (app, _sync) = test_app().await;
        let resp = app
            .clone()
            .oneshot(get_as("/settings", "bob"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["backend"], "memory");

        let resp = app
            .clone()
            .oneshot(put_json(
                "/settings",
                "bob",
                json!({"backend": "s3", "s3_bucket": "b"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app
            .clone()
            .oneshot(put_json(
                "/settings",
                MANAGER,
                json!({"backend": "s3", "s3_bucket": "content"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = app
            .clone()
            .oneshot(get_as("/settings", MANAGER))
            .await
            .unwrap();
        let v = json_body(resp).await;
        assert_eq!(v["backend"], "s3");
        assert_eq!(v["s3_bucket"], "content");
    }
}
