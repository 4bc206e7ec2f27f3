#![cfg(not(tarpaulin_include))]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    Json, Router,
    extract::{Multipart, Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::codec::{self, XLSX_CONTENT_TYPE};
use crate::config::KarteConfig;
use crate::error::{KarteError, ParseError};
use crate::grid::{Grid, MemoryGrid};
use crate::record::{Record, RecordId, RecordInfo, Timestamp};
use crate::session::{EditingSession, SessionHandle, SessionStatus};
use crate::store::RecordStore;
use crate::template::merged_regions;

pub struct AppState {
    store: Arc<dyn RecordStore>,
    config: KarteConfig,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>, config: KarteConfig) -> Self {
        AppState {
            store,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, sid: &str) -> Result<SessionHandle, KarteError> {
        self.sessions()
            .get(sid)
            .cloned()
            .ok_or(KarteError::SessionClosed)
    }

    /// Shut every editing session down, running each one's close sequence.
    pub async fn shutdown_sessions(&self) {
        let handles: Vec<SessionHandle> = self.sessions().drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(err) = handle.shutdown().await {
                error!("session {} did not shut down cleanly: {err}", handle.editor_id());
            }
        }
    }
}

#[derive(Serialize)]
struct ApiResponse {
    status: String,
    message: Option<String>,
}

impl ApiResponse {
    fn ok() -> Json<Self> {
        Json(ApiResponse {
            status: "ok".to_string(),
            message: None,
        })
    }
}

impl IntoResponse for KarteError {
    fn into_response(self) -> Response {
        let status = match &self {
            KarteError::NotFound(_) | KarteError::SessionClosed => StatusCode::NOT_FOUND,
            KarteError::InvalidCell(_) => StatusCode::BAD_REQUEST,
            KarteError::Parse(_) => StatusCode::UNPROCESSABLE_ENTITY,
            KarteError::Store(_) => StatusCode::BAD_GATEWAY,
            KarteError::Render(_) | KarteError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ApiResponse {
            status: "error".to_string(),
            message: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordSummary {
    id: RecordId,
    info: RecordInfo,
    last_updated: Timestamp,
    last_updated_label: String,
}

#[derive(Serialize)]
struct CreatedResponse {
    id: RecordId,
}

#[derive(Deserialize)]
struct NewSession {
    editor_name: String,
}

#[derive(Serialize)]
struct SessionCreated {
    session_id: String,
}

#[derive(Deserialize)]
struct CellUpdate {
    cell: String,
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum RowOp {
    Insert,
    Remove,
}

#[derive(Deserialize)]
struct RowUpdate {
    at: usize,
    op: RowOp,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/karte", get(list_records).post(create_record))
        .route("/api/karte/:id", get(get_record).delete(delete_record))
        .route("/api/karte/:id/export", get(export_record))
        .route("/api/import", post(import_workbook))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:sid", get(session_status).delete(close_session))
        .route("/api/sessions/:sid/open/:id", post(session_open))
        .route("/api/sessions/:sid/new", post(session_new))
        .route("/api/sessions/:sid/cell", post(session_cell))
        .route("/api/sessions/:sid/rows", post(session_rows))
        .route("/api/sessions/:sid/save", post(session_save))
        .route("/api/sessions/:sid/import", post(session_import))
        .route("/api/sessions/:sid/export", get(session_export))
        .route("/api/sessions/:sid/alert", delete(session_dismiss_alert))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(
    store: Arc<dyn RecordStore>,
    config: KarteConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let bind = config.server.bind.clone();
    let state = Arc::new(AppState::new(store, config));
    let app = router(state.clone());

    let listener = TcpListener::bind(&bind).await?;
    info!("karte server listening on http://{bind}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {err}");
            }
        })
        .await?;

    info!("shutting down editing sessions");
    state.shutdown_sessions().await;
    Ok(())
}

async fn list_records(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RecordSummary>>, KarteError> {
    let snapshots = state.store.list(state.config.store.list_limit).await?;
    let summaries = snapshots
        .into_iter()
        .map(|snapshot| {
            let record = snapshot.into_record();
            RecordSummary {
                id: record.id,
                info: record.info,
                last_updated: record.last_updated,
                last_updated_label: record.last_updated.to_local_string(),
            }
        })
        .collect();
    Ok(Json(summaries))
}

async fn create_record(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<CreatedResponse>), KarteError> {
    let id = RecordId::generate();
    let record = Record::blank(id.clone());
    state.store.put(&id, record.to_document()?).await?;
    info!("created karte {id} from the template");
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

async fn get_record(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Record>, KarteError> {
    let snapshot = state.store.get(&RecordId::from(id)).await?;
    Ok(Json(snapshot.into_record()))
}

async fn delete_record(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse>, KarteError> {
    state.store.delete(&RecordId::from(id)).await?;
    Ok(ApiResponse::ok())
}

async fn export_record(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, KarteError> {
    let grid = state.store.get(&RecordId::from(id)).await?.into_record().grid;
    let bytes = codec::build_workbook(&grid, &merged_regions(&grid))?;
    Ok(xlsx_response(bytes))
}

async fn import_workbook(multipart: Multipart) -> Result<Json<Grid>, KarteError> {
    let bytes = read_workbook_field(multipart).await?;
    Ok(Json(codec::parse_workbook(&bytes)?))
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewSession>,
) -> impl IntoResponse {
    let handle = EditingSession::spawn(
        state.store.clone(),
        MemoryGrid::new(),
        payload.editor_name,
        state.config.session.clone(),
    );
    let session_id = handle.editor_id().to_string();
    state.sessions().insert(session_id.clone(), handle);
    (StatusCode::CREATED, Json(SessionCreated { session_id }))
}

async fn session_status(
    Path(sid): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionStatus>, KarteError> {
    Ok(Json(state.session(&sid)?.status().await?))
}

async fn close_session(
    Path(sid): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse>, KarteError> {
    let handle = state
        .sessions()
        .remove(&sid)
        .ok_or(KarteError::SessionClosed)?;
    handle.shutdown().await?;
    Ok(ApiResponse::ok())
}

async fn session_open(
    Path((sid, id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionStatus>, KarteError> {
    let session = state.session(&sid)?;
    session.open(RecordId::from(id)).await?;
    Ok(Json(session.status().await?))
}

async fn session_new(
    Path(sid): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionStatus>, KarteError> {
    let session = state.session(&sid)?;
    session.new_record().await?;
    Ok(Json(session.status().await?))
}

async fn session_cell(
    Path(sid): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CellUpdate>,
) -> Result<Json<ApiResponse>, KarteError> {
    state
        .session(&sid)?
        .edit(&payload.cell, payload.value)
        .await?;
    Ok(ApiResponse::ok())
}

async fn session_rows(
    Path(sid): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RowUpdate>,
) -> Result<Json<ApiResponse>, KarteError> {
    let session = state.session(&sid)?;
    match payload.op {
        RowOp::Insert => session.insert_row(payload.at).await?,
        RowOp::Remove => session.remove_row(payload.at).await?,
    }
    Ok(ApiResponse::ok())
}

async fn session_save(
    Path(sid): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<CreatedResponse>, KarteError> {
    let id = state.session(&sid)?.save().await?;
    Ok(Json(CreatedResponse { id }))
}

async fn session_import(
    Path(sid): Path<String>,
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<ApiResponse>, KarteError> {
    let session = state.session(&sid)?;
    let bytes = read_workbook_field(multipart).await?;
    session.import(bytes).await?;
    Ok(ApiResponse::ok())
}

async fn session_export(
    Path(sid): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, KarteError> {
    let bytes = state.session(&sid)?.export().await?;
    Ok(xlsx_response(bytes))
}

async fn session_dismiss_alert(
    Path(sid): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse>, KarteError> {
    state.session(&sid)?.dismiss_alert().await?;
    Ok(ApiResponse::ok())
}

async fn read_workbook_field(mut multipart: Multipart) -> Result<Vec<u8>, KarteError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ParseError::Workbook(e.to_string()))?
    {
        if field.name() == Some("workbook") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ParseError::Workbook(e.to_string()))?;
            return Ok(bytes.to_vec());
        }
    }
    Err(ParseError::Workbook("no `workbook` field in the upload".to_string()).into())
}

fn xlsx_response(bytes: Vec<u8>) -> Response {
    let file_name = codec::export_file_name_today();
    let disposition = format!(
        "attachment; filename=\"karte.xlsx\"; filename*=UTF-8''{}",
        urlencoding::encode(&file_name)
    );
    (
        [
            (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::error::{RenderError, StoreError};
    use crate::store::MemoryStore;

    fn app() -> Router {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new("karte"));
        router(Arc::new(AppState::new(store, KarteConfig::default())))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (KarteError::NotFound(RecordId::from("x")), StatusCode::NOT_FOUND),
            (KarteError::SessionClosed, StatusCode::NOT_FOUND),
            (KarteError::InvalidCell("??".into()), StatusCode::BAD_REQUEST),
            (KarteError::Parse(ParseError::EmptyWorkbook), StatusCode::UNPROCESSABLE_ENTITY),
            (
                KarteError::Store(StoreError::Unavailable("offline".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                KarteError::Render(RenderError::Detached),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let response = app()
            .oneshot(Request::get("/api/karte/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["status"], "error");
    }

    #[tokio::test]
    async fn created_record_shows_up_in_the_list() {
        let app = app();
        let created = app
            .clone()
            .oneshot(Request::post("/api/karte").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let id = json_body(created).await["id"].clone();

        let listed = app
            .oneshot(Request::get("/api/karte").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(listed.status(), StatusCode::OK);
        let listed = json_body(listed).await;
        assert_eq!(listed.as_array().map(Vec::len), Some(1));
        assert_eq!(listed[0]["id"], id);
    }

    #[tokio::test]
    async fn session_rejects_bad_cell_names() {
        let app = app();
        let created = app
            .clone()
            .oneshot(post_json("/api/sessions", json!({ "editor_name": "Aoki" })))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let sid = json_body(created).await["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        let uri = format!("/api/sessions/{sid}/cell");
        let bad = app
            .clone()
            .oneshot(post_json(&uri, json!({ "cell": "??", "value": "1" })))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let good = app
            .oneshot(post_json(&uri, json!({ "cell": "E9", "value": "1000" })))
            .await
            .unwrap();
        assert_eq!(good.status(), StatusCode::OK);
    }
}
