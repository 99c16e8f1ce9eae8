use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{Next, from_fn},
    response::{Json, Response},
    routing::{get, post, put},
};
use screening_flow::{
    Collaborators, Context, ImageUpload, InMemoryCredentialStore, ScreeningError, Session,
    SessionStorage, WorkflowController, auth,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::models::{AnswerRequest, CredentialsRequest, RegisterResponse, SessionResponse};

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

type ApiResult<T> = Result<Json<T>, ApiError>;
type ApiError = (StatusCode, Json<Value>);

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "not_found",
            "message": message,
            "session_id": id
        })),
    )
}

fn bad_request_error(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "bad_request", "message": message })),
    )
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "internal",
            "message": message,
            "details": details
        })),
    )
}

/// Maps a workflow error onto a status code and `{error, message}` body.
pub fn workflow_error(e: &ScreeningError) -> ApiError {
    let status = match e {
        ScreeningError::Unauthenticated => StatusCode::UNAUTHORIZED,
        ScreeningError::SourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ScreeningError::IncompleteAnswers { .. }
        | ScreeningError::UnknownQuestion(_)
        | ScreeningError::SubmissionRejected(_)
        | ScreeningError::EmptySelection
        | ScreeningError::MissingImage
        | ScreeningError::InvalidRegistration(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ScreeningError::NoActiveResult
        | ScreeningError::InvalidTransition { .. }
        | ScreeningError::StepInProgress(_)
        | ScreeningError::Cancelled => StatusCode::CONFLICT,
        // Client errors from upstream keep their status; anything else is a gateway failure.
        ScreeningError::ServiceError { status, .. } => StatusCode::from_u16(*status)
            .ok()
            .filter(|s| s.is_client_error())
            .unwrap_or(StatusCode::BAD_GATEWAY),
        ScreeningError::TransportError(_) => StatusCode::BAD_GATEWAY,
        ScreeningError::CredentialStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut body = json!({
        "error": e.kind(),
        "message": e.to_string(),
    });
    if let ScreeningError::IncompleteAnswers { missing } = e {
        body["missing"] = json!(missing);
    }
    (status, Json(body))
}

fn log_failure(action: &str, session_id: &str, e: &ScreeningError) {
    if e.is_local() {
        info!(session_id = %session_id, error = %e, "{} refused", action);
    } else {
        warn!(session_id = %session_id, error = %e, "{} failed", action);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub session_storage: Arc<dyn SessionStorage>,
    pub collaborators: Collaborators,
}

impl AppState {
    /// A controller with its own in-memory credential slot.
    fn new_controller(&self) -> WorkflowController {
        WorkflowController::new(
            Context::new(Arc::new(InMemoryCredentialStore::new())),
            self.collaborators.clone(),
        )
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/auth/register", post(register))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/questionnaire", post(load_questionnaire))
        .route("/sessions/{id}/answers/{key}", put(answer_question))
        .route(
            "/sessions/{id}/questionnaire/submit",
            post(submit_questionnaire),
        )
        .route(
            "/sessions/{id}/analysis",
            post(analyze_image).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/sessions/{id}/selection/submit", post(submit_selection))
        .route("/sessions/{id}/selection/cases/{case_id}", post(toggle_case))
        .route(
            "/sessions/{id}/recommendation/dismiss",
            post(dismiss_recommendation),
        )
        .route("/sessions/{id}/restart", post(restart))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(correlation_id_middleware))
        .with_state(app_state)
}

/// Tags each request with an `x-correlation-id` and runs it inside a span
/// carrying the same id.
async fn correlation_id_middleware(mut request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let header = HeaderValue::from_str(&correlation_id).ok();
    if let Some(value) = &header {
        request
            .headers_mut()
            .insert("x-correlation-id", value.clone());
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    let mut response = next.run(request).instrument(span).await;
    if let Some(value) = header {
        response.headers_mut().insert("x-correlation-id", value);
    }
    response
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Lesion Screening Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Guided skin-lesion self-screening sessions",
        "endpoints": {
            "POST /auth/register": "Register a new account",
            "POST /sessions": "Sign in and start a screening session",
            "GET /sessions/{id}": "Current session state",
            "DELETE /sessions/{id}": "Log out",
            "POST /sessions/{id}/questionnaire": "Load questionnaire definitions",
            "PUT /sessions/{id}/answers/{key}": "Answer one question",
            "POST /sessions/{id}/questionnaire/submit": "Submit the questionnaire",
            "POST /sessions/{id}/analysis": "Upload a lesion image (multipart field 'file')",
            "POST /sessions/{id}/selection/cases/{case_id}": "Toggle a similar case",
            "POST /sessions/{id}/selection/submit": "Submit the selection",
            "POST /sessions/{id}/recommendation/dismiss": "Close the recommendation",
            "POST /sessions/{id}/restart": "Start another screening",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.session_storage.count().await.unwrap_or(0);
    Json(json!({
        "status": "healthy",
        "sessions": sessions,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<CredentialsRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    auth::validate_registration(&request.national_id, &request.password)
        .map_err(|e| workflow_error(&e))?;

    let message = state
        .collaborators
        .auth
        .register(&request.national_id, &request.password)
        .await
        .map_err(|e| {
            log_failure("Registration", "-", &e);
            workflow_error(&e)
        })?;

    info!(national_id = %request.national_id, "Account registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            national_id: request.national_id,
            message,
        }),
    ))
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CredentialsRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let session = Session::new(state.new_controller());
    session
        .controller
        .sign_in(&request.national_id, &request.password)
        .await
        .map_err(|e| {
            log_failure("Sign in", &session.id, &e);
            workflow_error(&e)
        })?;

    let response = SessionResponse::new(session.id.clone(), session.controller.snapshot());
    state.session_storage.save(session).await.map_err(|e| {
        error!("Failed to store session: {}", e);
        internal_error("Failed to create session", &e.to_string())
    })?;

    info!(session_id = %response.session_id, "Screening session created");
    Ok((StatusCode::CREATED, Json(response)))
}

async fn load_session(state: &AppState, id: &str) -> Result<Session, ApiError> {
    match state.session_storage.get(id).await {
        Ok(Some(session)) => Ok(session),
        Ok(None) => Err(not_found_error("Session not found", id)),
        Err(e) => {
            error!("Failed to load session {}: {}", id, e);
            Err(internal_error("Failed to load session", &e.to_string()))
        }
    }
}

fn snapshot(session: &Session) -> Json<SessionResponse> {
    Json(SessionResponse::new(
        session.id.clone(),
        session.controller.snapshot(),
    ))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionResponse> {
    let session = load_session(&state, &id).await?;
    Ok(snapshot(&session))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session = load_session(&state, &id).await?;
    if let Err(e) = session.controller.logout().await {
        warn!(session_id = %id, error = %e, "Credential cleanup failed during logout");
    }
    state.session_storage.delete(&id).await.map_err(|e| {
        error!("Failed to delete session {}: {}", id, e);
        internal_error("Failed to delete session", &e.to_string())
    })?;

    info!(session_id = %id, "Session logged out");
    Ok(StatusCode::NO_CONTENT)
}

async fn load_questionnaire(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionResponse> {
    let session = load_session(&state, &id).await?;
    session.controller.load_questionnaire().await.map_err(|e| {
        log_failure("Questionnaire load", &id, &e);
        workflow_error(&e)
    })?;
    Ok(snapshot(&session))
}

async fn answer_question(
    State(state): State<AppState>,
    Path((id, key)): Path<(String, String)>,
    Json(request): Json<AnswerRequest>,
) -> ApiResult<SessionResponse> {
    let session = load_session(&state, &id).await?;
    session
        .controller
        .answer(&key, request.value)
        .map_err(|e| workflow_error(&e))?;
    Ok(snapshot(&session))
}

async fn submit_questionnaire(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionResponse> {
    let session = load_session(&state, &id).await?;
    let record = session
        .controller
        .submit_questionnaire()
        .await
        .map_err(|e| {
            log_failure("Questionnaire submission", &id, &e);
            workflow_error(&e)
        })?;

    let mut response = SessionResponse::new(session.id.clone(), session.controller.snapshot());
    response.record_id = Some(record.id);
    Ok(Json(response))
}

async fn read_image(mut multipart: Multipart) -> Result<Option<ImageUpload>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request_error(&format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request_error(&format!("Failed to read upload: {}", e)))?;

        let image = match content_type {
            Some(content_type) => ImageUpload::new(file_name, content_type, bytes.to_vec()),
            None => ImageUpload::from_file_name(file_name, bytes.to_vec()),
        };
        return Ok(Some(image));
    }
    Ok(None)
}

async fn analyze_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> ApiResult<SessionResponse> {
    let session = load_session(&state, &id).await?;
    let image = read_image(multipart)
        .await?
        .ok_or_else(|| workflow_error(&ScreeningError::MissingImage))?;

    session.controller.analyze(image).await.map_err(|e| {
        log_failure("Analysis", &id, &e);
        workflow_error(&e)
    })?;
    Ok(snapshot(&session))
}

async fn toggle_case(
    State(state): State<AppState>,
    Path((id, case_id)): Path<(String, String)>,
) -> ApiResult<SessionResponse> {
    let session = load_session(&state, &id).await?;
    session
        .controller
        .toggle_case(&case_id)
        .map_err(|e| workflow_error(&e))?;
    Ok(snapshot(&session))
}

async fn submit_selection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionResponse> {
    let session = load_session(&state, &id).await?;
    session.controller.submit_selection().await.map_err(|e| {
        log_failure("Selection submission", &id, &e);
        workflow_error(&e)
    })?;
    Ok(snapshot(&session))
}

async fn dismiss_recommendation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionResponse> {
    let session = load_session(&state, &id).await?;
    session
        .controller
        .dismiss_recommendation()
        .map_err(|e| workflow_error(&e))?;
    Ok(snapshot(&session))
}

async fn restart(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionResponse> {
    let session = load_session(&state, &id).await?;
    session.controller.restart().map_err(|e| workflow_error(&e))?;
    Ok(snapshot(&session))
}
