//! reqwest adapter for the auth, scoring and recommendation endpoints.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use crate::analysis::{AnalysisResult, ImageUpload, ScoringService};
use crate::auth::{AuthApi, LoginOutcome};
use crate::credential::Credential;
use crate::error::{Result, ScreeningError};
use crate::recommendation::{Recommendation, RecommendationService};

const USER_AGENT: &str = concat!("dermascreen/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: Option<String>,
    national_id: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SelectionResponse {
    recommendation: Option<String>,
}

/// Client for the screening backend.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ScreeningError::TransportError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json(
        &self,
        path: &str,
        body: &Value,
        credential: Option<&Credential>,
    ) -> Result<Response> {
        let mut request = self.client.post(self.endpoint(path)).json(body);
        if let Some(credential) = credential {
            request = request.bearer_auth(credential.access_token());
        }
        debug!(path, "POST");
        request.send().await.map_err(transport_error)
    }
}

fn transport_error(e: reqwest::Error) -> ScreeningError {
    if e.is_timeout() {
        ScreeningError::TransportError("request timed out".to_string())
    } else if e.is_connect() {
        ScreeningError::TransportError(format!("could not connect: {}", e))
    } else {
        ScreeningError::TransportError(e.to_string())
    }
}

/// Pulls a readable message out of an error body, preferring `detail`.
fn error_detail(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let detail = match value.get("detail") {
        Some(Value::String(s)) => Some(s.clone()),
        // Validation failures carry a list of {loc, msg} entries.
        Some(Value::Array(items)) => items
            .first()
            .and_then(|item| item.get("msg"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };
    detail
        .or_else(|| {
            value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .filter(|s| !s.trim().is_empty())
}

/// Decodes a successful response or turns a failed one into `ServiceError`,
/// using `fallback` when the server gave no detail.
async fn read_json<T: DeserializeOwned>(response: Response, fallback: &str) -> Result<T> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;

    if !status.is_success() {
        let message = error_detail(&body).unwrap_or_else(|| fallback.to_string());
        warn!(status = status.as_u16(), %message, "Backend returned an error");
        return Err(ScreeningError::ServiceError {
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_str(&body).map_err(|e| {
        warn!("Undecodable response body: {}", e);
        ScreeningError::ServiceError {
            status: status.as_u16(),
            message: format!("{fallback}: unexpected response from server"),
        }
    })
}

#[async_trait]
impl AuthApi for HttpBackend {
    async fn login(&self, subject_id: &str, password: &str) -> Result<LoginOutcome> {
        let body = json!({ "national_id": subject_id, "password": password });
        let response = self.post_json("/api/login", &body, None).await?;
        let parsed: LoginResponse = read_json(response, "Login failed").await?;

        let credential = match (parsed.access_token, parsed.national_id) {
            (Some(token), Some(subject)) => Credential::new(token, subject),
            _ => None,
        };
        Ok(match credential {
            Some(credential) => LoginOutcome::Authenticated(credential),
            None => LoginOutcome::Acknowledged(parsed.message.unwrap_or_default()),
        })
    }

    async fn register(&self, subject_id: &str, password: &str) -> Result<String> {
        let body = json!({ "national_id": subject_id, "password": password });
        let response = self.post_json("/api/register", &body, None).await?;
        let parsed: MessageResponse = read_json(response, "Registration failed").await?;
        Ok(parsed
            .message
            .unwrap_or_else(|| "Registration successful".to_string()))
    }
}

#[async_trait]
impl ScoringService for HttpBackend {
    async fn analyze(&self, credential: &Credential, image: &ImageUpload) -> Result<AnalysisResult> {
        let part = Part::bytes(image.bytes.clone())
            .file_name(image.file_name.clone())
            .mime_str(&image.content_type)
            .map_err(|e| {
                ScreeningError::TransportError(format!(
                    "invalid content type '{}': {}",
                    image.content_type, e
                ))
            })?;
        let form = Form::new().part("file", part);

        debug!(file = %image.file_name, "POST /api/analyze");
        let response = self
            .client
            .post(self.endpoint("/api/analyze"))
            .bearer_auth(credential.access_token())
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        read_json(response, "Analysis failed").await
    }
}

#[async_trait]
impl RecommendationService for HttpBackend {
    async fn submit_selection(
        &self,
        credential: &Credential,
        selected_ids: &[String],
    ) -> Result<Option<Recommendation>> {
        let body = json!({ "selected_ids": selected_ids });
        let response = self
            .post_json("/api/save_similar_moles", &body, Some(credential))
            .await?;
        let parsed: SelectionResponse = read_json(response, "Failed to submit selection").await?;
        Ok(parsed.recommendation.map(Recommendation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Multipart, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Received {
        uploads: Arc<Mutex<Vec<(String, Option<String>, usize)>>>,
        selections: Arc<Mutex<Vec<Value>>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            == Some("Bearer tok-123")
    }

    async fn login(Json(body): Json<Value>) -> impl IntoResponse {
        match body["password"].as_str() {
            Some("secret") => (
                StatusCode::OK,
                Json(json!({
                    "access_token": "tok-123",
                    "token_type": "bearer",
                    "national_id": body["national_id"],
                })),
            ),
            Some("legacy") => (
                StatusCode::OK,
                Json(json!({ "national_id": body["national_id"], "message": "Login successful" })),
            ),
            _ => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "detail": "Invalid national ID or password" })),
            ),
        }
    }

    async fn register(Json(body): Json<Value>) -> impl IntoResponse {
        if body["national_id"] == "taken" {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": "User with this national ID already exists" })),
            );
        }
        (
            StatusCode::OK,
            Json(json!({ "national_id": body["national_id"], "message": "User registered successfully" })),
        )
    }

    async fn analyze(
        State(received): State<Received>,
        headers: HeaderMap,
        mut multipart: Multipart,
    ) -> impl IntoResponse {
        if !authorized(&headers) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "detail": "Could not validate credentials" })),
            );
        }
        while let Ok(Some(field)) = multipart.next_field().await {
            if field.name() == Some("file") {
                let name = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let len = field.bytes().await.map(|b| b.len()).unwrap_or(0);
                received.uploads.lock().unwrap().push((name, content_type, len));
            }
        }
        (
            StatusCode::OK,
            Json(json!({
                "cnn_result": 0.42,
                "similar_images": [
                    { "image_id": "ISIC_1", "image_url": "https://img/1.jpg", "diagnosis": "nv", "age": 40.0, "sex": "male", "localization": "back" },
                    { "image_id": "ISIC_2", "image_url": "https://img/2.jpg", "dx": "mel" },
                    { "image_id": "ISIC_1", "image_url": "https://img/1.jpg", "diagnosis": "nv" }
                ]
            })),
        )
    }

    async fn save_selection(
        State(received): State<Received>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        if !authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, Json(json!({ "detail": "Not authenticated" })));
        }
        received.selections.lock().unwrap().push(body.clone());
        let recommendation = if body["selected_ids"].as_array().map(Vec::len) == Some(1) {
            Value::Null
        } else {
            json!("Please consult a dermatologist.")
        };
        (StatusCode::OK, Json(json!({ "recommendation": recommendation })))
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn backend() -> (HttpBackend, Received) {
        let received = Received::default();
        let app = Router::new()
            .route("/api/login", post(login))
            .route("/api/register", post(register))
            .route("/api/analyze", post(analyze))
            .route("/api/save_similar_moles", post(save_selection))
            .with_state(received.clone());
        let url = serve(app).await;
        (HttpBackend::new(url, DEFAULT_TIMEOUT).unwrap(), received)
    }

    fn credential() -> Credential {
        Credential::new("tok-123", "123456789").unwrap()
    }

    #[tokio::test]
    async fn login_returns_credential_or_passes_detail_through() {
        let (backend, _) = backend().await;

        let outcome = backend.login("123456789", "secret").await.unwrap();
        assert_eq!(outcome, LoginOutcome::Authenticated(credential()));

        let legacy = backend.login("123456789", "legacy").await.unwrap();
        assert_eq!(
            legacy,
            LoginOutcome::Acknowledged("Login successful".to_string())
        );

        let err = backend.login("123456789", "nope").await.unwrap_err();
        assert_eq!(
            err,
            ScreeningError::ServiceError {
                status: 401,
                message: "Invalid national ID or password".to_string()
            }
        );
    }

    #[tokio::test]
    async fn register_surfaces_server_messages() {
        let (backend, _) = backend().await;
        assert_eq!(
            backend.register("123", "secret").await.unwrap(),
            "User registered successfully"
        );
        let err = backend.register("taken", "secret").await.unwrap_err();
        assert_eq!(err.to_string(), "User with this national ID already exists");
    }

    #[tokio::test]
    async fn analyze_uploads_multipart_file_with_bearer() {
        let (backend, received) = backend().await;
        let image = ImageUpload::from_file_name("mole.png", vec![7u8; 64]);

        let result = backend.analyze(&credential(), &image).await.unwrap();
        assert_eq!(result.probability, 0.42);
        assert_eq!(result.similar_cases.len(), 3);
        assert_eq!(result.similar_cases[1].diagnosis, "mel");

        let uploads = received.uploads.lock().unwrap().clone();
        assert_eq!(
            uploads,
            vec![("mole.png".to_string(), Some("image/png".to_string()), 64)]
        );

        let stranger = Credential::new("other", "1").unwrap();
        let err = backend.analyze(&stranger, &image).await.unwrap_err();
        assert_eq!(err.kind(), "service_error");
        assert_eq!(err.to_string(), "Could not validate credentials");
    }

    #[tokio::test]
    async fn selection_round_trip_with_optional_recommendation() {
        let (backend, received) = backend().await;

        let ids = vec!["ISIC_1".to_string(), "ISIC_2".to_string()];
        let recommendation = backend.submit_selection(&credential(), &ids).await.unwrap();
        assert_eq!(
            recommendation,
            Some(Recommendation("Please consult a dermatologist.".into()))
        );

        let none = backend
            .submit_selection(&credential(), &ids[..1])
            .await
            .unwrap();
        assert_eq!(none, None);

        let bodies = received.selections.lock().unwrap().clone();
        assert_eq!(bodies[0], json!({ "selected_ids": ["ISIC_1", "ISIC_2"] }));
    }

    #[tokio::test]
    async fn errors_without_detail_use_a_generic_message() {
        let app = Router::new()
            .route(
                "/api/analyze",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route("/api/save_similar_moles", post(|| async { "not json" }));
        let backend = HttpBackend::new(serve(app).await, DEFAULT_TIMEOUT).unwrap();
        let image = ImageUpload::from_file_name("mole.jpg", vec![1]);

        assert_eq!(
            backend.analyze(&credential(), &image).await.unwrap_err(),
            ScreeningError::ServiceError {
                status: 500,
                message: "Analysis failed".to_string()
            }
        );

        let err = backend
            .submit_selection(&credential(), &["a".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ScreeningError::ServiceError { status: 200, .. }));
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_transport_error() {
        let app = Router::new().route(
            "/api/analyze",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let backend =
            HttpBackend::new(serve(app).await, Duration::from_millis(100)).unwrap();
        let image = ImageUpload::from_file_name("mole.jpg", vec![1]);

        assert_eq!(
            backend.analyze(&credential(), &image).await.unwrap_err(),
            ScreeningError::TransportError("request timed out".to_string())
        );
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = HttpBackend::new(format!("http://{addr}/"), DEFAULT_TIMEOUT).unwrap();
        assert_eq!(backend.base_url(), format!("http://{addr}"));
        assert!(matches!(
            backend.login("1", "secret").await,
            Err(ScreeningError::TransportError(_))
        ));
    }

    #[test]
    fn detail_extraction_handles_common_shapes() {
        assert_eq!(
            error_detail(r#"{"detail":"Model not loaded"}"#).as_deref(),
            Some("Model not loaded")
        );
        assert_eq!(
            error_detail(r#"{"detail":[{"loc":["body","file"],"msg":"field required"}]}"#)
                .as_deref(),
            Some("field required")
        );
        assert_eq!(error_detail(r#"{"detail":""}"#), None);
        assert_eq!(error_detail("<html>"), None);
    }
}
