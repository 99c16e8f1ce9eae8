use screening_flow::SessionSnapshot;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialsRequest {
    pub national_id: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub value: bool,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub national_id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<Uuid>,
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,
}

impl SessionResponse {
    pub fn new(session_id: impl Into<String>, snapshot: SessionSnapshot) -> Self {
        Self {
            session_id: session_id.into(),
            record_id: None,
            snapshot,
        }
    }
}
