//! Session workflow for guided skin-lesion self-screening: sign in, answer
//! the risk questionnaire, upload a photo for scoring, pick up to three
//! similar reference cases and receive a recommendation.
//!
//! [`WorkflowController`] drives one session. External services sit behind
//! the [`AuthApi`], [`QuestionnaireStore`], [`ScoringService`] and
//! [`RecommendationService`] traits; [`HttpBackend`] and
//! [`PostgresQuestionnaireStore`] are the production adapters.

pub mod analysis;
pub mod auth;
pub mod config;
pub mod context;
pub mod credential;
pub mod error;
pub mod http;
pub mod postgres;
pub mod questionnaire;
pub mod recommendation;
pub mod selection;
pub mod storage;
pub mod workflow;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use analysis::{AnalysisClient, AnalysisResult, ImageUpload, ScoringService, SimilarCase};
pub use auth::{AuthApi, LoginOutcome};
pub use config::{ConfigError, ScreeningConfig};
pub use context::{Context, Step, StepGuard};
pub use credential::{
    Credential, CredentialHolder, CredentialStore, FileCredentialStore, InMemoryCredentialStore,
};
pub use error::{Result, ScreeningError};
pub use http::HttpBackend;
pub use postgres::PostgresQuestionnaireStore;
pub use questionnaire::{
    AnswerSet, InMemoryQuestionnaireStore, QuestionDefinition, QuestionnaireEngine,
    QuestionnaireRecord, QuestionnaireStatus, QuestionnaireStore,
};
pub use recommendation::{Recommendation, RecommendationService, RecommendationSubmitter};
pub use selection::{MAX_SELECTION, Selection, SimilaritySelector};
pub use storage::{InMemorySessionStorage, Session, SessionStorage};
pub use workflow::{Action, Collaborators, SessionSnapshot, WorkflowController, WorkflowState};
