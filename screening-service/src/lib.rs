pub mod models;
pub mod service;

pub use service::{AppState, build_router, workflow_error};

use screening_flow::{
    Collaborators, HttpBackend, InMemoryQuestionnaireStore, InMemorySessionStorage,
    PostgresQuestionnaireStore, QuestionnaireStore, ScreeningConfig,
};
use std::sync::Arc;
use tracing::{error, info};

/// Wires the production collaborators from `config`.
pub async fn create_app_state(config: &ScreeningConfig) -> anyhow::Result<AppState> {
    let backend = Arc::new(HttpBackend::new(&config.api_url, config.request_timeout)?);
    info!(api_url = %config.api_url, "Using screening backend");

    let questionnaire: Arc<dyn QuestionnaireStore> = match &config.database_url {
        Some(database_url) => {
            match PostgresQuestionnaireStore::connect(
                database_url,
                &config.question_table,
                &config.questionnaire_table,
            )
            .await
            {
                Ok(store) => {
                    info!("Using PostgreSQL questionnaire store");
                    Arc::new(store)
                }
                Err(e) => {
                    error!(
                        "Failed to connect to PostgreSQL: {}. Falling back to in-memory questionnaire store.",
                        e
                    );
                    Arc::new(InMemoryQuestionnaireStore::with_abcde_questions())
                }
            }
        }
        None => {
            info!("Using in-memory questionnaire store (set DATABASE_URL to use PostgreSQL)");
            Arc::new(InMemoryQuestionnaireStore::with_abcde_questions())
        }
    };

    Ok(AppState {
        session_storage: Arc::new(InMemorySessionStorage::new()),
        collaborators: Collaborators::with_backend(backend, questionnaire),
    })
}
