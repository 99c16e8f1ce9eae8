use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::credential::Credential;
use crate::error::{Result, ScreeningError};
use crate::selection::Selection;

/// Free-text guidance returned for a submitted selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recommendation(pub String);

impl Recommendation {
    pub fn text(&self) -> &str {
        &self.0
    }
}

/// Backend receiving the selected case ids.
#[async_trait]
pub trait RecommendationService: Send + Sync {
    async fn submit_selection(
        &self,
        credential: &Credential,
        selected_ids: &[String],
    ) -> Result<Option<Recommendation>>;
}

/// Sends a selection and returns the recommendation, if any. The selection
/// itself is only borrowed, so a failed attempt can be retried unchanged.
#[derive(Clone)]
pub struct RecommendationSubmitter {
    service: Arc<dyn RecommendationService>,
}

impl RecommendationSubmitter {
    pub fn new(service: Arc<dyn RecommendationService>) -> Self {
        Self { service }
    }

    pub async fn submit(
        &self,
        credential: Option<&Credential>,
        selection: &Selection,
    ) -> Result<Option<Recommendation>> {
        let credential = credential.ok_or(ScreeningError::Unauthenticated)?;
        if selection.is_empty() {
            return Err(ScreeningError::EmptySelection);
        }

        info!(
            subject = %credential.subject_id(),
            selected = selection.len(),
            "Submitting similar case selection"
        );

        let recommendation = self
            .service
            .submit_selection(credential, selection.ids())
            .await?
            .filter(|r| !r.text().trim().is_empty());

        info!(
            has_recommendation = recommendation.is_some(),
            "Selection accepted"
        );
        Ok(recommendation)
    }
}
