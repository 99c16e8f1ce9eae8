use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::credential::Credential;
use crate::error::{Result, ScreeningError};

/// A reference case returned next to the probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarCase {
    #[serde(rename = "image_id")]
    pub case_id: String,
    pub image_url: String,
    #[serde(alias = "dx")]
    pub diagnosis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub localization: Option<String>,
}

/// Outcome of one analysis call. The probability is passed through as-is;
/// interpreting it is the backend's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(alias = "cnn_result")]
    pub probability: f64,
    #[serde(rename = "similar_images", default)]
    pub similar_cases: Vec<SimilarCase>,
}

impl AnalysisResult {
    /// Checks the probability range and drops repeated case ids, keeping the
    /// first occurrence.
    pub fn normalized(mut self) -> Result<Self> {
        if !self.probability.is_finite() || !(0.0..=1.0).contains(&self.probability) {
            return Err(ScreeningError::ServiceError {
                status: 200,
                message: format!(
                    "Analysis returned an out-of-range probability: {}",
                    self.probability
                ),
            });
        }

        let mut seen = HashSet::new();
        let before = self.similar_cases.len();
        self.similar_cases
            .retain(|case| seen.insert(case.case_id.clone()));
        if self.similar_cases.len() != before {
            warn!(
                "Dropped {} similar cases with repeated ids",
                before - self.similar_cases.len()
            );
        }

        Ok(self)
    }

    pub fn case_ids(&self) -> Vec<String> {
        self.similar_cases.iter().map(|c| c.case_id.clone()).collect()
    }

    pub fn has_candidates(&self) -> bool {
        !self.similar_cases.is_empty()
    }
}

/// Uploaded lesion photo.
#[derive(Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Guesses the content type from the file extension.
    pub fn from_file_name(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let file_name = file_name.into();
        let lower = file_name.to_ascii_lowercase();
        let content_type = if lower.ends_with(".png") {
            "image/png"
        } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
            "image/jpeg"
        } else {
            "application/octet-stream"
        };
        Self::new(file_name, content_type, bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for ImageUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageUpload")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Scoring backend.
#[async_trait]
pub trait ScoringService: Send + Sync {
    async fn analyze(&self, credential: &Credential, image: &ImageUpload) -> Result<AnalysisResult>;
}

/// Submits images for scoring. Every call is an independent attempt.
#[derive(Clone)]
pub struct AnalysisClient {
    service: Arc<dyn ScoringService>,
}

impl AnalysisClient {
    pub fn new(service: Arc<dyn ScoringService>) -> Self {
        Self { service }
    }

    pub async fn analyze(
        &self,
        credential: Option<&Credential>,
        image: &ImageUpload,
    ) -> Result<AnalysisResult> {
        let credential = credential.ok_or(ScreeningError::Unauthenticated)?;
        if image.is_empty() {
            return Err(ScreeningError::MissingImage);
        }

        info!(
            subject = %credential.subject_id(),
            file = %image.file_name,
            bytes = image.bytes.len(),
            "Submitting image for analysis"
        );

        let result = self.service.analyze(credential, image).await?.normalized()?;

        info!(
            probability = result.probability,
            similar_cases = result.similar_cases.len(),
            "Analysis complete"
        );
        Ok(result)
    }
}
