//! Risk questionnaire: definitions fetched from the store, boolean answers
//! collected per key, and the record submitted once every key is answered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, ScreeningError};

/// One question of the risk questionnaire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionDefinition {
    #[serde(rename = "question_key")]
    pub key: String,
    #[serde(rename = "question_text")]
    pub prompt: String,
}

impl QuestionDefinition {
    pub fn new(key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prompt: prompt.into(),
        }
    }
}

/// Answers keyed by question key.
pub type AnswerSet = BTreeMap<String, bool>;

/// A complete questionnaire as handed to the record store. Immutable once
/// built; resubmission produces a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionnaireRecord {
    pub id: Uuid,
    pub subject_id: String,
    pub answers: AnswerSet,
    pub submitted_at: DateTime<Utc>,
}

impl QuestionnaireRecord {
    /// Flat row accepted by the record store:
    /// `{ national_id, <question_key>: bool, ... }`.
    pub fn to_row(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut row = serde_json::Map::new();
        row.insert(
            "national_id".to_string(),
            serde_json::Value::String(self.subject_id.clone()),
        );
        for (key, value) in &self.answers {
            row.insert(key.clone(), serde_json::Value::Bool(*value));
        }
        row
    }
}

/// Read access to question definitions and write access to records.
#[async_trait]
pub trait QuestionnaireStore: Send + Sync {
    /// Ordered question set. Errors map to `SourceUnavailable`.
    async fn fetch_definitions(&self) -> Result<Vec<QuestionDefinition>>;

    /// Accepts or rejects a record. A declined record maps to
    /// `SubmissionRejected`.
    async fn insert_record(&self, record: &QuestionnaireRecord) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionnaireStatus {
    NotLoaded,
    Ready,
    /// The last fetch failed; no questions are offered until a reload succeeds.
    Unavailable,
}

/// Collects answers against the loaded definitions.
#[derive(Debug, Clone)]
pub struct QuestionnaireEngine {
    status: QuestionnaireStatus,
    definitions: Vec<QuestionDefinition>,
    answers: AnswerSet,
}

impl Default for QuestionnaireEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl QuestionnaireEngine {
    pub fn new() -> Self {
        Self {
            status: QuestionnaireStatus::NotLoaded,
            definitions: Vec::new(),
            answers: AnswerSet::new(),
        }
    }

    pub fn status(&self) -> QuestionnaireStatus {
        self.status
    }

    /// Loaded definitions in display order. Empty unless `Ready`.
    pub fn definitions(&self) -> &[QuestionDefinition] {
        &self.definitions
    }

    pub fn answers(&self) -> &AnswerSet {
        &self.answers
    }

    /// Fetches definitions from `store` and installs them.
    pub async fn load_definitions(&mut self, store: &dyn QuestionnaireStore) -> Result<()> {
        let fetched = store.fetch_definitions().await;
        self.install(fetched)
    }

    /// Installs the outcome of a definition fetch. A failure, or a set with
    /// duplicate keys, leaves the engine `Unavailable` with no questions.
    pub(crate) fn install(&mut self, fetched: Result<Vec<QuestionDefinition>>) -> Result<()> {
        self.answers.clear();
        self.definitions.clear();

        let definitions = match fetched.and_then(validate_definitions) {
            Ok(definitions) => definitions,
            Err(e) => {
                warn!("Question definitions unavailable: {}", e);
                self.status = QuestionnaireStatus::Unavailable;
                return Err(match e {
                    ScreeningError::SourceUnavailable(_) => e,
                    other => ScreeningError::SourceUnavailable(other.to_string()),
                });
            }
        };

        info!("Loaded {} question definitions", definitions.len());
        self.definitions = definitions;
        self.status = QuestionnaireStatus::Ready;
        Ok(())
    }

    /// Records the answer for a loaded question key.
    pub fn answer(&mut self, key: &str, value: bool) -> Result<()> {
        if !self.definitions.iter().any(|d| d.key == key) {
            return Err(ScreeningError::UnknownQuestion(key.to_string()));
        }
        self.answers.insert(key.to_string(), value);
        Ok(())
    }

    /// Keys that still lack an answer, in display order.
    pub fn missing(&self) -> Vec<String> {
        self.definitions
            .iter()
            .filter(|d| !self.answers.contains_key(&d.key))
            .map(|d| d.key.clone())
            .collect()
    }

    /// True iff definitions are loaded and every key has an answer.
    pub fn is_complete(&self) -> bool {
        self.status == QuestionnaireStatus::Ready
            && !self.definitions.is_empty()
            && self.missing().is_empty()
    }

    /// Builds the record for `subject_id`, failing with `IncompleteAnswers`
    /// unless every loaded key is answered.
    pub fn record_for(&self, subject_id: &str) -> Result<QuestionnaireRecord> {
        if !self.is_complete() {
            return Err(ScreeningError::IncompleteAnswers {
                missing: self.missing(),
            });
        }

        Ok(QuestionnaireRecord {
            id: Uuid::new_v4(),
            subject_id: subject_id.to_string(),
            answers: self.answers.clone(),
            submitted_at: Utc::now(),
        })
    }

    /// Validates completeness, then hands the record to `store`.
    pub async fn submit(
        &self,
        store: &dyn QuestionnaireStore,
        subject_id: &str,
    ) -> Result<QuestionnaireRecord> {
        let record = self.record_for(subject_id)?;
        store.insert_record(&record).await?;
        info!(record_id = %record.id, subject = %subject_id, "Questionnaire submitted");
        Ok(record)
    }
}

fn validate_definitions(definitions: Vec<QuestionDefinition>) -> Result<Vec<QuestionDefinition>> {
    let mut seen = HashSet::new();
    for definition in &definitions {
        if definition.key.trim().is_empty() {
            return Err(ScreeningError::SourceUnavailable(
                "question definition with empty key".to_string(),
            ));
        }
        if !seen.insert(definition.key.as_str()) {
            return Err(ScreeningError::SourceUnavailable(format!(
                "duplicate question key '{}'",
                definition.key
            )));
        }
    }
    Ok(definitions)
}

/// In-process store holding definitions and accepted records.
pub struct InMemoryQuestionnaireStore {
    definitions: Mutex<Vec<QuestionDefinition>>,
    records: Mutex<Vec<QuestionnaireRecord>>,
    fetch_failure: Mutex<Option<String>>,
    insert_failure: Mutex<Option<String>>,
}

impl InMemoryQuestionnaireStore {
    pub fn new(definitions: Vec<QuestionDefinition>) -> Self {
        Self {
            definitions: Mutex::new(definitions),
            records: Mutex::new(Vec::new()),
            fetch_failure: Mutex::new(None),
            insert_failure: Mutex::new(None),
        }
    }

    /// The five ABCDE self-check questions.
    pub fn with_abcde_questions() -> Self {
        Self::new(vec![
            QuestionDefinition::new(
                "asymmetry",
                "When you look at the lesion, does one half look different from the other half in shape or thickness?",
            ),
            QuestionDefinition::new(
                "border",
                "Have you noticed if the edges of the lesion look ragged, notched, or blurred rather than smooth?",
            ),
            QuestionDefinition::new(
                "color",
                "Do you see more than one color in the lesion, such as brown, black, red, white, or blue?",
            ),
            QuestionDefinition::new(
                "diameter",
                "Would you say it is larger than about 6 millimeters, roughly the size of a pencil eraser?",
            ),
            QuestionDefinition::new(
                "evolution",
                "Has the lesion changed recently in size, shape, color, or caused any new symptoms like itching, bleeding, or crusting?",
            ),
        ])
    }

    /// Makes subsequent fetches fail with `SourceUnavailable(reason)`;
    /// `None` restores normal behaviour.
    pub fn fail_fetches(&self, reason: Option<&str>) {
        if let Ok(mut guard) = self.fetch_failure.lock() {
            *guard = reason.map(str::to_string);
        }
    }

    /// Makes subsequent inserts fail with `SubmissionRejected(reason)`;
    /// `None` restores normal behaviour.
    pub fn reject_inserts(&self, reason: Option<&str>) {
        if let Ok(mut guard) = self.insert_failure.lock() {
            *guard = reason.map(str::to_string);
        }
    }

    pub fn records(&self) -> Vec<QuestionnaireRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl QuestionnaireStore for InMemoryQuestionnaireStore {
    async fn fetch_definitions(&self) -> Result<Vec<QuestionDefinition>> {
        if let Some(reason) = self.fetch_failure.lock().ok().and_then(|g| g.clone()) {
            return Err(ScreeningError::SourceUnavailable(reason));
        }
        Ok(self
            .definitions
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default())
    }

    async fn insert_record(&self, record: &QuestionnaireRecord) -> Result<()> {
        if let Some(reason) = self.insert_failure.lock().ok().and_then(|g| g.clone()) {
            return Err(ScreeningError::SubmissionRejected(reason));
        }
        self.records
            .lock()
            .map_err(|e| ScreeningError::SubmissionRejected(e.to_string()))?
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_questions() -> InMemoryQuestionnaireStore {
        InMemoryQuestionnaireStore::new(vec![
            QuestionDefinition::new("asymmetry", "Is one half different from the other?"),
            QuestionDefinition::new("border", "Are the edges irregular?"),
        ])
    }

    #[tokio::test]
    async fn partial_answers_are_rejected_without_touching_the_store() {
        let store = two_questions();
        let mut engine = QuestionnaireEngine::new();
        engine.load_definitions(&store).await.unwrap();

        engine.answer("asymmetry", true).unwrap();
        assert!(!engine.is_complete());

        let err = engine.submit(&store, "X").await.unwrap_err();
        assert_eq!(
            err,
            ScreeningError::IncompleteAnswers {
                missing: vec!["border".to_string()]
            }
        );
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn complete_answers_produce_a_flat_record() {
        let store = two_questions();
        let mut engine = QuestionnaireEngine::new();
        engine.load_definitions(&store).await.unwrap();

        engine.answer("asymmetry", true).unwrap();
        engine.answer("border", false).unwrap();
        assert!(engine.is_complete());

        let record = engine.submit(&store, "X").await.unwrap();
        assert_eq!(record.subject_id, "X");

        let row = record.to_row();
        assert_eq!(row["national_id"], "X");
        assert_eq!(row["asymmetry"], true);
        assert_eq!(row["border"], false);
        assert_eq!(row.len(), 3);

        assert_eq!(store.records(), vec![record]);
    }

    #[tokio::test]
    async fn resubmission_creates_a_new_record() {
        let store = two_questions();
        let mut engine = QuestionnaireEngine::new();
        engine.load_definitions(&store).await.unwrap();
        engine.answer("asymmetry", false).unwrap();
        engine.answer("border", false).unwrap();

        let first = engine.submit(&store, "X").await.unwrap();
        let second = engine.submit(&store, "X").await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(store.records().len(), 2);
    }

    #[tokio::test]
    async fn unknown_keys_are_refused() {
        let store = two_questions();
        let mut engine = QuestionnaireEngine::new();
        engine.load_definitions(&store).await.unwrap();

        assert_eq!(
            engine.answer("diameter", true),
            Err(ScreeningError::UnknownQuestion("diameter".to_string()))
        );
        assert!(engine.answers().is_empty());
    }

    #[tokio::test]
    async fn answering_again_overwrites() {
        let store = two_questions();
        let mut engine = QuestionnaireEngine::new();
        engine.load_definitions(&store).await.unwrap();

        engine.answer("border", true).unwrap();
        engine.answer("border", false).unwrap();
        assert_eq!(engine.answers().get("border"), Some(&false));
        assert_eq!(engine.answers().len(), 1);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_no_questions() {
        let store = two_questions();
        let mut engine = QuestionnaireEngine::new();
        engine.load_definitions(&store).await.unwrap();
        engine.answer("border", true).unwrap();

        store.fail_fetches(Some("connection refused"));
        let err = engine.load_definitions(&store).await.unwrap_err();
        assert_eq!(
            err,
            ScreeningError::SourceUnavailable("connection refused".to_string())
        );
        assert_eq!(engine.status(), QuestionnaireStatus::Unavailable);
        assert!(engine.definitions().is_empty());
        assert!(engine.answers().is_empty());
        assert!(!engine.is_complete());
    }

    #[tokio::test]
    async fn duplicate_keys_make_the_source_unusable() {
        let store = InMemoryQuestionnaireStore::new(vec![
            QuestionDefinition::new("color", "a"),
            QuestionDefinition::new("color", "b"),
        ]);
        let mut engine = QuestionnaireEngine::new();
        let err = engine.load_definitions(&store).await.unwrap_err();
        assert!(matches!(err, ScreeningError::SourceUnavailable(_)));
        assert_eq!(engine.status(), QuestionnaireStatus::Unavailable);
    }

    #[tokio::test]
    async fn empty_definition_set_is_never_complete() {
        let store = InMemoryQuestionnaireStore::new(Vec::new());
        let mut engine = QuestionnaireEngine::new();
        engine.load_definitions(&store).await.unwrap();
        assert!(!engine.is_complete());
        assert!(matches!(
            engine.record_for("X"),
            Err(ScreeningError::IncompleteAnswers { .. })
        ));
    }

    #[tokio::test]
    async fn store_rejection_is_surfaced() {
        let store = two_questions();
        store.reject_inserts(Some("duplicate key value violates unique constraint"));
        let mut engine = QuestionnaireEngine::new();
        engine.load_definitions(&store).await.unwrap();
        engine.answer("asymmetry", true).unwrap();
        engine.answer("border", true).unwrap();

        let err = engine.submit(&store, "X").await.unwrap_err();
        assert!(matches!(err, ScreeningError::SubmissionRejected(_)));
        assert!(store.records().is_empty());
    }

    #[test]
    fn definitions_use_store_field_names() {
        let parsed: Vec<QuestionDefinition> = serde_json::from_str(
            r#"[{"question_key":"asymmetry","question_text":"Asymmetric?"}]"#,
        )
        .unwrap();
        assert_eq!(parsed[0], QuestionDefinition::new("asymmetry", "Asymmetric?"));
    }
}
