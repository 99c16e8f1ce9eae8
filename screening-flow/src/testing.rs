//! Scripted collaborators for tests.
//!
//! [`ScriptedBackend`] answers auth, scoring and recommendation calls from
//! queues filled by the test, and counts every call it receives. The gated
//! stores wrap the in-memory stores so a single call can be held in flight.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::analysis::{AnalysisResult, ImageUpload, ScoringService, SimilarCase};
use crate::auth::{AuthApi, LoginOutcome};
use crate::credential::{Credential, CredentialStore, InMemoryCredentialStore};
use crate::error::{Result, ScreeningError};
use crate::questionnaire::{
    InMemoryQuestionnaireStore, QuestionDefinition, QuestionnaireRecord, QuestionnaireStore,
};
use crate::recommendation::{Recommendation, RecommendationService};

/// Builds a result with one case per id.
pub fn sample_result(probability: f64, ids: &[&str]) -> AnalysisResult {
    AnalysisResult {
        probability,
        similar_cases: ids
            .iter()
            .map(|id| SimilarCase {
                case_id: id.to_string(),
                image_url: format!("https://images.test/{id}.jpg"),
                diagnosis: "nv".to_string(),
                age: Some(45.0),
                sex: Some("female".to_string()),
                localization: Some("back".to_string()),
            })
            .collect(),
    }
}

/// Queue-driven backend. Empty queues fall back to a successful default:
/// a token for every login, an empty analysis and no recommendation.
#[derive(Default)]
pub struct ScriptedBackend {
    logins: Mutex<VecDeque<Result<LoginOutcome>>>,
    registrations: Mutex<VecDeque<Result<String>>>,
    analyses: Mutex<VecDeque<Result<AnalysisResult>>>,
    recommendations: Mutex<VecDeque<Result<Option<Recommendation>>>>,
    analysis_gate: Mutex<Option<Arc<Notify>>>,
    selection_gate: Mutex<Option<Arc<Notify>>>,
    submitted: Mutex<Vec<Vec<String>>>,
    login_calls: AtomicUsize,
    analyze_calls: AtomicUsize,
    selection_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_login(&self, outcome: Result<LoginOutcome>) {
        self.logins.lock().unwrap().push_back(outcome);
    }

    pub fn push_registration(&self, outcome: Result<String>) {
        self.registrations.lock().unwrap().push_back(outcome);
    }

    pub fn push_analysis(&self, outcome: Result<AnalysisResult>) {
        self.analyses.lock().unwrap().push_back(outcome);
    }

    pub fn push_recommendation(&self, outcome: Result<Option<Recommendation>>) {
        self.recommendations.lock().unwrap().push_back(outcome);
    }

    /// Holds the next analysis call until the returned handle is notified.
    pub fn hold_analysis(&self) -> Arc<Notify> {
        arm(&self.analysis_gate)
    }

    /// Holds the next selection submission until the returned handle is
    /// notified.
    pub fn hold_selection(&self) -> Arc<Notify> {
        arm(&self.selection_gate)
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn analyze_calls(&self) -> usize {
        self.analyze_calls.load(Ordering::SeqCst)
    }

    pub fn selection_calls(&self) -> usize {
        self.selection_calls.load(Ordering::SeqCst)
    }

    /// Every id list received by `submit_selection`, in call order.
    pub fn submitted_selections(&self) -> Vec<Vec<String>> {
        self.submitted.lock().unwrap().clone()
    }
}

fn arm(gate: &Mutex<Option<Arc<Notify>>>) -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    *gate.lock().unwrap() = Some(notify.clone());
    notify
}

async fn pass(gate: &Mutex<Option<Arc<Notify>>>) {
    let gate = gate.lock().unwrap().take();
    if let Some(gate) = gate {
        gate.notified().await;
    }
}

#[async_trait]
impl AuthApi for ScriptedBackend {
    async fn login(&self, subject_id: &str, password: &str) -> Result<LoginOutcome> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.logins.lock().unwrap().pop_front() {
            return outcome;
        }
        if password == "wrong" {
            return Err(ScreeningError::ServiceError {
                status: 401,
                message: "Invalid national ID or password".to_string(),
            });
        }
        Credential::new(format!("token-{subject_id}"), subject_id)
            .map(LoginOutcome::Authenticated)
            .ok_or(ScreeningError::Unauthenticated)
    }

    async fn register(&self, _subject_id: &str, _password: &str) -> Result<String> {
        self.registrations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("User registered successfully".to_string()))
    }
}

#[async_trait]
impl ScoringService for ScriptedBackend {
    async fn analyze(&self, _credential: &Credential, _image: &ImageUpload) -> Result<AnalysisResult> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        pass(&self.analysis_gate).await;
        self.analyses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(sample_result(0.5, &[])))
    }
}

#[async_trait]
impl RecommendationService for ScriptedBackend {
    async fn submit_selection(
        &self,
        _credential: &Credential,
        selected_ids: &[String],
    ) -> Result<Option<Recommendation>> {
        self.selection_calls.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().unwrap().push(selected_ids.to_vec());
        pass(&self.selection_gate).await;
        self.recommendations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(None))
    }
}

/// Questionnaire store whose next fetch or insert waits for a handle.
pub struct GatedQuestionnaireStore {
    inner: Arc<InMemoryQuestionnaireStore>,
    fetch_gate: Mutex<Option<Arc<Notify>>>,
    insert_gate: Mutex<Option<Arc<Notify>>>,
    fetch_calls: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl GatedQuestionnaireStore {
    pub fn new(inner: Arc<InMemoryQuestionnaireStore>) -> Self {
        Self {
            inner,
            fetch_gate: Mutex::new(None),
            insert_gate: Mutex::new(None),
            fetch_calls: AtomicUsize::new(0),
            insert_calls: AtomicUsize::new(0),
        }
    }

    pub fn hold_fetch(&self) -> Arc<Notify> {
        arm(&self.fetch_gate)
    }

    pub fn hold_insert(&self) -> Arc<Notify> {
        arm(&self.insert_gate)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuestionnaireStore for GatedQuestionnaireStore {
    async fn fetch_definitions(&self) -> Result<Vec<QuestionDefinition>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        pass(&self.fetch_gate).await;
        self.inner.fetch_definitions().await
    }

    async fn insert_record(&self, record: &QuestionnaireRecord) -> Result<()> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        pass(&self.insert_gate).await;
        self.inner.insert_record(record).await
    }
}

/// Credential store whose next save waits for a handle.
#[derive(Default)]
pub struct GatedCredentialStore {
    inner: InMemoryCredentialStore,
    save_gate: Mutex<Option<Arc<Notify>>>,
    save_calls: AtomicUsize,
}

impl GatedCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold_save(&self) -> Arc<Notify> {
        arm(&self.save_gate)
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for GatedCredentialStore {
    async fn load(&self) -> Result<Option<String>> {
        self.inner.load().await
    }

    async fn save(&self, blob: &str) -> Result<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        pass(&self.save_gate).await;
        self.inner.save(blob).await
    }

    async fn remove(&self) -> Result<()> {
        self.inner.remove().await
    }
}
