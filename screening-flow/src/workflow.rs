//! Screening session state machine.
//!
//! ```text
//! LoggedOut -> QuestionnairePending -> ImageCapture -> Analyzing -> AwaitingSelection
//!                                          ^              |               |
//!                                          +--(failure)---+          Submitting
//!                                                         |               |
//!                                                   (no candidates)  RecommendationShown
//!                                                         v               v
//!                                                         +-----> Done <--+
//! ```
//!
//! Every command is a method on [`WorkflowController`]. Failures leave the
//! session where it was; `logout` returns to `LoggedOut` from anywhere and
//! invalidates whatever request is still in flight.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisClient, AnalysisResult, ImageUpload, ScoringService};
use crate::auth::{self, AuthApi, LoginOutcome};
use crate::context::{Context, Step, StepGuard};
use crate::credential::Credential;
use crate::error::{Result, ScreeningError};
use crate::questionnaire::{
    AnswerSet, QuestionDefinition, QuestionnaireEngine, QuestionnaireRecord, QuestionnaireStatus,
    QuestionnaireStore,
};
use crate::recommendation::{Recommendation, RecommendationService, RecommendationSubmitter};
use crate::selection::{MAX_SELECTION, Selection, SimilaritySelector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    LoggedOut,
    QuestionnairePending,
    ImageCapture,
    Analyzing,
    AwaitingSelection,
    Submitting,
    RecommendationShown,
    Done,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::LoggedOut => "logged out",
            WorkflowState::QuestionnairePending => "the questionnaire is pending",
            WorkflowState::ImageCapture => "waiting for an image",
            WorkflowState::Analyzing => "analyzing",
            WorkflowState::AwaitingSelection => "awaiting a selection",
            WorkflowState::Submitting => "submitting the selection",
            WorkflowState::RecommendationShown => "showing a recommendation",
            WorkflowState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Commands a rendering layer can offer. `available_actions` tells it which
/// controls to enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SignIn,
    LoadQuestionnaire,
    Answer,
    SubmitQuestionnaire,
    Analyze,
    ToggleCase,
    SubmitSelection,
    DismissRecommendation,
    Restart,
    Logout,
}

impl Action {
    fn step(self) -> Option<Step> {
        match self {
            Action::SignIn => Some(Step::SignIn),
            Action::LoadQuestionnaire => Some(Step::LoadQuestionnaire),
            Action::SubmitQuestionnaire => Some(Step::SubmitQuestionnaire),
            Action::Analyze => Some(Step::Analyze),
            Action::SubmitSelection => Some(Step::SubmitSelection),
            _ => None,
        }
    }
}

fn actions_for(state: WorkflowState) -> &'static [Action] {
    use Action::*;
    match state {
        WorkflowState::LoggedOut => &[SignIn],
        WorkflowState::QuestionnairePending => {
            &[LoadQuestionnaire, Answer, SubmitQuestionnaire, Logout]
        }
        WorkflowState::ImageCapture => &[Analyze, Logout],
        WorkflowState::Analyzing => &[Logout],
        WorkflowState::AwaitingSelection => &[ToggleCase, SubmitSelection, Analyze, Logout],
        WorkflowState::Submitting => &[Logout],
        WorkflowState::RecommendationShown => &[DismissRecommendation, Logout],
        WorkflowState::Done => &[Restart, Logout],
    }
}

/// External services a controller talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthApi>,
    pub questionnaire: Arc<dyn QuestionnaireStore>,
    pub scoring: Arc<dyn ScoringService>,
    pub recommendations: Arc<dyn RecommendationService>,
}

impl Collaborators {
    /// Uses one backend for auth, scoring and recommendations.
    pub fn with_backend<B>(backend: Arc<B>, questionnaire: Arc<dyn QuestionnaireStore>) -> Self
    where
        B: AuthApi + ScoringService + RecommendationService + 'static,
    {
        Self {
            auth: backend.clone(),
            questionnaire,
            scoring: backend.clone(),
            recommendations: backend,
        }
    }
}

/// Serializable view of a session for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: WorkflowState,
    pub subject_id: Option<String>,
    pub questionnaire_status: QuestionnaireStatus,
    pub questions: Vec<QuestionDefinition>,
    pub answers: AnswerSet,
    pub unanswered: Vec<String>,
    pub last_record_id: Option<Uuid>,
    pub analysis: Option<AnalysisResult>,
    pub selection: Vec<String>,
    pub max_selection: usize,
    pub recommendation: Option<Recommendation>,
    pub in_flight: Vec<Step>,
    pub available_actions: Vec<Action>,
}

struct SessionData {
    state: WorkflowState,
    questionnaire: QuestionnaireEngine,
    last_record: Option<QuestionnaireRecord>,
    analysis: Option<AnalysisResult>,
    selector: SimilaritySelector,
    recommendation: Option<Recommendation>,
}

impl SessionData {
    fn fresh(state: WorkflowState) -> Self {
        Self {
            state,
            questionnaire: QuestionnaireEngine::new(),
            last_record: None,
            analysis: None,
            selector: SimilaritySelector::new(),
            recommendation: None,
        }
    }

    fn transition(&mut self, to: WorkflowState) {
        if self.state != to {
            info!(from = ?self.state, to = ?to, "Workflow transition");
            self.state = to;
        }
    }

    fn require(&self, allowed: &[WorkflowState], action: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ScreeningError::InvalidTransition {
                state: self.state,
                action,
            })
        }
    }
}

/// Drives one screening session end to end.
pub struct WorkflowController {
    context: Context,
    auth: Arc<dyn AuthApi>,
    store: Arc<dyn QuestionnaireStore>,
    analysis_client: AnalysisClient,
    submitter: RecommendationSubmitter,
    data: Mutex<SessionData>,
}

impl WorkflowController {
    pub fn new(context: Context, collaborators: Collaborators) -> Self {
        Self {
            context,
            auth: collaborators.auth,
            store: collaborators.questionnaire,
            analysis_client: AnalysisClient::new(collaborators.scoring),
            submitter: RecommendationSubmitter::new(collaborators.recommendations),
            data: Mutex::new(SessionData::fresh(WorkflowState::LoggedOut)),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn state(&self) -> WorkflowState {
        self.data().state
    }

    pub fn selection(&self) -> Selection {
        self.data().selector.selection().clone()
    }

    pub fn analysis(&self) -> Option<AnalysisResult> {
        self.data().analysis.clone()
    }

    pub fn recommendation(&self) -> Option<Recommendation> {
        self.data().recommendation.clone()
    }

    pub fn questions(&self) -> Vec<QuestionDefinition> {
        self.data().questionnaire.definitions().to_vec()
    }

    /// Actions valid in the current state whose request is not in flight.
    pub fn available_actions(&self) -> Vec<Action> {
        let state = self.state();
        actions_for(state)
            .iter()
            .copied()
            .filter(|action| {
                action
                    .step()
                    .is_none_or(|step| !self.context.is_in_flight(step))
            })
            .collect()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let available_actions = self.available_actions();
        let data = self.data();
        SessionSnapshot {
            state: data.state,
            subject_id: self.context.credentials().subject_id(),
            questionnaire_status: data.questionnaire.status(),
            questions: data.questionnaire.definitions().to_vec(),
            answers: data.questionnaire.answers().clone(),
            unanswered: data.questionnaire.missing(),
            last_record_id: data.last_record.as_ref().map(|r| r.id),
            analysis: data.analysis.clone(),
            selection: data.selector.selection().ids().to_vec(),
            max_selection: MAX_SELECTION,
            recommendation: data.recommendation.clone(),
            in_flight: self.context.in_flight_steps(),
            available_actions,
        }
    }

    /// Passes a registration through to the auth collaborator.
    pub async fn register(&self, subject_id: &str, password: &str) -> Result<String> {
        auth::validate_registration(subject_id, password)?;
        let message = self.auth.register(subject_id, password).await?;
        info!(subject = %subject_id, "Registration accepted");
        Ok(message)
    }

    /// Logs in through the auth collaborator and starts a session.
    pub async fn sign_in(&self, subject_id: &str, password: &str) -> Result<WorkflowState> {
        self.data()
            .require(&[WorkflowState::LoggedOut], "sign in")?;
        auth::validate_login(subject_id, password)?;

        let guard = self.context.begin(Step::SignIn)?;
        let outcome = self.auth.login(subject_id, password).await;
        guard.ensure_current(&self.context)?;

        match outcome? {
            LoginOutcome::Authenticated(credential) => self.start_session(credential, &guard).await,
            LoginOutcome::Acknowledged(message) => {
                warn!(subject = %subject_id, %message, "Login acknowledged without a credential");
                Err(ScreeningError::Unauthenticated)
            }
        }
    }

    /// Restores a persisted credential, if one is present and complete.
    pub async fn resume(&self) -> Result<WorkflowState> {
        self.data()
            .require(&[WorkflowState::LoggedOut], "resume a session")?;
        let guard = self.context.begin(Step::SignIn)?;
        match self.context.credentials().restore().await? {
            Some(credential) => self.start_session(credential, &guard).await,
            None => Ok(WorkflowState::LoggedOut),
        }
    }

    async fn start_session(
        &self,
        credential: Credential,
        guard: &StepGuard,
    ) -> Result<WorkflowState> {
        let subject = credential.subject_id().to_string();
        self.context.credentials().set(credential.clone()).await?;

        if !guard.is_current(&self.context) {
            // Logged out while the credential was being saved.
            self.context.credentials().revoke(&credential).await?;
            return Err(ScreeningError::Cancelled);
        }

        let mut data = self.data();
        guard.ensure_current(&self.context)?;
        *data = SessionData::fresh(WorkflowState::LoggedOut);
        data.transition(WorkflowState::QuestionnairePending);
        info!(subject = %subject, "Screening session started");
        Ok(data.state)
    }

    /// Ends the session from any state. Responses to requests still in
    /// flight are discarded when they arrive.
    pub async fn logout(&self) -> Result<()> {
        self.context.invalidate();
        {
            let mut data = self.data();
            let from = data.state;
            *data = SessionData::fresh(WorkflowState::LoggedOut);
            info!(from = ?from, "Logged out");
        }
        self.context.credentials().clear().await
    }

    /// Fetches question definitions for the pending questionnaire.
    pub async fn load_questionnaire(&self) -> Result<Vec<QuestionDefinition>> {
        let guard = self.context.begin(Step::LoadQuestionnaire)?;
        self.data().require(
            &[WorkflowState::QuestionnairePending],
            "load the questionnaire",
        )?;

        let fetched = self.store.fetch_definitions().await;

        let mut data = self.data();
        guard.ensure_current(&self.context)?;
        data.questionnaire.install(fetched)?;
        Ok(data.questionnaire.definitions().to_vec())
    }

    pub fn answer(&self, key: &str, value: bool) -> Result<()> {
        let mut data = self.data();
        data.require(&[WorkflowState::QuestionnairePending], "answer a question")?;
        data.questionnaire.answer(key, value)
    }

    pub fn is_questionnaire_complete(&self) -> bool {
        self.data().questionnaire.is_complete()
    }

    /// Submits the completed questionnaire and moves on to image capture.
    pub async fn submit_questionnaire(&self) -> Result<QuestionnaireRecord> {
        let guard = self.context.begin(Step::SubmitQuestionnaire)?;
        let record = {
            let data = self.data();
            data.require(
                &[WorkflowState::QuestionnairePending],
                "submit the questionnaire",
            )?;
            let subject = self
                .context
                .credentials()
                .subject_id()
                .ok_or(ScreeningError::Unauthenticated)?;
            data.questionnaire.record_for(&subject)?
        };

        let inserted = self.store.insert_record(&record).await;

        let mut data = self.data();
        guard.ensure_current(&self.context)?;
        inserted?;
        info!(record_id = %record.id, subject = %record.subject_id, "Questionnaire submitted");
        data.last_record = Some(record.clone());
        data.transition(WorkflowState::ImageCapture);
        Ok(record)
    }

    /// Uploads an image for scoring. The previous result and selection are
    /// dropped as soon as the new attempt starts.
    pub async fn analyze(&self, image: ImageUpload) -> Result<AnalysisResult> {
        let guard = self.context.begin(Step::Analyze)?;
        let credential = {
            let mut data = self.data();
            data.require(
                &[WorkflowState::ImageCapture, WorkflowState::AwaitingSelection],
                "analyze an image",
            )?;
            let credential = self
                .context
                .credential()
                .ok_or(ScreeningError::Unauthenticated)?;
            if image.is_empty() {
                return Err(ScreeningError::MissingImage);
            }

            data.analysis = None;
            data.selector.deactivate();
            data.recommendation = None;
            data.transition(WorkflowState::Analyzing);
            credential
        };

        let outcome = self.analysis_client.analyze(Some(&credential), &image).await;

        let mut data = self.data();
        guard.ensure_current(&self.context)?;
        match outcome {
            Err(e) => {
                warn!("Analysis failed: {}", e);
                data.transition(WorkflowState::ImageCapture);
                Err(e)
            }
            Ok(result) => {
                if result.has_candidates() {
                    data.selector.activate(&result);
                    data.transition(WorkflowState::AwaitingSelection);
                } else {
                    info!("No similar cases returned, skipping selection");
                    data.transition(WorkflowState::Done);
                }
                data.analysis = Some(result.clone());
                Ok(result)
            }
        }
    }

    /// Adds or removes a case from the selection.
    pub fn toggle_case(&self, case_id: &str) -> Result<Selection> {
        let mut data = self.data();
        if !data.selector.has_active_result() {
            return Err(ScreeningError::NoActiveResult);
        }
        data.require(&[WorkflowState::AwaitingSelection], "change the selection")?;
        data.selector.toggle(case_id)?;
        Ok(data.selector.selection().clone())
    }

    /// Sends the selection. On failure the selection is kept for a retry.
    pub async fn submit_selection(&self) -> Result<Option<Recommendation>> {
        let guard = self.context.begin(Step::SubmitSelection)?;
        let (credential, selection) = {
            let mut data = self.data();
            if !data.selector.has_active_result() {
                return Err(ScreeningError::NoActiveResult);
            }
            data.require(&[WorkflowState::AwaitingSelection], "submit a selection")?;
            let credential = self
                .context
                .credential()
                .ok_or(ScreeningError::Unauthenticated)?;
            let selection = data.selector.selection().clone();
            if selection.is_empty() {
                return Err(ScreeningError::EmptySelection);
            }
            data.transition(WorkflowState::Submitting);
            (credential, selection)
        };

        let outcome = self.submitter.submit(Some(&credential), &selection).await;

        let mut data = self.data();
        guard.ensure_current(&self.context)?;
        match outcome {
            Err(e) => {
                warn!("Selection submission failed: {}", e);
                data.transition(WorkflowState::AwaitingSelection);
                Err(e)
            }
            Ok(Some(recommendation)) => {
                data.recommendation = Some(recommendation.clone());
                data.transition(WorkflowState::RecommendationShown);
                Ok(Some(recommendation))
            }
            Ok(None) => {
                data.transition(WorkflowState::Done);
                Ok(None)
            }
        }
    }

    /// Closes the recommendation; its text is discarded.
    pub fn dismiss_recommendation(&self) -> Result<()> {
        let mut data = self.data();
        data.require(
            &[WorkflowState::RecommendationShown],
            "dismiss the recommendation",
        )?;
        data.recommendation = None;
        data.transition(WorkflowState::Done);
        Ok(())
    }

    /// Starts another screening for the same credential.
    pub fn restart(&self) -> Result<WorkflowState> {
        let mut data = self.data();
        data.require(&[WorkflowState::Done], "start a new screening")?;
        self.context.invalidate();
        *data = SessionData::fresh(WorkflowState::Done);
        data.transition(WorkflowState::QuestionnairePending);
        Ok(data.state)
    }

    fn data(&self) -> MutexGuard<'_, SessionData> {
        match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
