use serde::Serialize;
use tracing::debug;

use crate::analysis::AnalysisResult;
use crate::error::{Result, ScreeningError};

/// Upper bound on the number of cases a user may pick.
pub const MAX_SELECTION: usize = 3;

/// Chosen case ids in the order they were picked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Selection {
    ids: Vec<String>,
}

impl Selection {
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, case_id: &str) -> bool {
        self.ids.iter().any(|id| id == case_id)
    }

    pub fn is_saturated(&self) -> bool {
        self.ids.len() >= MAX_SELECTION
    }
}

/// Bounded multi-select over the cases of the active analysis result.
#[derive(Debug, Clone, Default)]
pub struct SimilaritySelector {
    candidates: Option<Vec<String>>,
    selection: Selection,
}

impl SimilaritySelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the candidate set with the ids of `result` and clears the
    /// selection.
    pub fn activate(&mut self, result: &AnalysisResult) {
        self.candidates = Some(result.case_ids());
        self.reset();
    }

    /// Drops the candidate set entirely.
    pub fn deactivate(&mut self) {
        self.candidates = None;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.selection = Selection::default();
    }

    pub fn has_active_result(&self) -> bool {
        self.candidates.is_some()
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Removes `case_id` if selected; otherwise adds it while below the cap.
    /// Adding to a saturated selection is a silent no-op. Returns whether
    /// `case_id` is selected afterwards.
    pub fn toggle(&mut self, case_id: &str) -> Result<bool> {
        let candidates = self
            .candidates
            .as_ref()
            .ok_or(ScreeningError::NoActiveResult)?;

        if let Some(pos) = self.selection.ids.iter().position(|id| id == case_id) {
            self.selection.ids.remove(pos);
            debug!(case_id, "Case deselected");
            return Ok(false);
        }

        // Unknown ids never enter the selection.
        if !candidates.iter().any(|id| id == case_id) {
            debug!(case_id, "Ignoring toggle for a case outside the active result");
            return Ok(false);
        }

        if self.selection.is_saturated() {
            debug!(case_id, "Selection full, toggle ignored");
            return Ok(false);
        }

        self.selection.ids.push(case_id.to_string());
        debug!(case_id, selected = self.selection.len(), "Case selected");
        Ok(true)
    }
}
