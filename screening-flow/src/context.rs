use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

use crate::credential::{Credential, CredentialHolder, CredentialStore};
use crate::error::{Result, ScreeningError};

/// Network-bound steps of a screening session. At most one request per step
/// may be outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    SignIn,
    LoadQuestionnaire,
    SubmitQuestionnaire,
    Analyze,
    SubmitSelection,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::SignIn => "sign in",
            Step::LoadQuestionnaire => "questionnaire loading",
            Step::SubmitQuestionnaire => "questionnaire submission",
            Step::Analyze => "image analysis",
            Step::SubmitSelection => "selection submission",
        };
        f.write_str(name)
    }
}

/// Session-scoped state shared by every component of one screening session:
/// the credential, the in-flight request registry and the generation used to
/// discard responses that arrive after logout.
#[derive(Clone)]
pub struct Context {
    credentials: Arc<CredentialHolder>,
    in_flight: Arc<DashMap<Step, (Instant, u64)>>,
    generation: Arc<AtomicU64>,
}

impl Context {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            credentials: Arc::new(CredentialHolder::new(store)),
            in_flight: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn credentials(&self) -> &CredentialHolder {
        &self.credentials
    }

    pub fn credential(&self) -> Option<Credential> {
        self.credentials.current()
    }

    /// Marks `step` as in flight. Fails if a request for it is already running.
    pub fn begin(&self, step: Step) -> Result<StepGuard> {
        use dashmap::mapref::entry::Entry;

        match self.in_flight.entry(step) {
            Entry::Occupied(_) => Err(ScreeningError::StepInProgress(step)),
            Entry::Vacant(slot) => {
                let generation = self.generation.load(Ordering::SeqCst);
                slot.insert((Instant::now(), generation));
                Ok(StepGuard {
                    step,
                    generation,
                    in_flight: self.in_flight.clone(),
                })
            }
        }
    }

    pub fn is_in_flight(&self, step: Step) -> bool {
        self.in_flight.contains_key(&step)
    }

    pub fn in_flight_steps(&self) -> Vec<Step> {
        self.in_flight.iter().map(|entry| *entry.key()).collect()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidates every request started before this call and frees their
    /// steps for the next session.
    pub fn invalidate(&self) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight.retain(|_, (_, generation)| *generation >= next);
        debug!(generation = next, "Session generation advanced");
        next
    }
}

/// Held for the duration of one outgoing request; releases the step on drop.
pub struct StepGuard {
    step: Step,
    generation: u64,
    in_flight: Arc<DashMap<Step, (Instant, u64)>>,
}

impl StepGuard {
    pub fn step(&self) -> Step {
        self.step
    }

    /// True while the session has not been logged out or restarted since the
    /// request started.
    pub fn is_current(&self, context: &Context) -> bool {
        context.generation() == self.generation
    }

    pub fn ensure_current(&self, context: &Context) -> Result<()> {
        if self.is_current(context) {
            Ok(())
        } else {
            debug!(step = %self.step, "Discarding stale response");
            Err(ScreeningError::Cancelled)
        }
    }
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        // A stale guard must not release the slot of a newer request.
        let released = self
            .in_flight
            .remove_if(&self.step, |_, (_, generation)| *generation == self.generation);
        if let Some((_, (started, _))) = released {
            debug!(step = %self.step, elapsed_ms = started.elapsed().as_millis() as u64, "Step released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::InMemoryCredentialStore;

    fn context() -> Context {
        Context::new(Arc::new(InMemoryCredentialStore::new()))
    }

    #[test]
    fn second_begin_is_rejected_until_guard_drops() {
        let ctx = context();
        let guard = ctx.begin(Step::Analyze).unwrap();
        assert!(ctx.is_in_flight(Step::Analyze));
        assert_eq!(
            ctx.begin(Step::Analyze).err(),
            Some(ScreeningError::StepInProgress(Step::Analyze))
        );

        // Other steps are independent.
        let other = ctx.begin(Step::SubmitSelection).unwrap();
        drop(other);

        drop(guard);
        assert!(!ctx.is_in_flight(Step::Analyze));
        assert!(ctx.begin(Step::Analyze).is_ok());
    }

    #[test]
    fn invalidate_makes_open_guards_stale() {
        let ctx = context();
        let guard = ctx.begin(Step::LoadQuestionnaire).unwrap();
        assert!(guard.ensure_current(&ctx).is_ok());

        ctx.invalidate();
        assert_eq!(guard.ensure_current(&ctx), Err(ScreeningError::Cancelled));

        drop(guard);
        let fresh = ctx.begin(Step::LoadQuestionnaire).unwrap();
        assert!(fresh.is_current(&ctx));
    }

    #[test]
    fn invalidate_frees_steps_without_letting_stale_guards_release_new_ones() {
        let ctx = context();
        let stale = ctx.begin(Step::Analyze).unwrap();

        ctx.invalidate();
        assert!(!ctx.is_in_flight(Step::Analyze));

        let fresh = ctx.begin(Step::Analyze).unwrap();
        drop(stale);
        assert!(ctx.is_in_flight(Step::Analyze));
        assert_eq!(
            ctx.begin(Step::Analyze).err(),
            Some(ScreeningError::StepInProgress(Step::Analyze))
        );

        drop(fresh);
        assert!(!ctx.is_in_flight(Step::Analyze));
    }

    #[test]
    fn clones_share_state() {
        let ctx = context();
        let clone = ctx.clone();
        let _guard = ctx.begin(Step::SignIn).unwrap();
        assert_eq!(clone.in_flight_steps(), vec![Step::SignIn]);
        clone.invalidate();
        assert_eq!(ctx.generation(), 1);
    }
}
