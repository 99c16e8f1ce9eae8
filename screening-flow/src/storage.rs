use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::workflow::WorkflowController;

/// A hosted screening session.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub controller: Arc<WorkflowController>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(controller: WorkflowController) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), controller)
    }

    pub fn with_id(id: impl Into<String>, controller: WorkflowController) -> Self {
        Self {
            id: id.into(),
            controller: Arc::new(controller),
            created_at: Utc::now(),
        }
    }
}

/// Trait for storing and retrieving sessions
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn save(&self, session: Session) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Session>>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn count(&self) -> Result<usize>;
}

/// In-memory implementation of SessionStorage
#[derive(Default)]
pub struct InMemorySessionStorage {
    sessions: Arc<DashMap<String, Session>>,
}

impl InMemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for InMemorySessionStorage {
    async fn save(&self, session: Session) -> Result<()> {
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|entry| entry.clone()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.remove(id);
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.sessions.len())
    }
}
