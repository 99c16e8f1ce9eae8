use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, ScreeningError};
use crate::questionnaire::{QuestionDefinition, QuestionnaireRecord, QuestionnaireStore};

pub const DEFAULT_QUESTION_TABLE: &str = "question_definitions";
pub const DEFAULT_RECORD_TABLE: &str = "mole_questionnaires";

/// True for plain SQL identifiers: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn db_error(e: sqlx::Error) -> ScreeningError {
    match e {
        sqlx::Error::Database(db) => ScreeningError::SubmissionRejected(db.message().to_string()),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => ScreeningError::TransportError(e.to_string()),
        other => ScreeningError::SubmissionRejected(other.to_string()),
    }
}

/// Question definitions and questionnaire records in Postgres.
///
/// Definitions are read from `question_table` (`question_key`,
/// `question_text`). Each record becomes one row of `record_table` holding
/// `national_id` plus a boolean column per question key.
#[derive(Clone)]
pub struct PostgresQuestionnaireStore {
    pool: PgPool,
    question_table: String,
    record_table: String,
}

impl PostgresQuestionnaireStore {
    pub async fn connect(
        database_url: &str,
        question_table: &str,
        record_table: &str,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| ScreeningError::TransportError(format!("database connection failed: {}", e)))?;

        info!("Connected to questionnaire database");
        Self::from_pool(pool, question_table, record_table)
    }

    pub fn from_pool(pool: PgPool, question_table: &str, record_table: &str) -> Result<Self> {
        for table in [question_table, record_table] {
            if !is_identifier(table) {
                return Err(ScreeningError::SourceUnavailable(format!(
                    "invalid table name '{}'",
                    table
                )));
            }
        }
        Ok(Self {
            pool,
            question_table: question_table.to_string(),
            record_table: record_table.to_string(),
        })
    }
}

#[async_trait]
impl QuestionnaireStore for PostgresQuestionnaireStore {
    async fn fetch_definitions(&self) -> Result<Vec<QuestionDefinition>> {
        let sql = format!(
            "SELECT question_key, question_text FROM {}",
            self.question_table
        );
        let rows = sqlx::query_as::<_, (String, String)>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ScreeningError::SourceUnavailable(e.to_string()))?;

        debug!("Fetched {} question definitions", rows.len());
        Ok(rows
            .into_iter()
            .map(|(key, prompt)| QuestionDefinition::new(key, prompt))
            .collect())
    }

    async fn insert_record(&self, record: &QuestionnaireRecord) -> Result<()> {
        if let Some(bad) = record.answers.keys().find(|k| !is_identifier(k)) {
            return Err(ScreeningError::SubmissionRejected(format!(
                "question key '{}' is not a valid column name",
                bad
            )));
        }

        let mut builder = insert_statement(&self.record_table, record);
        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        info!(record_id = %record.id, "Questionnaire record stored");
        Ok(())
    }
}

fn insert_statement<'a>(table: &str, record: &'a QuestionnaireRecord) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(format!("INSERT INTO {} (national_id", table));
    for key in record.answers.keys() {
        builder.push(", ").push(key);
    }
    builder.push(") VALUES (");
    builder.push_bind(record.subject_id.as_str());
    for value in record.answers.values() {
        builder.push(", ").push_bind(*value);
    }
    builder.push(")");
    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::questionnaire::AnswerSet;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn identifiers_are_plain_words() {
        assert!(is_identifier("asymmetry"));
        assert!(is_identifier("_col9"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("9lives"));
        assert!(!is_identifier("color; DROP TABLE users"));
        assert!(!is_identifier("border-irregular"));
    }

    #[test]
    fn insert_lists_one_column_per_answer() {
        let mut answers = AnswerSet::new();
        answers.insert("border".to_string(), false);
        answers.insert("asymmetry".to_string(), true);
        let record = QuestionnaireRecord {
            id: Uuid::new_v4(),
            subject_id: "X".to_string(),
            answers,
            submitted_at: Utc::now(),
        };

        let builder = insert_statement(DEFAULT_RECORD_TABLE, &record);
        assert_eq!(
            builder.sql(),
            "INSERT INTO mole_questionnaires (national_id, asymmetry, border) VALUES ($1, $2, $3)"
        );
    }

    #[tokio::test]
    async fn table_names_are_validated() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/screening")
            .unwrap();
        assert!(PostgresQuestionnaireStore::from_pool(pool.clone(), "questions", "records").is_ok());
        assert!(matches!(
            PostgresQuestionnaireStore::from_pool(pool, "questions; --", "records"),
            Err(ScreeningError::SourceUnavailable(_))
        ));
    }
}
