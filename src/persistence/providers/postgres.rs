use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::domain::{ConversationMessage, GeneratedDocument, Session, Template, TemplateMatch};
use crate::persistence::PersistenceLayer;

const SESSION_COLUMNS: &str = "id, user_id, template_id, history, answered_question_ids, \
     answers, current_question_index, complete, created_at, updated_at";

#[derive(Debug)]
pub struct PostgresProvider {
    pool: PgPool,
}

impl PostgresProvider {
    pub async fn new(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await?;

        // Run Migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }

    fn session_from_row(row: &PgRow) -> Result<Session> {
        let history: serde_json::Value = row.try_get("history")?;
        let answered: serde_json::Value = row.try_get("answered_question_ids")?;
        let answers: serde_json::Value = row.try_get("answers")?;
        let index: i32 = row.try_get("current_question_index")?;

        Ok(Session {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            template_id: row.try_get("template_id")?,
            history: serde_json::from_value(history).context("decoding session history")?,
            answered_question_ids: serde_json::from_value(answered)
                .context("decoding answered question ids")?,
            answers: serde_json::from_value(answers).context("decoding answers")?,
            current_question_index: usize::try_from(index).unwrap_or_default(),
            complete: row.try_get("complete")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn document_from_row(row: &PgRow) -> Result<GeneratedDocument> {
        let data: serde_json::Value = row.try_get("data")?;
        Ok(GeneratedDocument {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            session_id: row.try_get("session_id")?,
            template_id: row.try_get("template_id")?,
            data: serde_json::from_value(data).context("decoding document data")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl PersistenceLayer for PostgresProvider {
    async fn find_incomplete_session(&self, user_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM wizard_sessions
             WHERE user_id = $1 AND complete = FALSE
             ORDER BY updated_at DESC
             LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::session_from_row).transpose()
    }

    async fn create_session(&self, user_id: &str) -> Result<Session> {
        let session = Session::new(user_id);

        sqlx::query(
            r#"
            INSERT INTO wizard_sessions (id, user_id, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM wizard_sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::session_from_row).transpose()
    }

    async fn bind_template_with_history(
        &self,
        session_id: &str,
        template_id: &str,
        messages: &[ConversationMessage],
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE wizard_sessions
            SET template_id = $2,
                history = history || $3,
                updated_at = NOW()
            WHERE id = $1 AND template_id IS NULL
            "#,
        )
        .bind(session_id)
        .bind(template_id)
        .bind(serde_json::to_value(messages)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get_session(session_id).await?.is_none() {
            bail!("session {session_id} not found");
        }
        Ok(false)
    }

    async fn record_turn(
        &self,
        session_id: &str,
        answered: &BTreeMap<String, String>,
        messages: &[ConversationMessage],
    ) -> Result<Session> {
        let ids: Vec<&String> = answered.keys().collect();

        // Evaluated against the row as locked, so a turn that commits first
        // is merged rather than overwritten.
        let row = sqlx::query(&format!(
            r#"
            UPDATE wizard_sessions
            SET answered_question_ids = (
                    SELECT COALESCE(jsonb_agg(DISTINCT merged.id ORDER BY merged.id), '[]'::jsonb)
                    FROM jsonb_array_elements_text(answered_question_ids || $2) AS merged(id)
                ),
                answers = $3 || answers,
                current_question_index = (
                    SELECT COUNT(DISTINCT merged.id)::INTEGER
                    FROM jsonb_array_elements_text(answered_question_ids || $2) AS merged(id)
                ),
                history = history || $4,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(session_id)
        .bind(serde_json::to_value(ids)?)
        .bind(serde_json::to_value(answered)?)
        .bind(serde_json::to_value(messages)?)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::session_from_row(&row),
            None => bail!("session {session_id} not found"),
        }
    }

    async fn mark_complete(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE wizard_sessions
            SET complete = TRUE, updated_at = NOW()
            WHERE id = $1 AND complete = FALSE
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_stale_incomplete_sessions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM wizard_sessions WHERE complete = FALSE AND updated_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn get_template(&self, template_id: &str) -> Result<Option<Template>> {
        let row = sqlx::query("SELECT definition FROM templates WHERE id = $1")
            .bind(template_id)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            let val: serde_json::Value = row.try_get("definition")?;
            Ok(Some(serde_json::from_value(val)?))
        } else {
            Ok(None)
        }
    }

    async fn save_template(&self, template: &Template, embedding: &[f32]) -> Result<()> {
        let embedding_vector = Vector::from(embedding.to_vec());
        let definition = serde_json::to_value(template)?;

        sqlx::query(
            r#"
            INSERT INTO templates (id, name, description, definition, embedding, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                definition = EXCLUDED.definition,
                embedding = EXCLUDED.embedding,
                updated_at = NOW()
            "#,
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(definition)
        .bind(embedding_vector)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_best_template(
        &self,
        query_vec: &[f32],
        min_score: f32,
    ) -> Result<Option<TemplateMatch>> {
        let embedding_vector = Vector::from(query_vec.to_vec());

        let row = sqlx::query(
            r#"
            SELECT id, 1 - (embedding <=> $1) AS score
            FROM templates
            WHERE 1 - (embedding <=> $1) >= $2
            ORDER BY embedding <=> $1
            LIMIT 1
            "#,
        )
        .bind(embedding_vector) // $1
        .bind(f64::from(min_score)) // $2
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                // pgvector's distance operator yields double precision.
                let score: f64 = row.try_get("score")?;
                Ok(Some(TemplateMatch {
                    template_id: row.try_get("id")?,
                    score: score as f32,
                }))
            }
            None => Ok(None),
        }
    }

    async fn create_document(
        &self,
        user_id: &str,
        session_id: &str,
        template_id: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<GeneratedDocument> {
        let doc = GeneratedDocument::new(user_id, session_id, template_id, data.clone());

        sqlx::query(
            r#"
            INSERT INTO generated_documents (id, user_id, session_id, template_id, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.user_id)
        .bind(&doc.session_id)
        .bind(&doc.template_id)
        .bind(serde_json::to_value(&doc.data)?)
        .bind(doc.created_at)
        .execute(&self.pool)
        .await?;

        // Whoever won the insert, the stored row is the document.
        self.get_document_for_session(session_id)
            .await?
            .context("document missing after insert")
    }

    async fn get_document_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<GeneratedDocument>> {
        let row = sqlx::query(
            "SELECT id, user_id, session_id, template_id, data, created_at
             FROM generated_documents WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::document_from_row).transpose()
    }
}
