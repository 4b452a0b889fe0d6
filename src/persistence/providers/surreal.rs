use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};

use crate::domain::{ConversationMessage, GeneratedDocument, Session, Template, TemplateMatch};
use crate::llm::embedding::cosine_similarity;
use crate::persistence::PersistenceLayer;

#[derive(Debug)]
pub struct SurrealDbProvider {
    db: Surreal<Any>,
}

// Record shapes keep our ids out of Surreal's `id` field; every SELECT omits it.

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    session_id: String,
    user_id: String,
    template_id: Option<String>,
    history: Vec<ConversationMessage>,
    answered_question_ids: BTreeSet<String>,
    answers: BTreeMap<String, String>,
    current_question_index: usize,
    complete: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// `updated_at` in epoch millis, for ordering and cleanup.
    updated_ms: i64,
}

impl From<&Session> for SessionRecord {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.id.clone(),
            user_id: s.user_id.clone(),
            template_id: s.template_id.clone(),
            history: s.history.clone(),
            answered_question_ids: s.answered_question_ids.clone(),
            answers: s.answers.clone(),
            current_question_index: s.current_question_index,
            complete: s.complete,
            created_at: s.created_at,
            updated_at: s.updated_at,
            updated_ms: s.updated_at.timestamp_millis(),
        }
    }
}

impl From<SessionRecord> for Session {
    fn from(r: SessionRecord) -> Self {
        Self {
            id: r.session_id,
            user_id: r.user_id,
            template_id: r.template_id,
            history: r.history,
            answered_question_ids: r.answered_question_ids,
            answers: r.answers,
            current_question_index: r.current_question_index,
            complete: r.complete,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TemplateRecord {
    definition: Template,
    embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRecord {
    document: GeneratedDocument,
}

#[derive(Debug, Deserialize)]
struct SessionIdOnly {
    #[allow(dead_code)]
    session_id: String,
}

impl SurrealDbProvider {
    pub async fn new(connection_string: &str) -> Result<Self> {
        let db = connect(connection_string).await?;

        db.use_ns("wizard").use_db("wizard").await?;

        Ok(Self { db })
    }

    fn now_bindings() -> (String, i64) {
        let now = Utc::now();
        (now.to_rfc3339(), now.timestamp_millis())
    }
}

#[async_trait]
impl PersistenceLayer for SurrealDbProvider {
    async fn find_incomplete_session(&self, user_id: &str) -> Result<Option<Session>> {
        let mut response = self
            .db
            .query(
                "SELECT * OMIT id FROM wizard_sessions
                 WHERE user_id = $user AND complete = false
                 ORDER BY updated_ms DESC LIMIT 1",
            )
            .bind(("user", user_id.to_string()))
            .await?;
        let records: Vec<SessionRecord> = response.take(0)?;
        Ok(records.into_iter().next().map(Session::from))
    }

    async fn create_session(&self, user_id: &str) -> Result<Session> {
        let session = Session::new(user_id);
        self.db
            .query("CREATE type::thing('wizard_sessions', $sid) CONTENT $data RETURN NONE")
            .bind(("sid", session.id.clone()))
            .bind(("data", SessionRecord::from(&session)))
            .await?
            .check()?;
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let mut response = self
            .db
            .query("SELECT * OMIT id FROM type::thing('wizard_sessions', $sid)")
            .bind(("sid", session_id.to_string()))
            .await?;
        let records: Vec<SessionRecord> = response.take(0)?;
        Ok(records.into_iter().next().map(Session::from))
    }

    async fn bind_template_with_history(
        &self,
        session_id: &str,
        template_id: &str,
        messages: &[ConversationMessage],
    ) -> Result<bool> {
        let (now, now_ms) = Self::now_bindings();
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('wizard_sessions', $sid)
                 SET template_id = $tid, history = array::concat(history, $msgs),
                     updated_at = $now, updated_ms = $now_ms
                 WHERE template_id = NONE OR template_id = NULL
                 RETURN session_id",
            )
            .bind(("sid", session_id.to_string()))
            .bind(("tid", template_id.to_string()))
            .bind(("msgs", messages.to_vec()))
            .bind(("now", now))
            .bind(("now_ms", now_ms))
            .await?;
        let bound: Vec<SessionIdOnly> = response.take(0)?;
        if !bound.is_empty() {
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
        let (now, now_ms) = Self::now_bindings();
        let ids: Vec<String> = answered.keys().cloned().collect();

        // MERGE lets incoming answers win, so the stored ones are merged back
        // over them inside the same transaction.
        let response = self
            .db
            .query(
                "BEGIN TRANSACTION;
                 LET $prior = (SELECT VALUE answers FROM ONLY type::thing('wizard_sessions', $sid));
                 UPDATE type::thing('wizard_sessions', $sid) MERGE { answers: $answers } RETURN NONE;
                 UPDATE type::thing('wizard_sessions', $sid) MERGE { answers: $prior ?? {} } RETURN NONE;
                 UPDATE type::thing('wizard_sessions', $sid)
                 SET answered_question_ids = array::sort(array::union(answered_question_ids, $ids)),
                     current_question_index = array::len(array::union(answered_question_ids, $ids)),
                     history = array::concat(history, $msgs),
                     updated_at = $now, updated_ms = $now_ms
                 RETURN NONE;
                 COMMIT TRANSACTION;
                 SELECT * OMIT id FROM type::thing('wizard_sessions', $sid);",
            )
            .bind(("sid", session_id.to_string()))
            .bind(("answers", answered.clone()))
            .bind(("ids", ids))
            .bind(("msgs", messages.to_vec()))
            .bind(("now", now))
            .bind(("now_ms", now_ms))
            .await?;
        let mut response = response.check()?;
        let last = response.num_statements().saturating_sub(1);
        let records: Vec<SessionRecord> = response.take(last)?;
        records
            .into_iter()
            .next()
            .map(Session::from)
            .with_context(|| format!("session {session_id} not found"))
    }

    async fn mark_complete(&self, session_id: &str) -> Result<bool> {
        let (now, now_ms) = Self::now_bindings();
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('wizard_sessions', $sid)
                 SET complete = true, updated_at = $now, updated_ms = $now_ms
                 WHERE complete = false
                 RETURN session_id",
            )
            .bind(("sid", session_id.to_string()))
            .bind(("now", now))
            .bind(("now_ms", now_ms))
            .await?;
        let flipped: Vec<SessionIdOnly> = response.take(0)?;
        Ok(!flipped.is_empty())
    }

    async fn delete_stale_incomplete_sessions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut response = self
            .db
            .query(
                "SELECT session_id FROM wizard_sessions
                 WHERE complete = false AND updated_ms < $cutoff;
                 DELETE wizard_sessions
                 WHERE complete = false AND updated_ms < $cutoff
                 RETURN NONE",
            )
            .bind(("cutoff", older_than.timestamp_millis()))
            .await?;
        let removed: Vec<SessionIdOnly> = response.take(0)?;
        Ok(removed.len() as u64)
    }

    async fn get_template(&self, template_id: &str) -> Result<Option<Template>> {
        let mut response = self
            .db
            .query("SELECT * OMIT id FROM type::thing('wizard_templates', $tid)")
            .bind(("tid", template_id.to_string()))
            .await?;
        let records: Vec<TemplateRecord> = response.take(0)?;
        Ok(records.into_iter().next().map(|r| r.definition))
    }

    async fn save_template(&self, template: &Template, embedding: &[f32]) -> Result<()> {
        let record = TemplateRecord {
            definition: template.clone(),
            embedding: embedding.to_vec(),
        };
        self.db
            .query("UPSERT type::thing('wizard_templates', $tid) CONTENT $data RETURN NONE")
            .bind(("tid", template.id.clone()))
            .bind(("data", record))
            .await?
            .check()?;
        Ok(())
    }

    async fn find_best_template(
        &self,
        query_vec: &[f32],
        min_score: f32,
    ) -> Result<Option<TemplateMatch>> {
        // Fallback: fetch all, compute cosine similarity in memory.
        let mut response = self
            .db
            .query("SELECT * OMIT id FROM wizard_templates")
            .await?;
        let records: Vec<TemplateRecord> = response.take(0)?;

        let best = records
            .into_iter()
            .map(|r| TemplateMatch {
                score: cosine_similarity(query_vec, &r.embedding),
                template_id: r.definition.id,
            })
            .filter(|m| m.score >= min_score)
            .max_by(|a, b| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        Ok(best)
    }

    async fn create_document(
        &self,
        user_id: &str,
        session_id: &str,
        template_id: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<GeneratedDocument> {
        if let Some(existing) = self.get_document_for_session(session_id).await? {
            return Ok(existing);
        }

        let doc = GeneratedDocument::new(user_id, session_id, template_id, data.clone());
        let created = self
            .db
            .query("CREATE type::thing('generated_documents', $sid) CONTENT $data RETURN NONE")
            .bind(("sid", session_id.to_string()))
            .bind(("data", DocumentRecord { document: doc }))
            .await
            .and_then(surrealdb::Response::check);

        // A concurrent creator may have won the record id; theirs is the document.
        if let Err(e) = created {
            tracing::debug!(session_id, error = %e, "document create raced");
        }
        self.get_document_for_session(session_id)
            .await?
            .context("document missing after create")
    }

    async fn get_document_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<GeneratedDocument>> {
        let mut response = self
            .db
            .query("SELECT * OMIT id FROM type::thing('generated_documents', $sid)")
            .bind(("sid", session_id.to_string()))
            .await?;
        let records: Vec<DocumentRecord> = response.take(0)?;
        Ok(records.into_iter().next().map(|r| r.document))
    }
}
