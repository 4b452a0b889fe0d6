//! Durable storage for sessions, templates and generated documents.
//!
//! [`PersistenceLayer`] is the store contract the wizard consumes. Providers:
//!
//! - [`providers::memory::InMemoryProvider`]: process-local, for development and tests
//! - [`providers::postgres::PostgresProvider`]: Postgres + pgvector
//! - [`providers::surreal::SurrealDbProvider`]: `SurrealDB`

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{ConversationMessage, GeneratedDocument, Session, Template, TemplateMatch};

pub mod providers;

#[async_trait]
pub trait PersistenceLayer: Send + Sync + std::fmt::Debug {
    // =========================================================================
    // Sessions
    // =========================================================================

    /// The user's session with `complete == false`, if any.
    async fn find_incomplete_session(&self, user_id: &str) -> Result<Option<Session>>;

    /// Create and persist a new unbound session.
    async fn create_session(&self, user_id: &str) -> Result<Session>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Bind the session to a template and append the turn's messages in one write.
    ///
    /// Returns `false`, writing nothing, when the session is already bound.
    async fn bind_template_with_history(
        &self,
        session_id: &str,
        template_id: &str,
        messages: &[ConversationMessage],
    ) -> Result<bool>;

    /// Merge a turn's answers and append its messages in one write.
    ///
    /// Answered ids are unioned with the stored set, an id that is already
    /// answered keeps its stored value, and the question cursor becomes the
    /// size of the merged set. Returns the session as stored afterwards.
    async fn record_turn(
        &self,
        session_id: &str,
        answered: &BTreeMap<String, String>,
        messages: &[ConversationMessage],
    ) -> Result<Session>;

    /// Flip the session to complete. Returns `false` if it already was.
    async fn mark_complete(&self, session_id: &str) -> Result<bool>;

    /// Delete incomplete sessions last updated before `older_than`.
    async fn delete_stale_incomplete_sessions(&self, older_than: DateTime<Utc>) -> Result<u64>;

    // =========================================================================
    // Templates
    // =========================================================================

    async fn get_template(&self, template_id: &str) -> Result<Option<Template>>;

    /// Insert or replace a template and its pre-computed embedding.
    async fn save_template(&self, template: &Template, embedding: &[f32]) -> Result<()>;

    /// Highest-similarity template with score `>= min_score`.
    async fn find_best_template(
        &self,
        query_vec: &[f32],
        min_score: f32,
    ) -> Result<Option<TemplateMatch>>;

    // =========================================================================
    // Documents
    // =========================================================================

    /// Create the document for a session.
    ///
    /// Idempotent per session: a second call returns the existing document.
    async fn create_document(
        &self,
        user_id: &str,
        session_id: &str,
        template_id: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<GeneratedDocument>;

    async fn get_document_for_session(&self, session_id: &str)
    -> Result<Option<GeneratedDocument>>;
}
