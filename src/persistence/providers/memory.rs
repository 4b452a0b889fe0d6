use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::{ConversationMessage, GeneratedDocument, Session, Template, TemplateMatch};
use crate::llm::embedding::cosine_similarity;
use crate::persistence::PersistenceLayer;

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    sessions: RwLock<HashMap<String, Session>>,
    // Kept in insertion order so similarity ties resolve deterministically.
    templates: RwLock<Vec<(Template, Vec<f32>)>>,
    documents: RwLock<HashMap<String, GeneratedDocument>>,
}

impl InMemoryProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_session<F, T>(&self, session_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> T,
    {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("session {session_id} not found"))?;
        let out = f(session);
        session.updated_at = Utc::now();
        Ok(out)
    }

    /// Number of stored sessions, complete or not.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Number of generated documents.
    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Overwrite a session wholesale.
    pub async fn put_session(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }
}

#[async_trait]
impl PersistenceLayer for InMemoryProvider {
    async fn find_incomplete_session(&self, user_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.user_id == user_id && !s.complete)
            .max_by_key(|s| s.updated_at)
            .cloned())
    }

    async fn create_session(&self, user_id: &str) -> Result<Session> {
        let session = Session::new(user_id);
        self.put_session(session.clone()).await;
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn bind_template_with_history(
        &self,
        session_id: &str,
        template_id: &str,
        messages: &[ConversationMessage],
    ) -> Result<bool> {
        self.with_session(session_id, |s| {
            if s.template_id.is_some() {
                return false;
            }
            s.template_id = Some(template_id.to_string());
            s.history.extend_from_slice(messages);
            true
        })
        .await
    }

    async fn record_turn(
        &self,
        session_id: &str,
        answered: &BTreeMap<String, String>,
        messages: &[ConversationMessage],
    ) -> Result<Session> {
        self.with_session(session_id, |s| {
            s.merge_answers(answered.clone());
            s.history.extend_from_slice(messages);
        })
        .await?;
        self.get_session(session_id)
            .await?
            .ok_or_else(|| anyhow!("session {session_id} not found"))
    }

    async fn mark_complete(&self, session_id: &str) -> Result<bool> {
        self.with_session(session_id, |s| !std::mem::replace(&mut s.complete, true))
            .await
    }

    async fn delete_stale_incomplete_sessions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_stale(older_than));
        Ok((before - sessions.len()) as u64)
    }

    async fn get_template(&self, template_id: &str) -> Result<Option<Template>> {
        let templates = self.templates.read().await;
        Ok(templates
            .iter()
            .find(|(t, _)| t.id == template_id)
            .map(|(t, _)| t.clone()))
    }

    async fn save_template(&self, template: &Template, embedding: &[f32]) -> Result<()> {
        let mut templates = self.templates.write().await;
        let entry = (template.clone(), embedding.to_vec());
        match templates.iter_mut().find(|(t, _)| t.id == template.id) {
            Some(existing) => *existing = entry,
            None => templates.push(entry),
        }
        Ok(())
    }

    async fn find_best_template(
        &self,
        query_vec: &[f32],
        min_score: f32,
    ) -> Result<Option<TemplateMatch>> {
        let templates = self.templates.read().await;
        let mut best: Option<TemplateMatch> = None;
        for (template, emb) in templates.iter() {
            let score = cosine_similarity(query_vec, emb);
            if score < min_score {
                continue;
            }
            if best.as_ref().is_none_or(|b| score > b.score) {
                best = Some(TemplateMatch {
                    template_id: template.id.clone(),
                    score,
                });
            }
        }
        Ok(best)
    }

    async fn create_document(
        &self,
        user_id: &str,
        session_id: &str,
        template_id: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<GeneratedDocument> {
        let mut documents = self.documents.write().await;
        let doc = documents
            .entry(session_id.to_string())
            .or_insert_with(|| {
                GeneratedDocument::new(user_id, session_id, template_id, data.clone())
            });
        Ok(doc.clone())
    }

    async fn get_document_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<GeneratedDocument>> {
        Ok(self.documents.read().await.get(session_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Question;
    use chrono::Duration;

    fn template(id: &str) -> Template {
        Template {
            id: id.to_string(),
            name: id.to_uppercase(),
            description: None,
            questions: vec![Question::new("q1", "First?")],
        }
    }

    #[tokio::test]
    async fn test_find_incomplete_session_skips_completed() {
        let store = InMemoryProvider::new();
        let done = store.create_session("alice").await.unwrap();
        assert!(store.mark_complete(&done.id).await.unwrap());
        assert!(!store.mark_complete(&done.id).await.unwrap());

        assert!(store.find_incomplete_session("alice").await.unwrap().is_none());

        let open = store.create_session("alice").await.unwrap();
        let found = store.find_incomplete_session("alice").await.unwrap().unwrap();
        assert_eq!(found.id, open.id);
        assert!(store.find_incomplete_session("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_best_template_respects_threshold() {
        let store = InMemoryProvider::new();
        store.save_template(&template("nda"), &[1.0, 0.0]).await.unwrap();
        store.save_template(&template("lease"), &[0.6, 0.8]).await.unwrap();

        let best = store
            .find_best_template(&[0.9, 0.1], 0.5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(best.template_id, "nda");

        assert!(store.find_best_template(&[0.0, -1.0], 0.5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_document_is_idempotent() {
        let store = InMemoryProvider::new();
        let data = BTreeMap::from([("q1".to_string(), "Acme".to_string())]);

        let first = store.create_document("alice", "s1", "nda", &data).await.unwrap();
        let second = store.create_document("alice", "s1", "nda", &BTreeMap::new()).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.data, data);
        assert_eq!(store.document_count().await, 1);
    }

    #[tokio::test]
    async fn test_stale_cleanup_keeps_completed_sessions() {
        let store = InMemoryProvider::new();
        let mut stale = Session::new("alice");
        stale.updated_at = Utc::now() - Duration::days(10);
        let mut finished = Session::new("bob");
        finished.updated_at = Utc::now() - Duration::days(10);
        finished.complete = true;
        store.put_session(stale).await;
        store.put_session(finished).await;
        store.create_session("carol").await.unwrap();

        let removed = store
            .delete_stale_incomplete_sessions(Utc::now() - Duration::days(3))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_updates_on_missing_session_fail() {
        let store = InMemoryProvider::new();
        assert!(store.bind_template_with_history("nope", "nda", &[]).await.is_err());
        assert!(store.record_turn("nope", &BTreeMap::new(), &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_only_applies_to_unbound_session() {
        let store = InMemoryProvider::new();
        let session = store.create_session("alice").await.unwrap();
        let turn = [
            ConversationMessage::user("I need an NDA"),
            ConversationMessage::assistant("First?"),
        ];

        assert!(store.bind_template_with_history(&session.id, "nda", &turn).await.unwrap());
        assert!(!store.bind_template_with_history(&session.id, "lease", &turn).await.unwrap());

        let stored = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.template_id.as_deref(), Some("nda"));
        assert_eq!(stored.history.len(), 2);
    }

    #[tokio::test]
    async fn test_record_turn_merges_with_stored_answers() {
        let store = InMemoryProvider::new();
        let session = store.create_session("alice").await.unwrap();

        // Two turns computed from the same snapshot land one after the other.
        let first = BTreeMap::from([("q1".to_string(), "Acme".to_string())]);
        let second = BTreeMap::from([
            ("q1".to_string(), "Globex".to_string()),
            ("q2".to_string(), "Jan 1".to_string()),
        ]);
        store
            .record_turn(&session.id, &first, &[ConversationMessage::user("Acme")])
            .await
            .unwrap();
        let stored = store
            .record_turn(&session.id, &second, &[ConversationMessage::user("Jan 1")])
            .await
            .unwrap();

        assert_eq!(stored.answered_question_ids.len(), 2);
        assert_eq!(stored.answers["q1"], "Acme");
        assert_eq!(stored.answers["q2"], "Jan 1");
        assert_eq!(stored.current_question_index, 2);
        assert_eq!(stored.history.len(), 2);
    }
}
