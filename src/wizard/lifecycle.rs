//! Session state machine: `Unbound -> InProgress -> Complete`.
//!
//! Every turn reloads the session from the store, so a session left behind
//! by a dropped connection is picked up in whatever state its last
//! persisted turn produced. Nothing is written until all external calls for
//! the turn have succeeded, and then the turn lands in a single store write.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::domain::{ConversationMessage, Session, SessionState, Template};
use crate::error::{WizardError, with_timeout};
use crate::llm::tokens::window_history;
use crate::persistence::PersistenceLayer;
use crate::protocol::{QuestionPayload, ServerMessage};

use super::analyzer::AnswerAnalyzer;
use super::matcher::TemplateMatcher;

/// Result of one user turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Send the message and keep the connection open.
    Reply(ServerMessage),
    /// Send the message, then close the connection.
    Complete(ServerMessage),
}

impl TurnOutcome {
    #[must_use]
    pub fn message(&self) -> &ServerMessage {
        match self {
            Self::Reply(m) | Self::Complete(m) => m,
        }
    }
}

pub struct SessionManager {
    store: Arc<dyn PersistenceLayer>,
    matcher: TemplateMatcher,
    analyzer: AnswerAnalyzer,
    store_timeout: Duration,
    history_token_budget: usize,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("store", &self.store)
            .field("matcher", &self.matcher)
            .field("history_token_budget", &self.history_token_budget)
            .finish()
    }
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn PersistenceLayer>,
        matcher: TemplateMatcher,
        analyzer: AnswerAnalyzer,
        store_timeout: Duration,
        history_token_budget: usize,
    ) -> Self {
        Self {
            store,
            matcher,
            analyzer,
            store_timeout,
            history_token_budget,
        }
    }

    pub fn store(&self) -> &Arc<dyn PersistenceLayer> {
        &self.store
    }

    async fn read<T, F>(&self, fut: F) -> Result<T, WizardError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        with_timeout("store", self.store_timeout, async {
            fut.await.map_err(|e| WizardError::store_unavailable(&e))
        })
        .await
    }

    async fn write<T, F>(&self, fut: F) -> Result<T, WizardError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        with_timeout("store", self.store_timeout, async {
            fut.await.map_err(|e| WizardError::persistence(&e))
        })
        .await
    }

    /// Resume the user's incomplete session, or start a new one.
    ///
    /// Returns the session id and the greeting frame for the connection.
    pub async fn resume_or_create(
        &self,
        user_id: &str,
    ) -> Result<(String, ServerMessage), WizardError> {
        if let Some(session) = self.read(self.store.find_incomplete_session(user_id)).await? {
            info!(
                name: "wizard.session.resumed",
                user_id = %user_id,
                session_id = %session.id,
                history_len = session.history.len(),
                "Resumed incomplete session"
            );
            let message = ServerMessage::SessionResumed {
                session_id: session.id.clone(),
                history: session.history,
            };
            return Ok((session.id, message));
        }

        let session = self.write(self.store.create_session(user_id)).await?;
        info!(
            name: "wizard.session.created",
            user_id = %user_id,
            session_id = %session.id,
            "Created new session"
        );
        let message = ServerMessage::SessionStarted {
            session_id: session.id.clone(),
        };
        Ok((session.id, message))
    }

    /// Process one user message for `session_id`.
    pub async fn handle_user_message(
        &self,
        session_id: &str,
        content: &str,
    ) -> Result<TurnOutcome, WizardError> {
        let session = self
            .read(self.store.get_session(session_id))
            .await?
            .ok_or_else(|| WizardError::SessionNotFound(session_id.to_string()))?;

        match session.state() {
            SessionState::Unbound => self.classify_turn(&session, content).await,
            SessionState::InProgress => self.answer_turn(session, content).await,
            SessionState::Complete => {
                let template = self.load_template(&session).await?;
                self.finalize(&session, &template).await
            }
        }
    }

    async fn load_template(&self, session: &Session) -> Result<Template, WizardError> {
        let template_id = session
            .template_id
            .as_deref()
            .ok_or_else(|| WizardError::TemplateNotFound(String::new()))?;
        self.read(self.store.get_template(template_id))
            .await?
            .ok_or_else(|| WizardError::TemplateNotFound(template_id.to_string()))
    }

    async fn classify_turn(
        &self,
        session: &Session,
        content: &str,
    ) -> Result<TurnOutcome, WizardError> {
        let outcome = self.matcher.classify(content).await?;

        let turn = [
            ConversationMessage::user(content),
            ConversationMessage::assistant(outcome.opening_question.text.clone()),
        ];
        let bound = self
            .write(
                self.store
                    .bind_template_with_history(&session.id, &outcome.template.id, &turn),
            )
            .await?;
        if !bound {
            return Err(WizardError::Persistence(format!(
                "session {} was bound by a concurrent turn",
                session.id
            )));
        }

        info!(
            name: "wizard.template.bound",
            session_id = %session.id,
            template_id = %outcome.template.id,
            score = outcome.score,
            "Bound template to session"
        );

        Ok(TurnOutcome::Reply(ServerMessage::NextQuestion {
            session_id: session.id.clone(),
            question: outcome.opening_question,
        }))
    }

    async fn answer_turn(
        &self,
        session: Session,
        content: &str,
    ) -> Result<TurnOutcome, WizardError> {
        let template = self.load_template(&session).await?;
        let remaining = session.remaining_questions(&template);
        if remaining.is_empty() {
            return self.finalize(&session, &template).await;
        }

        let history = window_history(&session.history, self.history_token_budget);
        let analysis = self.analyzer.analyze(content, &remaining, &history).await?;
        let answered: BTreeMap<String, String> = analysis.answered.into_iter().collect();

        let mut turn = vec![ConversationMessage::user(content)];
        let next_question = if remaining.iter().all(|q| answered.contains_key(&q.id)) {
            None
        } else {
            let question = analysis.next_question.ok_or_else(|| WizardError::MalformedResponse {
                service: "completion",
                detail: "no next question while questions remain".to_string(),
            })?;
            turn.push(ConversationMessage::assistant(question.text.clone()));
            Some(question)
        };

        // The store merges into whatever is there now, which may include a
        // turn that committed while this one was waiting on the analyzer.
        let stored = self
            .write(self.store.record_turn(&session.id, &answered, &turn))
            .await?;
        debug!(
            session_id = %stored.id,
            added = answered.len(),
            answered = stored.answered_question_ids.len(),
            "recorded turn"
        );

        let open = stored.remaining_questions(&template);
        let Some(first_open) = open.first() else {
            return self.finalize(&stored, &template).await;
        };
        let question = match next_question {
            Some(q) if open.iter().any(|o| o.id == q.id) => q,
            _ => QuestionPayload::new(first_open.id.clone(), first_open.text.clone()),
        };

        Ok(TurnOutcome::Reply(ServerMessage::NextQuestion {
            session_id: stored.id.clone(),
            question,
        }))
    }

    /// Create the session's document and flip it to complete.
    ///
    /// Safe to repeat: the document is created at most once per session.
    async fn finalize(
        &self,
        session: &Session,
        template: &Template,
    ) -> Result<TurnOutcome, WizardError> {
        let document = self
            .write(self.store.create_document(
                &session.user_id,
                &session.id,
                &template.id,
                &session.answers,
            ))
            .await?;
        let flipped = self.write(self.store.mark_complete(&session.id)).await?;

        if flipped {
            info!(
                name: "wizard.session.completed",
                session_id = %session.id,
                template_id = %template.id,
                document_id = %document.id,
                "Session complete"
            );
        }

        Ok(TurnOutcome::Complete(ServerMessage::SessionComplete {
            session_id: session.id.clone(),
            document_id: document.id,
        }))
    }

    /// Delete incomplete sessions untouched since `older_than`.
    pub async fn cleanup_stale(&self, older_than: DateTime<Utc>) -> Result<u64, WizardError> {
        self.write(self.store.delete_stale_incomplete_sessions(older_than))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GeneratedDocument, Question, TemplateMatch};
    use crate::llm::{CompletionService, ServiceError};
    use crate::persistence::providers::memory::InMemoryProvider;
    use crate::wizard::fakes::{KeywordEmbedder, ScriptedCompletion};
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    struct Harness<S = InMemoryProvider> {
        manager: Arc<SessionManager>,
        store: Arc<S>,
        completion: Arc<ScriptedCompletion>,
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(InMemoryProvider::new())).await
    }

    async fn harness_with<S: PersistenceLayer + 'static>(store: Arc<S>) -> Harness<S> {
        let completion = Arc::new(ScriptedCompletion::default());
        let manager = manager_for(store.clone(), completion.clone()).await;
        Harness {
            manager: Arc::new(manager),
            store,
            completion,
        }
    }

    async fn manager_for(
        store: Arc<dyn PersistenceLayer>,
        completion: Arc<dyn CompletionService>,
    ) -> SessionManager {
        let template = Template {
            id: "nda".into(),
            name: "Mutual NDA".into(),
            description: None,
            questions: vec![
                Question::new("q1", "Who are the parties?"),
                Question::new("q2", "What is the effective date?"),
                Question::new("q3", "Which state's law governs?"),
            ],
        };
        store.save_template(&template, &[1.0, 0.0]).await.unwrap();

        let timeout = Duration::from_secs(5);
        let matcher = TemplateMatcher::new(
            Arc::new(KeywordEmbedder::new(vec!["nda", "lease"])),
            completion.clone(),
            store.clone(),
            0.75,
            timeout,
        );
        let analyzer = AnswerAnalyzer::new(completion, timeout);
        SessionManager::new(store, matcher, analyzer, timeout, 3000)
    }

    /// In-memory store whose writes can be made to fail one operation at a time.
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: InMemoryProvider,
        failing: Mutex<Option<&'static str>>,
    }

    impl FlakyStore {
        fn fail_on(&self, op: &'static str) {
            *self.failing.lock().unwrap() = Some(op);
        }

        fn heal(&self) {
            *self.failing.lock().unwrap() = None;
        }

        fn check(&self, op: &'static str) -> anyhow::Result<()> {
            if *self.failing.lock().unwrap() == Some(op) {
                anyhow::bail!("{op}: connection reset");
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl PersistenceLayer for FlakyStore {
        async fn find_incomplete_session(&self, user_id: &str) -> anyhow::Result<Option<Session>> {
            self.inner.find_incomplete_session(user_id).await
        }

        async fn create_session(&self, user_id: &str) -> anyhow::Result<Session> {
            self.check("create_session")?;
            self.inner.create_session(user_id).await
        }

        async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
            self.inner.get_session(session_id).await
        }

        async fn bind_template_with_history(
            &self,
            session_id: &str,
            template_id: &str,
            messages: &[ConversationMessage],
        ) -> anyhow::Result<bool> {
            self.check("bind_template_with_history")?;
            self.inner
                .bind_template_with_history(session_id, template_id, messages)
                .await
        }

        async fn record_turn(
            &self,
            session_id: &str,
            answered: &BTreeMap<String, String>,
            messages: &[ConversationMessage],
        ) -> anyhow::Result<Session> {
            self.check("record_turn")?;
            self.inner.record_turn(session_id, answered, messages).await
        }

        async fn mark_complete(&self, session_id: &str) -> anyhow::Result<bool> {
            self.check("mark_complete")?;
            self.inner.mark_complete(session_id).await
        }

        async fn delete_stale_incomplete_sessions(
            &self,
            older_than: DateTime<Utc>,
        ) -> anyhow::Result<u64> {
            self.inner.delete_stale_incomplete_sessions(older_than).await
        }

        async fn get_template(&self, template_id: &str) -> anyhow::Result<Option<Template>> {
            self.inner.get_template(template_id).await
        }

        async fn save_template(&self, template: &Template, embedding: &[f32]) -> anyhow::Result<()> {
            self.inner.save_template(template, embedding).await
        }

        async fn find_best_template(
            &self,
            query_vec: &[f32],
            min_score: f32,
        ) -> anyhow::Result<Option<TemplateMatch>> {
            self.inner.find_best_template(query_vec, min_score).await
        }

        async fn create_document(
            &self,
            user_id: &str,
            session_id: &str,
            template_id: &str,
            data: &BTreeMap<String, String>,
        ) -> anyhow::Result<GeneratedDocument> {
            self.check("create_document")?;
            self.inner
                .create_document(user_id, session_id, template_id, data)
                .await
        }

        async fn get_document_for_session(
            &self,
            session_id: &str,
        ) -> anyhow::Result<Option<GeneratedDocument>> {
            self.inner.get_document_for_session(session_id).await
        }
    }

    /// Holds one JSON completion after it is drawn, until released.
    struct GatedCompletion {
        inner: Arc<ScriptedCompletion>,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl GatedCompletion {
        fn new(inner: Arc<ScriptedCompletion>) -> Self {
            Self {
                inner,
                armed: AtomicBool::new(false),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl CompletionService for GatedCompletion {
        async fn complete(&self, prompt: &str, context: Option<&str>) -> Result<String, ServiceError> {
            self.inner.complete(prompt, context).await
        }

        async fn complete_json(
            &self,
            prompt: &str,
            context: Option<&str>,
        ) -> Result<Value, ServiceError> {
            let result = self.inner.complete_json(prompt, context).await;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            result
        }
    }

    #[tokio::test]
    async fn test_new_user_gets_session_started() {
        let h = harness().await;
        let (session_id, msg) = h.manager.resume_or_create("alice").await.unwrap();
        assert_eq!(msg, ServerMessage::SessionStarted { session_id });
    }

    #[tokio::test]
    async fn test_classification_miss_leaves_session_unbound() {
        let h = harness().await;
        let (sid, _) = h.manager.resume_or_create("alice").await.unwrap();

        let err = h
            .manager
            .handle_user_message(&sid, "help me with a lease")
            .await
            .unwrap_err();
        assert!(matches!(err, WizardError::ClassificationMiss));

        let session = h.store.get_session(&sid).await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Unbound);
        assert!(session.history.is_empty());
    }

    #[tokio::test]
    async fn test_full_flow_with_preemptive_answer() {
        let h = harness().await;
        let (sid, _) = h.manager.resume_or_create("alice").await.unwrap();

        h.completion.push_text("Who are the parties to the NDA?");
        let outcome = h
            .manager
            .handle_user_message(&sid, "I need an NDA between Acme Inc and Beta LLC")
            .await
            .unwrap();
        assert!(matches!(
            outcome.message(),
            ServerMessage::NextQuestion { question, .. } if question.id == "q1"
        ));
        let session = h.store.get_session(&sid).await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::InProgress);
        assert!(session.answered_question_ids.is_empty());

        h.completion.push_json(json!({
            "answered_question_ids": ["q1", "q2"],
            "answers": { "q1": "Acme Inc and Beta LLC", "q2": "March 1st" },
            "next_question_id": "q3",
            "next_question": "Which state's law governs?"
        }));
        let outcome = h
            .manager
            .handle_user_message(&sid, "Acme and Beta, effective March 1st")
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Reply(_)));
        let session = h.store.get_session(&sid).await.unwrap().unwrap();
        assert_eq!(session.answered_question_ids.len(), 2);
        assert_eq!(session.current_question_index, 2);

        h.completion.push_json(json!({
            "answered_question_ids": ["q3"],
            "answers": { "q3": "Delaware" }
        }));
        let outcome = h
            .manager
            .handle_user_message(&sid, "Delaware")
            .await
            .unwrap();
        let TurnOutcome::Complete(ServerMessage::SessionComplete { document_id, .. }) = outcome
        else {
            panic!("expected completion, got {outcome:?}");
        };

        let doc = h.store.get_document_for_session(&sid).await.unwrap().unwrap();
        assert_eq!(doc.id, document_id);
        assert_eq!(doc.data.get("q3").map(String::as_str), Some("Delaware"));
        assert_eq!(h.store.document_count().await, 1);
        assert!(h.store.find_incomplete_session("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dependency_failure_persists_nothing() {
        let h = harness().await;
        let (sid, _) = h.manager.resume_or_create("alice").await.unwrap();
        h.completion.push_text("Who are the parties?");
        h.manager.handle_user_message(&sid, "an nda please").await.unwrap();
        let before = h.store.get_session(&sid).await.unwrap().unwrap();

        h.completion
            .push_json_err(crate::llm::ServiceError::Unavailable("503".into()));
        let err = h
            .manager
            .handle_user_message(&sid, "Acme and Beta")
            .await
            .unwrap_err();
        assert!(matches!(err, WizardError::DependencyUnavailable { .. }));

        let after = h.store.get_session(&sid).await.unwrap().unwrap();
        assert_eq!(before.history, after.history);
        assert_eq!(before.answered_question_ids, after.answered_question_ids);
    }

    #[tokio::test]
    async fn test_duplicate_turn_is_absorbed() {
        let h = harness().await;
        let (sid, _) = h.manager.resume_or_create("alice").await.unwrap();
        h.completion.push_text("Who are the parties?");
        h.manager.handle_user_message(&sid, "nda").await.unwrap();

        for _ in 0..2 {
            h.completion.push_json(json!({
                "answered_question_ids": ["q1"],
                "next_question": "What is the effective date?"
            }));
        }
        h.manager.handle_user_message(&sid, "Acme and Beta").await.unwrap();
        let second = h
            .manager
            .handle_user_message(&sid, "Acme and Beta")
            .await
            .unwrap();

        // q1 is no longer offered, so the repeat answers nothing new.
        assert!(matches!(second, TurnOutcome::Reply(ServerMessage::NextQuestion { .. })));
        let session = h.store.get_session(&sid).await.unwrap().unwrap();
        assert_eq!(session.answered_question_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_resume_replays_history_without_new_question() {
        let h = harness().await;
        let (sid, _) = h.manager.resume_or_create("alice").await.unwrap();
        h.completion.push_text("Who are the parties?");
        h.manager.handle_user_message(&sid, "nda").await.unwrap();

        let (resumed_id, msg) = h.manager.resume_or_create("alice").await.unwrap();
        assert_eq!(resumed_id, sid);
        let ServerMessage::SessionResumed { history, .. } = msg else {
            panic!("expected resume");
        };
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "Who are the parties?");
        assert_eq!(h.completion.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session_is_reported() {
        let h = harness().await;
        let err = h.manager.handle_user_message("missing", "hi").await.unwrap_err();
        assert!(matches!(err, WizardError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_bind_leaves_session_unbound() {
        let h = harness_with(Arc::new(FlakyStore::default())).await;
        let (sid, _) = h.manager.resume_or_create("alice").await.unwrap();

        h.store.fail_on("bind_template_with_history");
        h.completion.push_text("Who are the parties?");
        let err = h
            .manager
            .handle_user_message(&sid, "an nda please")
            .await
            .unwrap_err();
        assert!(matches!(err, WizardError::Persistence(_)));

        let session = h.store.get_session(&sid).await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Unbound);
        assert!(session.history.is_empty());

        // Resending the message classifies from scratch.
        h.store.heal();
        h.completion.push_text("Who are the parties?");
        let outcome = h
            .manager
            .handle_user_message(&sid, "an nda please")
            .await
            .unwrap();
        assert!(matches!(
            outcome.message(),
            ServerMessage::NextQuestion { question, .. } if question.id == "q1"
        ));
        let session = h.store.get_session(&sid).await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::InProgress);
        assert_eq!(session.history.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_answer_write_discards_whole_turn() {
        let h = harness_with(Arc::new(FlakyStore::default())).await;
        let (sid, _) = h.manager.resume_or_create("alice").await.unwrap();
        h.completion.push_text("Who are the parties?");
        h.manager.handle_user_message(&sid, "an nda please").await.unwrap();

        let answer = json!({
            "answered_question_ids": ["q1"],
            "answers": { "q1": "Acme and Beta" },
            "next_question_id": "q2",
            "next_question": "What is the effective date?"
        });
        h.store.fail_on("record_turn");
        h.completion.push_json(answer.clone());
        let err = h
            .manager
            .handle_user_message(&sid, "Acme and Beta")
            .await
            .unwrap_err();
        assert!(matches!(err, WizardError::Persistence(_)));

        let session = h.store.get_session(&sid).await.unwrap().unwrap();
        assert!(session.answered_question_ids.is_empty());
        assert_eq!(session.history.len(), 2);

        h.store.heal();
        h.completion.push_json(answer);
        let outcome = h
            .manager
            .handle_user_message(&sid, "Acme and Beta")
            .await
            .unwrap();
        assert!(matches!(
            outcome.message(),
            ServerMessage::NextQuestion { question, .. } if question.id == "q2"
        ));
        let session = h.store.get_session(&sid).await.unwrap().unwrap();
        assert_eq!(session.answered_question_ids.len(), 1);
        assert_eq!(session.history.len(), 4);
        assert_eq!(session.history[3].content, "What is the effective date?");
    }

    #[tokio::test]
    async fn test_interrupted_completion_finishes_on_next_message() {
        let h = harness_with(Arc::new(FlakyStore::default())).await;
        let (sid, _) = h.manager.resume_or_create("alice").await.unwrap();
        h.completion.push_text("Who are the parties?");
        h.manager.handle_user_message(&sid, "an nda please").await.unwrap();

        h.store.fail_on("mark_complete");
        h.completion.push_json(json!({
            "answered_question_ids": ["q1", "q2", "q3"],
            "answers": { "q1": "Acme and Beta", "q2": "March 1st", "q3": "Delaware" }
        }));
        let err = h
            .manager
            .handle_user_message(&sid, "Acme and Beta, March 1st, Delaware")
            .await
            .unwrap_err();
        assert!(matches!(err, WizardError::Persistence(_)));
        let first_doc = h.store.inner.get_document_for_session(&sid).await.unwrap().unwrap();

        // Still incomplete, so a reconnect resumes it.
        let (resumed, msg) = h.manager.resume_or_create("alice").await.unwrap();
        assert_eq!(resumed, sid);
        assert!(matches!(msg, ServerMessage::SessionResumed { .. }));

        h.store.heal();
        let calls = h.completion.call_count();
        let outcome = h.manager.handle_user_message(&sid, "hello?").await.unwrap();
        let TurnOutcome::Complete(ServerMessage::SessionComplete { document_id, .. }) = outcome
        else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(document_id, first_doc.id);
        assert_eq!(h.store.inner.document_count().await, 1);
        assert_eq!(h.completion.call_count(), calls);
        assert!(h.store.get_session(&sid).await.unwrap().unwrap().complete);
    }

    #[tokio::test]
    async fn test_failed_session_create_is_reported() {
        let h = harness_with(Arc::new(FlakyStore::default())).await;
        h.store.fail_on("create_session");

        let err = h.manager.resume_or_create("alice").await.unwrap_err();
        assert!(matches!(err, WizardError::Persistence(_)));
        assert_eq!(h.store.inner.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_document_write_keeps_session_open() {
        let h = harness_with(Arc::new(FlakyStore::default())).await;
        let (sid, _) = h.manager.resume_or_create("alice").await.unwrap();
        h.completion.push_text("Who are the parties?");
        h.manager.handle_user_message(&sid, "an nda please").await.unwrap();

        h.store.fail_on("create_document");
        h.completion.push_json(json!({
            "answered_question_ids": ["q1", "q2", "q3"],
            "answers": { "q1": "Acme and Beta", "q2": "March 1st", "q3": "Delaware" }
        }));
        let err = h
            .manager
            .handle_user_message(&sid, "Acme and Beta, March 1st, Delaware")
            .await
            .unwrap_err();
        assert!(matches!(err, WizardError::Persistence(_)));
        assert_eq!(h.store.inner.document_count().await, 0);
        assert!(!h.store.get_session(&sid).await.unwrap().unwrap().complete);

        h.store.heal();
        let outcome = h.manager.handle_user_message(&sid, "hello?").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Complete(_)));
        assert_eq!(h.store.inner.document_count().await, 1);
    }

    #[tokio::test]
    async fn test_fully_answered_session_completes_once() {
        let h = harness().await;
        let mut session = Session::new("alice");
        session.template_id = Some("nda".into());
        session.merge_answers([
            ("q1".to_string(), "Acme and Beta".to_string()),
            ("q2".to_string(), "March 1st".to_string()),
            ("q3".to_string(), "Delaware".to_string()),
        ]);
        let sid = session.id.clone();
        h.store.put_session(session).await;

        let first = h.manager.handle_user_message(&sid, "anything else?").await.unwrap();
        let second = h.manager.handle_user_message(&sid, "hello?").await.unwrap();

        assert!(matches!(first, TurnOutcome::Complete(_)));
        assert_eq!(first, second);
        assert_eq!(h.store.document_count().await, 1);
        assert_eq!(h.completion.call_count(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_turns_keep_each_others_answers() {
        let store = Arc::new(InMemoryProvider::new());
        let scripted = Arc::new(ScriptedCompletion::default());
        let gated = Arc::new(GatedCompletion::new(scripted.clone()));
        let manager = Arc::new(manager_for(store.clone(), gated.clone()).await);

        let (sid, _) = manager.resume_or_create("alice").await.unwrap();
        scripted.push_text("Who are the parties?");
        manager.handle_user_message(&sid, "an nda please").await.unwrap();

        // The first turn is held inside the analyzer while a second turn,
        // read from the same snapshot, commits.
        scripted.push_json(json!({
            "answered_question_ids": ["q2"],
            "answers": { "q2": "March 1st" },
            "next_question_id": "q3",
            "next_question": "Which state's law governs?"
        }));
        scripted.push_json(json!({
            "answered_question_ids": ["q1"],
            "answers": { "q1": "Acme and Beta" },
            "next_question_id": "q2",
            "next_question": "What is the effective date?"
        }));
        gated.armed.store(true, Ordering::SeqCst);
        let held = {
            let manager = Arc::clone(&manager);
            let sid = sid.clone();
            tokio::spawn(async move {
                manager
                    .handle_user_message(&sid, "effective March 1st")
                    .await
            })
        };
        gated.entered.notified().await;

        manager.handle_user_message(&sid, "Acme and Beta").await.unwrap();
        gated.release.notify_one();
        let outcome = held.await.unwrap().unwrap();

        assert!(matches!(
            outcome.message(),
            ServerMessage::NextQuestion { question, .. } if question.id == "q3"
        ));
        let session = store.get_session(&sid).await.unwrap().unwrap();
        assert_eq!(session.answered_question_ids.len(), 2);
        assert_eq!(session.answers["q1"], "Acme and Beta");
        assert_eq!(session.answers["q2"], "March 1st");
        assert_eq!(session.current_question_index, 2);
    }
}
