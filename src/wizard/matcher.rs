//! Retrieval classification of an opening request onto a template.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::domain::Template;
use crate::error::{WizardError, with_timeout};
use crate::llm::CompletionService;
use crate::llm::embedding::EmbeddingService;
use crate::persistence::PersistenceLayer;
use crate::protocol::QuestionPayload;

/// A successful classification.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub template: Template,
    pub score: f32,
    /// First question, phrased for the user's request.
    pub opening_question: QuestionPayload,
}

pub struct TemplateMatcher {
    embedder: Arc<dyn EmbeddingService>,
    completion: Arc<dyn CompletionService>,
    store: Arc<dyn PersistenceLayer>,
    threshold: f32,
    timeout: Duration,
}

impl std::fmt::Debug for TemplateMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateMatcher")
            .field("threshold", &self.threshold)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TemplateMatcher {
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        completion: Arc<dyn CompletionService>,
        store: Arc<dyn PersistenceLayer>,
        threshold: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            completion,
            store,
            threshold,
            timeout,
        }
    }

    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Find the template for `text` and phrase its opening question.
    ///
    /// No template at or above the threshold is [`WizardError::ClassificationMiss`].
    pub async fn classify(&self, text: &str) -> Result<MatchOutcome, WizardError> {
        let query = with_timeout("embedding", self.timeout, async {
            self.embedder
                .embed(text)
                .await
                .map_err(|e| WizardError::from_service("embedding", e))
        })
        .await?;

        let best = with_timeout("store", self.timeout, async {
            self.store
                .find_best_template(&query, self.threshold)
                .await
                .map_err(|e| WizardError::store_unavailable(&e))
        })
        .await?
        .ok_or(WizardError::ClassificationMiss)?;

        debug!(template_id = %best.template_id, score = best.score, "template candidate");

        let template = with_timeout("store", self.timeout, async {
            self.store
                .get_template(&best.template_id)
                .await
                .map_err(|e| WizardError::store_unavailable(&e))
        })
        .await?
        .ok_or_else(|| WizardError::TemplateNotFound(best.template_id.clone()))?;

        let first = template
            .questions
            .first()
            .ok_or_else(|| WizardError::TemplateNotFound(template.id.clone()))?;

        let prompt = format!(
            "The user asked: \"{text}\"\n\
             Ask them the first question below in one friendly sentence. \
             Refer to details they already gave. Reply with the question only.\n\
             First question: {}",
            first.text
        );
        let context = template_context(&template);

        let phrased = with_timeout("completion", self.timeout, async {
            self.completion
                .complete(&prompt, Some(&context))
                .await
                .map_err(|e| WizardError::from_service("completion", e))
        })
        .await?;

        let phrased = phrased.trim();
        let opening_text = if phrased.is_empty() {
            first.text.clone()
        } else {
            phrased.to_string()
        };

        Ok(MatchOutcome {
            opening_question: QuestionPayload::new(first.id.clone(), opening_text),
            score: best.score,
            template,
        })
    }
}

/// System context describing a template to the completion service.
fn template_context(template: &Template) -> String {
    let mut ctx = format!(
        "You are a document assistant collecting the fields of a \"{}\".",
        template.name
    );
    if let Some(desc) = &template.description {
        let _ = write!(ctx, "\nDocument description: {desc}");
    }
    ctx.push_str("\nFields, in order:");
    for q in &template.questions {
        let _ = write!(ctx, "\n- {}: {}", q.id, q.text);
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Question;
    use crate::persistence::providers::memory::InMemoryProvider;
    use crate::wizard::fakes::{KeywordEmbedder, ScriptedCompletion};

    fn nda() -> Template {
        Template {
            id: "nda".into(),
            name: "Mutual NDA".into(),
            description: Some("Confidentiality agreement".into()),
            questions: vec![
                Question::new("q1", "Who are the parties?"),
                Question::new("q2", "What is the effective date?"),
            ],
        }
    }

    async fn setup(
        embedder: KeywordEmbedder,
    ) -> (TemplateMatcher, Arc<ScriptedCompletion>, Arc<InMemoryProvider>) {
        let store = Arc::new(InMemoryProvider::new());
        store.save_template(&nda(), &[1.0, 0.0]).await.unwrap();
        let completion = Arc::new(ScriptedCompletion::default());
        let matcher = TemplateMatcher::new(
            Arc::new(embedder),
            completion.clone(),
            store.clone(),
            0.75,
            Duration::from_secs(5),
        );
        (matcher, completion, store)
    }

    #[tokio::test]
    async fn test_classify_binds_best_template() {
        let (matcher, completion, _) = setup(KeywordEmbedder::new(vec!["nda", "lease"])).await;
        completion.push_text("Great, who are the two parties to the NDA?");

        let outcome = matcher
            .classify("I need an NDA between Acme Inc and Beta LLC")
            .await
            .unwrap();

        assert_eq!(outcome.template.id, "nda");
        assert_eq!(outcome.opening_question.id, "q1");
        assert_eq!(
            outcome.opening_question.text,
            "Great, who are the two parties to the NDA?"
        );

        let calls = completion.calls.lock().unwrap();
        let (prompt, context) = &calls[0];
        assert!(prompt.contains("Acme Inc"));
        assert!(context.as_deref().unwrap().contains("q2: What is the effective date?"));
    }

    #[tokio::test]
    async fn test_blank_phrasing_falls_back_to_question_text() {
        let (matcher, completion, _) = setup(KeywordEmbedder::new(vec!["nda", "lease"])).await;
        completion.push_text("   ");

        let outcome = matcher.classify("An NDA, please").await.unwrap();

        assert_eq!(outcome.opening_question.id, "q1");
        assert_eq!(outcome.opening_question.text, "Who are the parties?");
    }

    #[tokio::test]
    async fn test_below_threshold_is_a_miss() {
        let (matcher, completion, _) = setup(KeywordEmbedder::new(vec!["nda", "lease"])).await;

        let err = matcher.classify("I want to rent a flat, lease please").await.unwrap_err();
        assert!(matches!(err, WizardError::ClassificationMiss));
        assert_eq!(completion.call_count(), 0);
    }

    #[tokio::test]
    async fn test_embedding_outage_is_dependency_error() {
        let mut embedder = KeywordEmbedder::new(vec!["nda"]);
        embedder.fail = true;
        let (matcher, _, _) = setup(embedder).await;

        let err = matcher.classify("nda").await.unwrap_err();
        assert!(matches!(
            err,
            WizardError::DependencyUnavailable {
                service: "embedding",
                ..
            }
        ));
    }
}
