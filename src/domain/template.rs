use serde::{Deserialize, Serialize};

/// One required field of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
}

impl Question {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// A document type with an ordered, immutable list of questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub questions: Vec<Question>,
}

impl Template {
    #[must_use]
    pub fn question(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    #[must_use]
    pub fn contains_question(&self, id: &str) -> bool {
        self.question(id).is_some()
    }

    /// Text embedded to place this template in vector space.
    #[must_use]
    pub fn embedding_text(&self) -> String {
        let mut text = match &self.description {
            Some(desc) => format!("{}: {}", self.name, desc),
            None => self.name.clone(),
        };
        for q in &self.questions {
            text.push('\n');
            text.push_str(&q.text);
        }
        text
    }
}

/// Best template for a query vector, with its cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateMatch {
    pub template_id: String,
    pub score: f32,
}
