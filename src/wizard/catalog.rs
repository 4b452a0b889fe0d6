//! Template definitions on disk.
//!
//! Each `*.yaml` / `*.yml` file under the templates directory holds one
//! template:
//!
//! ```yaml
//! id: nda
//! name: Mutual Non-Disclosure Agreement
//! description: Two parties agree to keep shared information confidential.
//! questions:
//!   - id: parties
//!     text: Who are the parties to the agreement?
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::domain::Template;
use crate::llm::embedding::EmbeddingService;
use crate::persistence::PersistenceLayer;

/// Parse and validate one template file's contents.
pub fn parse_template(yaml: &str) -> Result<Template> {
    let template: Template = serde_yaml::from_str(yaml)?;

    if template.id.trim().is_empty() {
        bail!("template id is empty");
    }
    if template.questions.is_empty() {
        bail!("template {} has no questions", template.id);
    }
    let mut seen = HashSet::new();
    for q in &template.questions {
        if q.id.trim().is_empty() || q.text.trim().is_empty() {
            bail!("template {} has a question with an empty id or text", template.id);
        }
        if !seen.insert(q.id.as_str()) {
            bail!("template {} repeats question id {}", template.id, q.id);
        }
    }
    Ok(template)
}

/// Load every template under `dir`, recursively.
///
/// Unreadable or invalid files are logged and skipped. When two files share
/// an id the one visited last wins. Results are sorted by id.
pub fn load_dir(dir: &Path) -> Vec<Template> {
    let mut by_id: BTreeMap<String, Template> = BTreeMap::new();

    for entry in WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
        if !entry.file_type().is_file() || !is_yaml {
            continue;
        }

        let parsed = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))
            .and_then(|s| parse_template(&s));
        match parsed {
            Ok(template) => {
                if by_id.contains_key(&template.id) {
                    warn!(
                        template_id = %template.id,
                        path = %path.display(),
                        "Duplicate template id, replacing earlier definition"
                    );
                }
                by_id.insert(template.id.clone(), template);
            }
            Err(e) => error!("Skipping template file {:?}: {:#}", path, e),
        }
    }

    by_id.into_values().collect()
}

/// Embed each template and upsert it into the store.
///
/// Returns how many templates were indexed. A template that fails to embed
/// or save, or whose vector is not `dimension` long when one is given, is
/// logged and left out.
pub async fn seed(
    templates: &[Template],
    embedder: &dyn EmbeddingService,
    store: &dyn PersistenceLayer,
    dimension: Option<usize>,
) -> usize {
    let mut indexed = 0;
    for template in templates {
        let embedding = match embedder.embed(&template.embedding_text()).await {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to embed template {}: {}", template.id, e);
                continue;
            }
        };
        if let Some(expected) = dimension.filter(|d| *d != embedding.len()) {
            error!(
                template_id = %template.id,
                expected,
                actual = embedding.len(),
                "Embedding dimension mismatch, template not indexed"
            );
            continue;
        }
        if let Err(e) = store.save_template(template, &embedding).await {
            error!("Failed to persist template {}: {:?}", template.id, e);
            continue;
        }
        indexed += 1;
    }
    info!(indexed, total = templates.len(), "Template catalog indexed");
    indexed
}
