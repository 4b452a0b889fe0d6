use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The assembled answers of a completed session.
///
/// Created exactly once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub template_id: String,
    /// Question id -> answer text.
    pub data: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl GeneratedDocument {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        template_id: impl Into<String>,
        data: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            template_id: template_id.into(),
            data,
            created_at: Utc::now(),
        }
    }
}
