//! Core wizard data model.
//!
//! - [`Session`]: one user's progress through one template's questions
//! - [`Template`]: a named document type with an ordered question list
//! - [`GeneratedDocument`]: the field-value map produced on completion

mod document;
mod session;
mod template;

pub use document::GeneratedDocument;
pub use session::{ConversationMessage, Role, Session, SessionState};
pub use template::{Question, Template, TemplateMatch};
