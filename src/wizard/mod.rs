//! The document wizard: classify, question, complete.
//!
//! - [`matcher::TemplateMatcher`]: picks a template for an opening request
//! - [`analyzer::AnswerAnalyzer`]: extracts answers, including preemptive ones
//! - [`lifecycle::SessionManager`]: drives a session through its states
//! - [`catalog`]: loads template definitions and indexes them in the store

pub mod analyzer;
pub mod catalog;
pub mod lifecycle;
pub mod matcher;

pub use analyzer::{Analysis, AnswerAnalyzer};
pub use lifecycle::{SessionManager, TurnOutcome};
pub use matcher::{MatchOutcome, TemplateMatcher};
