//! Conversational document wizard over WebSocket.
//!
//! A user connects, describes the document they need, and is asked the
//! questions of the best-matching template until every field is filled.
//! Answers volunteered ahead of their question are captured preemptively.
//!
//! # Architecture
//!
//! - **Gateway**: Axum WebSocket upgrade, authentication and per-connection tasks
//! - **Registry**: one live connection per user, last connection wins
//! - **Wizard**: template matching, answer analysis and the session state machine
//! - **Persistence**: in-memory, Postgres + pgvector, or `SurrealDB`
//!
//! # Modules
//!
//! - [`gateway`]: transport, identity and connection registry
//! - [`wizard`]: classification, extraction and session lifecycle
//! - [`llm`]: completion and embedding clients
//! - [`persistence`]: session, template and document storage
//! - [`protocol`]: wire messages

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod telemetry;
pub mod wizard;

use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::gateway::Gateway;
use crate::gateway::auth::IdentityProvider;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry and session manager.
    pub gateway: Arc<Gateway>,
    /// Validates the credential presented on upgrade.
    pub identity: Arc<dyn IdentityProvider>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    pub fn new(gateway: Gateway, identity: Arc<dyn IdentityProvider>, config: Arc<AppConfig>) -> Self {
        Self {
            gateway: Arc::new(gateway),
            identity,
            config,
            started_at: Instant::now(),
        }
    }
}
