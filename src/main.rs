//! Document wizard server.
//!
//! Entry point: load configuration, initialize logging, serve `/ws` and `/health`.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use dotenvy::dotenv;
use tracing::error;

use doc_wizard::config::{AppConfig, load_llm_settings};
use doc_wizard::{server, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    // Initialize tracing (M-LOG-STRUCTURED)
    telemetry::init();

    let config = AppConfig::load()?;
    config.validate()?;

    let settings = load_llm_settings().map_err(|e| {
        error!("{e}");
        anyhow::anyhow!(e)
    })?;

    server::start_server(Arc::new(config), settings).await
}
