use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tracing::{info, warn};

use parley_ai::{ModelConfig, ModelDirectory, ProviderCache, StaticModelDirectory};
use parley_core::identity::Role;
use parley_service::{AiOrchestrator, ConversationService};
use parley_store::Database;
use parley_telemetry::TelemetryConfig;

const SUPPORT_SYSTEM_PROMPT: &str = "You are a support assistant. Answer the user's \
questions directly. When the user asks for a human, or you cannot resolve the issue, \
call the escalate_to_human_agent tool with a short reason and an urgency level.";

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Conversation server for users, agents, and AI assistants")]
struct Args {
    /// Port to listen on. 0 picks an ephemeral port.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Path to the SQLite database. Defaults to ~/.parley/parley.db.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    parley_telemetry::init_telemetry(&TelemetryConfig {
        json: args.json_logs,
        ..TelemetryConfig::default()
    });

    let db_path = match args.db {
        Some(path) => path,
        None => {
            let dir = home_dir().join(".parley");
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            dir.join("parley.db")
        }
    };
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    info!(path = %db_path.display(), "database opened");

    let directory = Arc::new(build_directory());
    let service = Arc::new(ConversationService::new(db.clone()));
    let providers = Arc::new(ProviderCache::new(directory.clone()));
    let orchestrator = Arc::new(AiOrchestrator::new(
        db,
        service.clone(),
        directory.clone(),
        providers,
    ));

    let config = parley_server::ServerConfig {
        port: args.port,
        ..parley_server::ServerConfig::default()
    };
    let handle = parley_server::start(config, service, orchestrator, directory)
        .await
        .context("failed to start server")?;
    info!(port = handle.port, "parley ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("shutting down");
    handle.shutdown();
    Ok(())
}

/// Register provider credentials from the environment and the models they
/// unlock. A missing key just leaves that provider's models out.
fn build_directory() -> StaticModelDirectory {
    let directory = StaticModelDirectory::new();

    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        directory.add_credential("anthropic", SecretString::from(key));
        directory.add_model(ModelConfig {
            model_id: "support-assistant".into(),
            provider: "anthropic".into(),
            api_identifier: "claude-3-5-sonnet-latest".into(),
            system_prompt: Some(SUPPORT_SYSTEM_PROMPT.to_string()),
            supports_tools: true,
            allowed_roles: vec![Role::User, Role::Agent, Role::Admin],
            visible_to_client: true,
        });
    }

    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        directory.add_credential("openai", SecretString::from(key));
        directory.add_model(ModelConfig {
            model_id: "support-assistant-mini".into(),
            provider: "openai".into(),
            api_identifier: "gpt-4o-mini".into(),
            system_prompt: Some(SUPPORT_SYSTEM_PROMPT.to_string()),
            supports_tools: true,
            allowed_roles: vec![Role::User, Role::Agent, Role::Admin],
            visible_to_client: true,
        });
    }

    if directory.list_models().is_empty() {
        warn!("no provider API keys configured; AI conversations will be unavailable");
    }

    directory
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
