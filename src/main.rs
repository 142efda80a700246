//! ragchat - retrieval-augmented streaming chat pipeline
//!
//! Wires the model-client backend, vector store, message store, tool
//! registry and stream orchestrator together behind a single SSE endpoint.

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

mod config;
mod error;
mod event_bus;
mod history;
mod message_store;
mod model_clients;
mod orchestrator;
mod qa_cache;
mod react_engine;
mod retriever;
mod server;
mod tools;
mod wire;

use config::{Config, PipelineConfig};
use history::HistoryManager;
use message_store::MessageStore;
use model_clients::local::LocalModelClient;
use model_clients::remote::RemoteModelClient;
use model_clients::ModelClient;
use orchestrator::{Orchestrator, OrchestratorConfig};
use qa_cache::QaCache;
use retriever::Retriever;
use tools::{external, ArgSpec, ToolDescriptor, ToolRegistry};

#[derive(Parser)]
#[command(name = "ragchat")]
#[command(about = "Retrieval-augmented streaming chat pipeline")]
struct Args {
    /// HTTP server port.
    #[arg(long, default_value = "8080")]
    port: u16,

    /// SQLite database URL for sessions/messages.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Qdrant URL for the document corpus and QA-cache collections.
    #[arg(long, env = "QDRANT_URL")]
    qdrant_url: Option<String>,

    /// Base URL of a local OpenAI-compatible inference server. Mutually
    /// exclusive with `--remote-api-key`: if a remote API key is supplied,
    /// the remote backend is used instead.
    #[arg(long, env = "LOCAL_MODEL_BASE_URL")]
    local_model_base_url: Option<String>,

    /// API key for a hosted OpenAI-compatible backend.
    #[arg(long, env = "REMOTE_MODEL_API_KEY")]
    remote_api_key: Option<String>,

    /// Base URL of the hosted backend.
    #[arg(long, env = "REMOTE_MODEL_BASE_URL", default_value = "https://api.openai.com/v1")]
    remote_model_base_url: String,

    /// Chat completion model name.
    #[arg(long, env = "CHAT_MODEL", default_value = "gpt-4o-mini")]
    chat_model: String,

    /// Embedding model name.
    #[arg(long, env = "EMBED_MODEL", default_value = "text-embedding-3-small")]
    embed_model: String,

    /// Rerank model name (optional; rerank is skipped if unset).
    #[arg(long, env = "RERANK_MODEL")]
    rerank_model: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_path = dirs::home_dir().map(|h| h.join(".ragchat").join(".env")).filter(|p| p.exists());
    if let Some(path) = env_path {
        let _ = dotenvy::from_path(&path);
    } else {
        let _ = dotenvy::dotenv();
    }

    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = Config::load();
    let pipeline_config = PipelineConfig::from_config(&config);

    let database_url = args
        .database_url
        .or(config.database_url.clone())
        .unwrap_or_else(|| "sqlite://ragchat.db".to_string());
    let qdrant_url = args.qdrant_url.or(config.qdrant_url.clone()).unwrap_or_else(|| "http://localhost:6334".to_string());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .with_context(|| format!("failed to connect to {database_url}"))?;
    let store = Arc::new(MessageStore::new(pool).await?);

    let vector_store = Arc::new(ragchat_core::vector_store::VectorStoreAdapter::connect(&qdrant_url)?);

    let model: Arc<dyn ModelClient> = build_model_client(&args, &config)?;

    let retriever = Arc::new(Retriever::new(
        vector_store.clone(),
        model.clone(),
        pipeline_config.candidate_k,
        pipeline_config.final_k,
        pipeline_config.score_floor,
        pipeline_config.dedup_epsilon,
    ));

    let history = Arc::new(HistoryManager::new(
        store.clone(),
        model.clone(),
        pipeline_config.message_threshold,
        pipeline_config.token_threshold,
    ));

    let qa_cache = Arc::new(QaCache::new(
        vector_store.clone(),
        model.clone(),
        pipeline_config.cache_hit_threshold,
        pipeline_config.dislike_invalidate,
    ));

    let tools = Arc::new(build_tool_registry());

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        history,
        qa_cache,
        model,
        retriever,
        tools,
        OrchestratorConfig {
            cache_hit_threshold: pipeline_config.cache_hit_threshold,
            request_deadline_secs: pipeline_config.request_deadline_secs,
            candidate_k: pipeline_config.candidate_k,
            final_k: pipeline_config.final_k,
            max_iterations: pipeline_config.max_iterations,
            observation_limit: ragchat_core::DEFAULT_OBSERVATION_LIMIT,
            tool_timeout_secs: pipeline_config.tool_timeout_secs,
        },
    ));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.port));
    server::run(addr, server::AppState { orchestrator }).await
}

fn build_model_client(args: &Args, config: &Config) -> Result<Arc<dyn ModelClient>> {
    let api_key = args.remote_api_key.clone().or_else(|| config.openai_api_key.clone());

    if let Some(base_url) = &args.local_model_base_url {
        tracing::info!(base_url, "using local model backend");
        let mut client = LocalModelClient::new(base_url.clone(), args.chat_model.clone(), args.embed_model.clone());
        if let Some(rerank_model) = &args.rerank_model {
            client = client.with_rerank_model(rerank_model.clone());
        }
        return Ok(Arc::new(client));
    }

    let api_key = api_key.context("a model backend is required: set --local-model-base-url or --remote-api-key")?;
    tracing::info!(base_url = %args.remote_model_base_url, "using remote model backend");
    let mut client = RemoteModelClient::new(args.remote_model_base_url.clone(), api_key, args.chat_model.clone(), args.embed_model.clone());
    if let Some(rerank_model) = &args.rerank_model {
        client = client.with_rerank_model(rerank_model.clone());
    }
    Ok(Arc::new(client))
}

/// Register the opaque external collaborator tools (spec §4.4). The
/// `knowledge_search` tool is NOT registered here: the orchestrator builds it
/// fresh per request, bound to that request's own citation sink and
/// permission level (see `orchestrator::Orchestrator::run`). External
/// endpoints are resolved from environment variables since they have no
/// sensible CLI-flag default.
fn build_tool_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    register_external(&mut registry, "web_search", "search the web for current information", external::web_search_args(), "WEB_SEARCH_ENDPOINT");
    register_external(&mut registry, "weather_query", "look up current weather for a location", external::weather_query_args(), "WEATHER_QUERY_ENDPOINT");
    register_external(&mut registry, "email_sender", "send an email on the user's behalf", external::email_sender_args(), "EMAIL_SENDER_ENDPOINT");
    register_external(&mut registry, "geocode", "resolve a postal address to coordinates", external::geocode_args(), "GEOCODE_ENDPOINT");
    register_external(&mut registry, "ip_location", "resolve an IP address to an approximate location", external::ip_location_args(), "IP_LOCATION_ENDPOINT");
    register_external(&mut registry, "poi_search", "search for points of interest near a query", external::poi_search_args(), "POI_SEARCH_ENDPOINT");
    register_external(&mut registry, "route_planning", "plan a route between an origin and a destination", external::route_planning_args(), "ROUTE_PLANNING_ENDPOINT");

    registry
}

fn register_external(registry: &mut ToolRegistry, name: &'static str, description: &'static str, args: Vec<ArgSpec>, env_var: &'static str) {
    let Ok(endpoint) = std::env::var(env_var) else {
        tracing::debug!(tool = name, env_var, "no endpoint configured, tool left unregistered");
        return;
    };
    registry.register(ToolDescriptor {
        name,
        description,
        args,
        handler: Arc::new(external::ExternalEndpointTool::new(endpoint)),
    });
}
