// lingualoom - chaptered literary translation pipeline
//
// Translates long-form fiction chapter by chapter, maintaining a
// persistent glossary of character names, places, and other recurring
// terms so that translations stay consistent across chapters and
// chunks within a chapter.
//
// Architecture:
// - provider: vendor-agnostic chat completion adapters (OpenAI, Anthropic, Gemini)
// - store: SQLite-backed entities/books/chapters/queue persistence
// - prompt: system prompt composition with glossary injection
// - orchestrator: per-chapter chunking, streaming, and chunk merge
// - reconcile: duplicate-entity conflict detection and resolution
// - worker: background queue-consuming loop
// - cli: thin clap-derived command surface over the above

mod cli;
mod config;
mod error;
mod orchestrator;
mod prompt;
mod provider;
mod ratio;
mod reconcile;
mod store;
mod worker;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use config::Config;
use provider::registry::ProviderRegistry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle config subcommands first - they're synchronous and exit early.
    if cli::handle_cli(&cli) {
        return Ok(());
    }

    // Ensure config template exists (helps users discover options)
    Config::ensure_config_exists();

    let config = Config::from_env();

    let default_filter = format!("lingualoom={}", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();

    tracing::info!(version = config::VERSION, data_dir = %config.data_dir.display(), "starting lingualoom");

    let registry_path = config.data_dir.join("providers.json");
    let registry = ProviderRegistry::load(registry_path.exists().then(|| registry_path.as_path()))?;

    let store = store::Store::open(config.data_dir.join("lingualoom.db"))?;
    let http_client = reqwest::Client::new();

    match cli.command {
        Some(command) => cli::run_async(command, &store, &registry, &config, http_client).await,
        None => {
            // No subcommand: run the background worker loop in the foreground.
            let spec = registry.parse_spec(&config.translation_model)?;
            let provider = registry.build(&spec, http_client)?;
            let shutdown = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
            let ctx = worker::WorkerContext {
                store,
                provider,
                model: spec.model,
                max_chars: registry.max_chars_for(&spec.provider_key, config.max_chars),
                max_output_tokens: config.max_output_tokens,
                stream: config.stream,
                ratio_store: ratio::RatioStore::new(&config.data_dir),
                poll_interval: std::time::Duration::from_secs(5),
            };

            let worker_shutdown = shutdown.clone();
            let worker_handle = tokio::spawn(async move { worker::run_worker_loop(ctx, &worker_shutdown).await });

            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received shutdown signal, finishing in-flight chapter");
            shutdown.store(true, std::sync::atomic::Ordering::Relaxed);

            worker_handle.await?;
            Ok(())
        }
    }
}
