// CLI module - command-line argument parsing and handlers
//
// Provides subcommands for configuration management, book/queue/entity
// bookkeeping, and a one-off interactive translation path independent
// of the background worker loop.

use crate::config::{Config, VERSION};
use crate::provider::registry::ProviderRegistry;
use crate::reconcile::{DuplicateKind, PotentialDuplicate};
use crate::store::entities::AddOutcome;
use crate::store::Store;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::process::Command as ShellCommand;
use std::sync::atomic::AtomicBool;

/// lingualoom - chaptered literary translation pipeline
#[derive(Parser)]
#[command(name = "lingualoom")]
#[command(version = VERSION)]
#[command(about = "Chaptered literary translation pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        #[arg(long)]
        show: bool,
        #[arg(long)]
        reset: bool,
        #[arg(long)]
        edit: bool,
        #[arg(long)]
        update: bool,
        #[arg(long)]
        path: bool,
    },
    /// Manage books
    Book {
        #[command(subcommand)]
        action: BookAction,
    },
    /// Manage the translation queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Manage the entity glossary
    Entity {
        #[command(subcommand)]
        action: EntityAction,
    },
    /// Translate a chapter immediately, outside the queue/worker path
    Translate {
        book_id: i64,
        chapter_number: i64,
        /// Path to a UTF-8 text file, one source line per line
        input: std::path::PathBuf,
    },
    /// Run the background queue worker in the foreground
    Worker,
}

#[derive(Subcommand)]
pub enum BookAction {
    Add { title: String, #[arg(long)] author: Option<String>, #[arg(long, default_value = "zh")] source_language: String, #[arg(long, default_value = "en")] target_language: String },
    List,
    Show { book_id: i64 },
    Delete { book_id: i64 },
}

#[derive(Subcommand)]
pub enum QueueAction {
    List { #[arg(long)] book_id: Option<i64> },
    Remove { queue_id: i64 },
    Clear { #[arg(long)] book_id: Option<i64> },
}

#[derive(Subcommand)]
pub enum EntityAction {
    List { #[arg(long)] book_id: Option<i64>, #[arg(long)] category: Option<String> },
    Delete { category: String, untranslated: String },
    Move { category: String, untranslated: String, new_category: String },
    Audit,
}

/// Handle config subcommands, which are synchronous and exit immediately.
/// Returns true if handled (caller should exit without entering the async runtime path).
pub fn handle_cli(cli: &Cli) -> bool {
    match &cli.command {
        Some(Commands::Config { show, reset, edit, update, path }) => {
            if *path {
                handle_config_path();
            } else if *show {
                handle_config_show();
            } else if *reset {
                handle_config_reset();
            } else if *edit {
                handle_config_edit();
            } else if *update {
                handle_config_update();
            } else {
                println!("Usage: lingualoom config [--show|--reset|--edit|--update|--path]");
            }
            true
        }
        _ => false,
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => {
            eprintln!("Error: Could not determine config path");
            std::process::exit(1);
        }
    }
}

fn handle_config_show() {
    let config = Config::from_env();

    println!("# Effective configuration (env > file > defaults)");
    println!();
    println!("translation_model = {:?}", config.translation_model);
    println!("advice_model = {:?}", config.advice_model);
    println!("max_chars = {}", config.max_chars);
    println!("max_output_tokens = {}", config.max_output_tokens);
    println!("data_dir = {:?}", config.data_dir.display().to_string());
    println!("stream = {}", config.stream);
    println!("debug_mode = {}", config.debug_mode);
    println!();
    println!("[logging]");
    println!("level = {:?}", config.logging.level);

    println!();
    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("# Source: {}", path.display());
        } else {
            println!("# Source: defaults (no config file)");
        }
    }
}

fn handle_config_reset() {
    let Some(path) = Config::config_path() else {
        eprintln!("Error: Could not determine config path");
        std::process::exit(1);
    };

    if path.exists() {
        eprint!("Config file exists at {}. Overwrite? [y/N] ", path.display());
        std::io::stderr().flush().unwrap();

        let mut input = String::new();
        std::io::stdin().read_line(&mut input).unwrap();

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return;
        }
    }

    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("Error creating directory: {}", e);
            std::process::exit(1);
        }
    }

    if let Err(e) = std::fs::write(&path, Config::default().to_toml()) {
        eprintln!("Error writing config: {}", e);
        std::process::exit(1);
    }

    println!("Config reset to defaults: {}", path.display());
}

fn handle_config_edit() {
    let Some(path) = Config::config_path() else {
        eprintln!("Error: Could not determine config path");
        std::process::exit(1);
    };

    if !path.exists() {
        Config::ensure_config_exists();
        println!("Created new config file: {}", path.display());
    }

    let editor = std::env::var("EDITOR").or_else(|_| std::env::var("VISUAL")).unwrap_or_else(|_| {
        if cfg!(windows) {
            "notepad".to_string()
        } else {
            "nano".to_string()
        }
    });

    println!("Opening {} with {}", path.display(), editor);

    let status = ShellCommand::new(&editor).arg(&path).status();

    match status {
        Ok(s) if s.success() => {}
        Ok(s) => {
            eprintln!("Editor exited with status: {}", s);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to launch editor '{}': {}", editor, e);
            eprintln!("Set $EDITOR environment variable to your preferred editor");
            std::process::exit(1);
        }
    }
}

fn handle_config_update() {
    let Some(path) = Config::config_path() else {
        eprintln!("Error: Could not determine config path");
        std::process::exit(1);
    };

    if !path.exists() {
        Config::ensure_config_exists();
        println!("Created new config file: {}", path.display());
        return;
    }

    let existing = Config::from_env();
    let updated = existing.to_toml();

    let backup_path = path.with_extension("toml.bak");
    if let Err(e) = std::fs::copy(&path, &backup_path) {
        eprintln!("Warning: Could not create backup: {}", e);
    } else {
        println!("Backup created: {}", backup_path.display());
    }

    if let Err(e) = std::fs::write(&path, updated) {
        eprintln!("Error writing config: {}", e);
        std::process::exit(1);
    }

    println!("Config updated with latest structure: {}", path.display());
    println!("Your values have been preserved.");
}

/// Dispatch the async-capable subcommands (book/queue/entity/translate/worker).
/// `Commands::Config` is handled separately by `handle_cli` before the async
/// runtime does any real work.
pub async fn run_async(command: Commands, store: &Store, registry: &ProviderRegistry, config: &Config, http_client: reqwest::Client) -> Result<()> {
    match command {
        Commands::Config { .. } => Ok(()),
        Commands::Book { action } => run_book_action(action, store),
        Commands::Queue { action } => run_queue_action(action, store),
        Commands::Entity { action } => run_entity_action(action, store),
        Commands::Translate { book_id, chapter_number, input } => {
            run_translate(store, registry, config, http_client, book_id, chapter_number, input).await
        }
        Commands::Worker => {
            let spec = registry.parse_spec(&config.translation_model)?;
            let provider = registry.build(&spec, http_client)?;
            let shutdown = AtomicBool::new(false);
            let ctx = crate::worker::WorkerContext {
                store: store.clone(),
                provider,
                model: spec.model,
                max_chars: registry.max_chars_for(&spec.provider_key, config.max_chars),
                max_output_tokens: config.max_output_tokens,
                stream: config.stream,
                ratio_store: crate::ratio::RatioStore::new(&config.data_dir),
                poll_interval: std::time::Duration::from_secs(5),
            };
            crate::worker::run_worker_loop(ctx, &shutdown).await;
            Ok(())
        }
    }
}

fn run_book_action(action: BookAction, store: &Store) -> Result<()> {
    match action {
        BookAction::Add { title, author, source_language, target_language } => {
            let id = store.create_book(&title, author.as_deref(), &target_language, None, &source_language, &target_language)?;
            println!("Created book {id}: {title}");
        }
        BookAction::List => {
            for book in store.list_books()? {
                println!("{}\t{}\t{} chapters", book.id, book.title, book.chapter_count);
            }
        }
        BookAction::Show { book_id } => match store.get_book(book_id)? {
            Some(book) => println!("{book:#?}"),
            None => println!("Book {book_id} not found"),
        },
        BookAction::Delete { book_id } => {
            store.delete_book(book_id)?;
            println!("Deleted book {book_id}");
        }
    }
    Ok(())
}

fn run_queue_action(action: QueueAction, store: &Store) -> Result<()> {
    match action {
        QueueAction::List { book_id } => {
            for item in store.list_queue(book_id)? {
                println!("{}\t{}\t{}\tposition {}", item.id, item.book_title, item.title, item.position);
            }
        }
        QueueAction::Remove { queue_id } => {
            if store.remove_from_queue(queue_id)? {
                println!("Removed queue item {queue_id}");
            } else {
                println!("Queue item {queue_id} not found");
            }
        }
        QueueAction::Clear { book_id } => {
            let removed = store.clear_queue(book_id)?;
            println!("Removed {removed} queue item(s)");
        }
    }
    Ok(())
}

fn run_entity_action(action: EntityAction, store: &Store) -> Result<()> {
    match action {
        EntityAction::List { book_id, category } => {
            let entities = store.entities_for_review(book_id, category.as_deref())?;
            for (category, entries) in entities {
                for (untranslated, data) in entries {
                    println!("{category}\t{untranslated}\t{}", data.translation);
                }
            }
        }
        EntityAction::Delete { category, untranslated } => {
            if store.delete_entity(&category, &untranslated)? {
                println!("Deleted {category}/{untranslated}");
            } else {
                println!("{category}/{untranslated} not found");
            }
        }
        EntityAction::Move { category, untranslated, new_category } => {
            let outcome = store.change_entity_category(&category, &untranslated, &new_category)?;
            println!("{outcome:?}");
        }
        EntityAction::Audit => {
            let report = crate::reconcile::audit(store)?;
            for group in &report.cross_category_duplicates {
                println!("cross-category duplicate: {}", group.key);
                for entry in &group.entries {
                    println!("  {}\t{}\t{:?}", entry.category, entry.translation, entry.book_id);
                }
            }
            for group in &report.translation_collisions {
                println!("translation collision: {}", group.key);
                for entry in &group.entries {
                    println!("  {}\t{}\t{:?}", entry.category, entry.untranslated, entry.book_id);
                }
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_translate(
    store: &Store,
    registry: &ProviderRegistry,
    config: &Config,
    http_client: reqwest::Client,
    book_id: i64,
    chapter_number: i64,
    input: std::path::PathBuf,
) -> Result<()> {
    let raw = std::fs::read_to_string(&input).with_context(|| format!("reading {}", input.display()))?;
    let lines: Vec<String> = raw.lines().map(str::to_string).collect();

    let spec = registry.parse_spec(&config.translation_model)?;
    let provider = registry.build(&spec, http_client)?;
    let max_chars = registry.max_chars_for(&spec.provider_key, config.max_chars);

    let old_entities = store.load_entities(Some(book_id))?;
    let book_template = store.get_book_prompt_template(book_id)?;
    let ratio_store = crate::ratio::RatioStore::new(&config.data_dir);
    let shutdown = AtomicBool::new(false);

    let outcome = crate::orchestrator::translate_chapter(
        &lines,
        old_entities,
        book_template.as_deref(),
        provider.as_ref(),
        &spec.model,
        max_chars,
        config.max_output_tokens,
        config.stream,
        &ratio_store,
        &shutdown,
    )
    .await?;

    let mut duplicates = outcome.duplicates;
    for (category, entries) in &outcome.new_entities {
        for (untranslated, data) in entries {
            let result = store.add_entity(
                category,
                untranslated,
                &data.translation,
                Some(book_id),
                data.last_chapter.as_deref(),
                data.incorrect_translation.as_deref(),
                data.gender.as_deref(),
            )?;
            if let AddOutcome::ConflictCategory(existing_category) = result {
                let existing_translation = store
                    .entities_for_review(Some(book_id), Some(&existing_category))
                    .ok()
                    .and_then(|map| map.get(&existing_category)?.get(untranslated).map(|e| e.translation.clone()))
                    .unwrap_or_default();
                duplicates.push(PotentialDuplicate {
                    untranslated: untranslated.clone(),
                    translation: data.translation.clone(),
                    new_category: category.clone(),
                    existing_category,
                    existing_translation,
                    kind: DuplicateKind::CrossCategory,
                });
            }
        }
    }

    store.save_chapter(book_id, chapter_number, &outcome.title, &lines, &outcome.content, Some(&outcome.summary), &spec.model)?;

    println!("Translated chapter {chapter_number}: {}", outcome.title);
    println!("{} new entities discovered", outcome.new_entities.values().map(|m| m.len()).sum::<usize>());
    for duplicate in &duplicates {
        println!("warning: potential duplicate entity {} ({:?}, existing: {} = {})", duplicate.untranslated, duplicate.kind, duplicate.existing_category, duplicate.existing_translation);
    }

    Ok(())
}
