use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use insight_client::{ChromiumLauncher, GeckoInsightExtractor};
use insight_core::config::ScraperConfig;
use insight_core::evasion::HumanizedEvasion;
use insight_core::models::{NewToken, select_due};
use insight_core::orchestrator::{LAST_RUN_KEY, Orchestrator, TracingScrapeReporter};
use insight_core::schedule::run_on_interval;
use insight_core::traits::{InsightStore, StateStore, TokenRegistry};
use insight_db::{Database, DatabaseConfig};

type LiveOrchestrator =
    Orchestrator<ChromiumLauncher, GeckoInsightExtractor, Database, HumanizedEvasion>;

#[derive(Parser)]
#[command(name = "insight", version, about = "Token insight scraper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape every due token, now and then on a fixed interval
    Run {
        /// Minutes between passes
        #[arg(long, env = "INSIGHT_RUN_EVERY_MINUTES", default_value_t = 60)]
        every_minutes: u64,

        /// Run a single pass and exit
        #[arg(long, default_value_t = false)]
        once: bool,
    },

    /// Scrape one token immediately, due or not
    Scrape {
        /// Token id (site slug, e.g. "bitcoin")
        token: String,
    },

    /// Manage tracked tokens
    Tokens {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Show the latest stored insights as JSON
    News {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(short, long, default_value_t = 0)]
        offset: usize,
    },

    /// Show scraper status
    Status,
}

#[derive(Subcommand)]
enum TokenAction {
    /// List all tokens
    List,

    /// Start tracking a token
    Add {
        /// Token id (site slug)
        id: String,

        /// Display name (defaults to the id)
        #[arg(short, long)]
        name: Option<String>,

        /// Minutes between scrapes (defaults to SCRAPE_INTERVAL)
        #[arg(short, long)]
        interval: Option<u32>,
    },

    /// Stop tracking a token
    Remove { id: String },

    /// Include a token in scheduled passes
    Enable { id: String },

    /// Exclude a token from scheduled passes
    Disable { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("insight=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ScraperConfig::from_env().context("Invalid scraper configuration")?;
    let db = connect_db().await?;

    match cli.command {
        Commands::Run {
            every_minutes,
            once,
        } => {
            let orchestrator = build_orchestrator(db, config)?;
            if once {
                cmd_run_once(orchestrator).await?;
            } else {
                cmd_run(orchestrator, pass_interval(every_minutes)).await;
            }
        }
        Commands::Scrape { token } => {
            let mut orchestrator = build_orchestrator(db, config)?;
            let inserted = orchestrator
                .scrape_token(&token, &TracingScrapeReporter)
                .await
                .with_context(|| format!("Scrape of '{token}' failed"))?;
            println!("{token}: {inserted} new insight(s)");
        }
        Commands::Tokens { action } => cmd_tokens(&db, &config, action).await?,
        Commands::News { limit, offset } => cmd_news(&db, limit, offset).await?,
        Commands::Status => cmd_status(&db).await?,
    }

    Ok(())
}

/// Time between scheduled passes; at least one minute.
fn pass_interval(every_minutes: u64) -> Duration {
    Duration::from_secs(every_minutes.max(1).saturating_mul(60))
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

fn build_orchestrator(db: Database, config: ScraperConfig) -> Result<LiveOrchestrator> {
    let extractor = GeckoInsightExtractor::from_config(&config)?;
    let evasion = HumanizedEvasion::from_config(&config);
    Ok(Orchestrator::new(
        ChromiumLauncher::new(),
        extractor,
        db,
        evasion,
        config,
    ))
}

async fn cmd_run_once(mut orchestrator: LiveOrchestrator) -> Result<()> {
    let summary = orchestrator
        .run_all_due(&TracingScrapeReporter)
        .await
        .context("Scrape pass aborted")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn cmd_run(orchestrator: LiveOrchestrator, every: Duration) {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received, finishing current pass");
                cancel.cancel();
            }
        });
    }

    tracing::info!(every_secs = every.as_secs(), "Scheduler started");
    let orchestrator = Arc::new(Mutex::new(orchestrator));
    run_on_interval(every, cancel, || {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            let mut orchestrator = orchestrator.lock().await;
            if let Err(e) = orchestrator.run_all_due(&TracingScrapeReporter).await {
                tracing::error!(error = %e, "Scrape pass aborted");
            }
        }
    })
    .await;
}

async fn cmd_tokens(db: &Database, config: &ScraperConfig, action: TokenAction) -> Result<()> {
    match action {
        TokenAction::List => {
            let tokens = db.list_tokens().await?;
            if tokens.is_empty() {
                println!("No tokens tracked. Add one with `insight tokens add <id>`.");
                return Ok(());
            }
            for token in &tokens {
                let last = token
                    .last_scraped_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "  {:<24} {:<24} {:<8} every {:>4} min  last: {}",
                    token.id,
                    token.name,
                    if token.enabled { "enabled" } else { "disabled" },
                    token.scrape_interval_minutes,
                    last,
                );
            }
            println!("\nTotal: {} tokens", tokens.len());
        }
        TokenAction::Add { id, name, interval } => {
            let name = name.unwrap_or_else(|| id.clone());
            let interval = interval.unwrap_or(config.default_scrape_interval_minutes);
            let token = db
                .create_token(&NewToken::new(id, name, interval))
                .await
                .context("Failed to add token")?;
            println!("Tracking {} ({})", token.id, token.name);
        }
        TokenAction::Remove { id } => {
            if db.delete_token(&id).await? {
                println!("Removed {id}");
            } else {
                anyhow::bail!("No token with id '{id}'");
            }
        }
        TokenAction::Enable { id } => set_enabled(db, &id, true).await?,
        TokenAction::Disable { id } => set_enabled(db, &id, false).await?,
    }
    Ok(())
}

async fn set_enabled(db: &Database, id: &str, enabled: bool) -> Result<()> {
    if !db.set_enabled(id, enabled).await? {
        anyhow::bail!("No token with id '{id}'");
    }
    println!("{id} {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

async fn cmd_news(db: &Database, limit: usize, offset: usize) -> Result<()> {
    let insights = db.latest_insights(limit, offset).await?;
    println!("{}", serde_json::to_string_pretty(&insights)?);
    Ok(())
}

async fn cmd_status(db: &Database) -> Result<()> {
    db.health_check().await.context("Database is unreachable")?;

    let tokens = db.list_tokens().await?;
    let enabled = tokens.iter().filter(|t| t.enabled).count();
    let due = select_due(tokens.clone(), Utc::now()).len();
    let insights = db.insight_repo().count().await?;
    let last_run = db
        .get_state(LAST_RUN_KEY)
        .await?
        .unwrap_or_else(|| "never".to_string());

    println!("Database:  ok");
    println!("Tokens:    {} tracked, {enabled} enabled, {due} due", tokens.len());
    println!("Insights:  {insights}");
    println!("Last run:  {last_run}");
    Ok(())
}
