#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use alterity_engine::gateway::{
    ChatGateway, NoopUsageSink, ProviderGateway, StderrUsageSink, TokenUsage,
};
use alterity_engine::{
    EngineSettings, PersonaGenerator, RunExecutor, SqliteSurveyStore, SurveyStore, TraitLabeler,
    Worker,
};

#[derive(Parser)]
#[command(name = "alterity", version, about = "Survey run execution engine")]
struct Cli {
    /// SQLite database (default: $ALTERITY_DB_PATH or .alterity.sqlite)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Write one JSON usage record per provider call to stderr
    #[arg(long, global = true)]
    usage_log: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    InitDb,
    /// Execute one queued survey run
    Run {
        #[arg(long)]
        run_id: i64,
    },
    /// Generate personas by interview
    Generate {
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Interview model (default: the engine default model)
        #[arg(long)]
        model: Option<String>,
    },
    /// Tag personas with a zero-shot trait label
    Label {
        #[arg(long = "trait")]
        trait_name: String,
    },
    /// Process JSON jobs from stdin, one per line
    Work,
    /// Price a token count with the configured pricing table
    Cost {
        #[arg(long)]
        model: String,
        #[arg(long)]
        prompt_tokens: u64,
        #[arg(long)]
        completion_tokens: u64,
    },
    /// Store a configuration value (JSON)
    SetConfig {
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Enable or disable a feature flag
    SetFlag {
        #[arg(long)]
        name: String,
        #[arg(long)]
        enabled: bool,
    },
}

fn build_gateway(
    usage_log: bool,
    settings: &EngineSettings,
) -> Result<Arc<dyn ChatGateway>, Box<dyn std::error::Error>> {
    let local_models = settings.local_models.clone();
    let gateway: Arc<dyn ChatGateway> = if usage_log {
        Arc::new(ProviderGateway::from_env(Arc::new(StderrUsageSink), local_models)?)
    } else {
        Arc::new(ProviderGateway::from_env(Arc::new(NoopUsageSink), local_models)?)
    };
    Ok(gateway)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("alterity_engine=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let path = cli.db.clone().unwrap_or_else(SqliteSurveyStore::default_path);
    let store = Arc::new(SqliteSurveyStore::new(&path)?);

    match cli.command {
        Commands::InitDb => {
            println!("initialized {}", path.display());
        }
        Commands::Run { run_id } => {
            let settings = EngineSettings::load(store.as_ref()).await;
            let gateway = build_gateway(cli.usage_log, &settings)?;
            let executor = RunExecutor::new(store.clone(), gateway, settings);
            let outcome = executor.execute(run_id).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.is_completed() {
                return Err(format!("run {run_id} did not complete").into());
            }
        }
        Commands::Generate { count, model } => {
            let settings = EngineSettings::load(store.as_ref()).await;
            let gateway = build_gateway(cli.usage_log, &settings)?;
            let mut generator = PersonaGenerator::new(gateway, &settings);
            if let Some(model) = model {
                generator = generator.with_model(model);
            }
            let mut rng = StdRng::from_entropy();
            let ids = generator
                .generate_batch(store.as_ref(), count, &settings.seed_pool, &mut rng)
                .await?;
            println!("{}", serde_json::to_string(&ids)?);
        }
        Commands::Label { trait_name } => {
            let settings = EngineSettings::load(store.as_ref()).await;
            let gateway = build_gateway(cli.usage_log, &settings)?;
            let labeler = TraitLabeler::new(gateway, &settings);
            let report = labeler.label(store.as_ref(), &trait_name).await?;
            println!(
                "classified {} personas; tagged {}",
                report.classified, report.updated
            );
        }
        Commands::Work => {
            let settings = EngineSettings::load(store.as_ref()).await;
            let gateway = build_gateway(cli.usage_log, &settings)?;
            let store: Arc<dyn SurveyStore> = store;
            let worker = Worker::new(store, gateway);
            let stats = worker.run_lines(BufReader::new(tokio::io::stdin())).await?;
            eprintln!(
                "processed {} jobs ({} failed, {} malformed)",
                stats.processed, stats.failed, stats.malformed
            );
        }
        Commands::Cost {
            model,
            prompt_tokens,
            completion_tokens,
        } => {
            let settings = EngineSettings::load(store.as_ref()).await;
            let usage = TokenUsage::new(prompt_tokens, completion_tokens);
            println!("{:.8}", settings.pricing.cost(&usage, &model));
        }
        Commands::SetConfig {
            key,
            value,
            description,
        } => {
            let value: serde_json::Value = serde_json::from_str(&value)?;
            store
                .set_configuration(&key, &value, description.as_deref())
                .await?;
            println!("set {key}");
        }
        Commands::SetFlag { name, enabled } => {
            store.set_feature_flag(&name, enabled).await?;
            println!("{name} = {enabled}");
        }
    }

    Ok(())
}
