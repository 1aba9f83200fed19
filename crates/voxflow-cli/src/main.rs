use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use voxflow_core::config::Config;
use voxflow_engines::{EngineSet, builtin_registry};
use voxflow_gateway::GatewayState;

#[derive(Parser)]
#[command(
    name = "voxflow",
    about = "Realtime voice-interaction gateway — ASR, LLM, and TTS over one WebSocket",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (JSON5, with ${ENV_VAR} interpolation)
    #[arg(short, long, global = true, default_value = "voxflow.json5")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port override
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show resolved settings and registered engine providers
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the resolved configuration
    Show,
    /// Validate the configuration file
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    init_logging(&cli, &config.logging);

    match cli.command {
        Commands::Serve { port } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = port;
            }

            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            if !errors.is_empty() {
                for error in &errors {
                    tracing::error!("{error}");
                }
                anyhow::bail!("invalid configuration");
            }

            let registry = builtin_registry();
            let engines = EngineSet::from_config(&registry, &config.engines)?;
            engines.initialize().await?;
            tracing::info!(
                asr = %engines.asr.descriptor().provider,
                llm = %engines.llm.descriptor().provider,
                tts = %engines.tts.descriptor().provider,
                "Engines ready"
            );

            let state = Arc::new(GatewayState::new(config, engines));
            voxflow_gateway::start_gateway(state).await?;
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Check => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("configuration has {} error(s)", errors.len());
                }
                println!("configuration ok");
            }
        },

        Commands::Status => {
            let registry = builtin_registry();
            println!("voxflow v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", cli.config.display());
            println!(
                "Endpoint: ws://{}:{}{}",
                config.server.host, config.server.port, config.server.path
            );
            println!("ASR providers: {}", registry.asr_providers().join(", "));
            println!("LLM providers: {}", registry.llm_providers().join(", "));
            println!("TTS providers: {}", registry.tts_providers().join(", "));
        }
    }

    Ok(())
}

fn init_logging(cli: &Cli, logging: &voxflow_core::config::LoggingConfig) {
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        logging.level.clone()
    };
    let mut directives = vec![level];
    directives.extend(logging.filters.iter().cloned());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directives.join(",")));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
