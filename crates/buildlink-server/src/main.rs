//! buildlink build executor.
//!
//! Run:
//!   buildlink-server keygen
//!   buildlink-server serve --config executor.toml
//!   buildlink-server issue-token --public-key <KEY> --request build.json

use anyhow::Context;
use buildlink_core::BuildRequest;
use buildlink_server::{
    AppState, Builder, KeyPair, MemoryRegistry, ServerConfig, StagingEngine, Token,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "buildlink-server")]
#[command(about = "Remote build executor")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept builds over websocket
    Serve {
        /// Config file path
        #[arg(long, env = "BUILDLINK_CONFIG")]
        config: Option<PathBuf>,
        /// Listen address (overrides config)
        #[arg(long, env = "BUILDLINK_LISTEN")]
        listen: Option<String>,
        /// Builder instance ID tokens must be issued for (overrides config)
        #[arg(long, env = "BUILDLINK_BUILDER_UUID")]
        builder_uuid: Option<String>,
    },
    /// Print a fresh executor key pair
    Keygen,
    /// Seal a build request into a token for an executor
    IssueToken {
        /// The executor's public key, standard base64
        #[arg(long, env = "BUILDLINK_PUBLIC_KEY")]
        public_key: String,
        /// JSON file holding the build request
        #[arg(long)]
        request: PathBuf,
        #[arg(long, default_value = "")]
        builder_uuid: String,
        #[arg(long, default_value = "")]
        push_repo: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            builder_uuid,
        } => {
            let mut config = match config {
                Some(path) => ServerConfig::load(&path)?,
                None => ServerConfig::default(),
            };
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(builder_uuid) = builder_uuid {
                config.builder_uuid = builder_uuid;
            }
            init_tracing(config.log_level.as_deref())?;
            serve(config).await
        }
        Commands::Keygen => {
            let keys = KeyPair::generate();
            println!("public_key = {:?}", keys.public_base64());
            println!("secret_key = {:?}", keys.secret_base64());
            Ok(())
        }
        Commands::IssueToken {
            public_key,
            request,
            builder_uuid,
            push_repo,
        } => {
            let recipient = buildlink_server::token::public_key_from_base64(&public_key)?;
            let text = std::fs::read_to_string(&request)
                .with_context(|| format!("reading {}", request.display()))?;
            let build: BuildRequest = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", request.display()))?;
            println!(
                "{}",
                Token::new(builder_uuid, build, push_repo).seal(&recipient)?
            );
            Ok(())
        }
    }
}

fn init_tracing(level: Option<&str>) -> anyhow::Result<()> {
    let directive = level.unwrap_or("buildlink=info");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();
    Ok(())
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let keys = match &config.secret_key {
        Some(secret) => KeyPair::from_base64(secret)?,
        None => {
            let keys = KeyPair::generate();
            tracing::warn!(
                public_key = %keys.public_base64(),
                "no secret_key configured, using a throwaway key pair"
            );
            keys
        }
    };

    let registry = Arc::new(MemoryRegistry::new());
    let builder = Builder::new(Arc::new(StagingEngine::new(registry.clone())), registry)
        .parallel(config.parallel_platforms);
    let state = Arc::new(AppState::from_config(&config, &keys, builder));

    tracing::info!(
        "Starting executor [{}] with public key {}",
        config.builder_uuid,
        keys.public_base64()
    );
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    buildlink_server::serve(listener, state).await
}
