//! Zentinel Mock Responder - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_mock_responder::{MockService, ResponderConfig, RuleSet, Server};

#[derive(Parser, Debug)]
#[command(
    name = "zentinel-mock-responder",
    about = "Per-port stub HTTP responder backed by stored mock rules",
    version
)]
struct Args {
    /// Port to listen on
    #[arg(required_unless_present_any = ["print_config", "validate", "check_rules"])]
    port: Option<u16>,

    /// Path to configuration file
    #[arg(short, long, default_value = "mock-responder.yaml")]
    config: PathBuf,

    /// Address to bind to
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Redis URL, overrides the configured redis store
    #[arg(long, value_name = "URL", conflicts_with = "rules_dir")]
    redis_url: Option<String>,

    /// Read rule sets from <DIR>/<port>.json instead of redis
    #[arg(long, value_name = "DIR")]
    rules_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Decode a rule set document and exit
    #[arg(long, value_name = "FILE")]
    check_rules: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../config/default.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    if let Some(path) = &args.check_rules {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read rule set {}", path.display()))?;
        let rules = RuleSet::from_slice(0, &bytes)?;
        println!(
            "Rule set is valid (port {}, {} rules defined)",
            rules.port,
            rules.mocks.len()
        );
        return Ok(());
    }

    // Load configuration
    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        ResponderConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (redis store)");
        ResponderConfig::default()
    };

    apply_overrides(&mut config, &args);

    if args.validate {
        config.validate()?;
        println!("Configuration is valid");
        return Ok(());
    }

    config.validate()?;

    let port = args
        .port
        .context("A port to listen on is required")?;
    let service = Arc::new(MockService::from_config(&config)?);
    let server = Server::bind(SocketAddr::new(args.bind, port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;

    server.serve(service).await?;

    Ok(())
}

/// Let command line flags replace the configured store.
fn apply_overrides(config: &mut ResponderConfig, args: &Args) {
    if let Some(dir) = &args.rules_dir {
        config.store = config.store.with_directory(dir.clone());
    } else if let Some(url) = &args.redis_url {
        config.store = config.store.with_redis_url(url.clone());
    }
}
