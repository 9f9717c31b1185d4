use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kafka_alerts::{Configs, Service, TestOptions, TracingDiagnostic};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "kafka-alerts")]
#[command(version, about = "Kafka alert delivery", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file
    Validate {
        /// TOML file with `[[kafka]]` blocks
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Write one message synchronously to a configured cluster
    Test {
        /// TOML file with `[[kafka]]` blocks
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value = "example")]
        cluster: String,
        #[arg(long, default_value = "test")]
        topic: String,
        #[arg(long, default_value = "key")]
        key: String,
        #[arg(long, default_value = "test kafka message")]
        message: String,
    },
}

fn load(path: &Path) -> Result<Configs> {
    let configs = Configs::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    configs.validate().context("invalid configuration")?;
    Ok(configs)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.debug {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .init();
    }

    match cli.command {
        Commands::Validate { config } => {
            let configs = load(&config)?;
            for cluster in configs.iter() {
                let state = if cluster.enabled { "enabled" } else { "disabled" };
                println!("{}: {} ({})", cluster.id, cluster.brokers.join(","), state);
            }
        }
        Commands::Test {
            config,
            cluster,
            topic,
            key,
            message,
        } => {
            let configs = load(&config)?;
            let service = Service::new(configs.as_slice(), Arc::new(TracingDiagnostic::new()));
            service.open().await?;

            let options = TestOptions {
                cluster,
                topic,
                key,
                message,
            };
            let result = service.test(&options).await;
            service.close().await?;
            result.with_context(|| format!("test write to cluster {:?} failed", options.cluster))?;
            println!("wrote test message to {}/{}", options.cluster, options.topic);
        }
    }

    Ok(())
}
