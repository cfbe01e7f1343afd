use agromesh::config::{Config, LoggingConfig};
use agromesh::pipeline::{CancelSignal, PipelineOrchestrator, RunRequest};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = agromesh::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Disease to research
    #[arg(short, long)]
    query: Option<String>,

    /// Crop the disease affects
    #[arg(long)]
    crop: Option<String>,

    /// Comma-separated report recipients
    #[arg(long, value_delimiter = ',')]
    recipients: Vec<String>,

    /// Connect every provider, print the capability catalog and exit
    #[arg(long)]
    list_capabilities: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config, cli.log_level.clone())?;
    init_logging(&config.logging)?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), agromesh::VERSION);

    let orchestrator = PipelineOrchestrator::from_config(config).await?;

    if cli.list_capabilities {
        return list_capabilities(&orchestrator).await;
    }

    let pipeline = &orchestrator.config().pipeline;
    let request = RunRequest::new(
        cli.query.unwrap_or_else(|| pipeline.default_query.clone()),
        cli.crop.unwrap_or_else(|| pipeline.crop.clone()),
    )
    .with_recipients(cli.recipients);

    let cancel = CancelSignal::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling at the next stage boundary");
            on_interrupt.cancel();
        }
    });

    let run = orchestrator.run_with_cancel(request, cancel).await;

    if let Some(check) = &run.reference_check {
        println!("{}\n", check.to_markdown());
    }

    for result in &run.results {
        println!("[{}] {}", result.stage, serde_json::to_string(&result.output)?);
    }

    match &run.failure {
        None => {
            println!("Run {} {}", run.id, run.state);
            Ok(())
        }
        Some(failure) => {
            error!("Run {} failed at {}: {}", run.id, failure.stage, failure.error);
            eprintln!("Run {} {}: {}", run.id, run.state, failure.error);
            std::process::exit(1);
        }
    }
}

async fn list_capabilities(orchestrator: &PipelineOrchestrator) -> Result<()> {
    let listing = orchestrator.list_capabilities().await?;

    for (provider, capability) in &listing.capabilities {
        println!("{:<24} {:<32} {}", provider, capability.name, capability.description_text());
    }

    for failure in &listing.errors {
        eprintln!("{:<24} ERROR {}", failure.provider, failure.error);
    }

    info!(
        "{} capabilities, {} provider errors",
        listing.capabilities.len(),
        listing.errors.len()
    );
    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Logs go to stderr so stdout stays clean for results
    let writer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stderr),
    };

    if logging.format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(writer),
            )
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_ansi(logging.file.is_none())
                    .with_writer(writer),
            )
            .with(env_filter)
            .init();
    }

    Ok(())
}
