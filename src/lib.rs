//! Image Processor - a queue-driven worker that compresses product images.
//!
//! Tasks arrive on a durable RabbitMQ queue. Each one names a product and its
//! source images; the worker recompresses every image into blob storage,
//! records the result on the product row and invalidates the cached view.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod product;
pub mod queue;
pub mod storage;
pub mod transcode;
pub mod validation;
pub mod worker;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::{loader, AppConfig};
use crate::error::ConfigError;
use crate::metrics::{Metrics, MetricsServer};
use crate::product::{PgProductRepository, RedisProductCache};
use crate::queue::{Broker, DeadLetterRecord, DeadLetterReporter, ImageTask, DEAD_LETTER_QUEUE, TASK_QUEUE};
use crate::storage::S3BlobStore;
use crate::transcode::{RetryPolicy, Transcoder};
use crate::validation::ValidationResult;
use crate::worker::{Dispatcher, Reconciler, TaskConsumer};

/// Runs the image processor with the provided CLI arguments.
pub async fn run(cli: Cli) -> Result<()> {
    setup_logging(cli.log_level())?;

    match cli.command {
        Commands::Run => run_worker(&cli.config).await,
        Commands::ConfigValidate => validate_config(&cli.config).await,
        Commands::ConfigShow => show_config(&cli.config).await,
        Commands::Enqueue { product_id, images } => {
            enqueue(&cli.config, product_id, images).await
        }
        Commands::DlqList { limit } => list_dead_letters(&cli.config, limit).await,
    }
}

/// Initializes the tracing subscriber for structured logging.
fn setup_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Connects every collaborator and consumes tasks until Ctrl+C.
async fn run_worker(config_path: &Path) -> Result<()> {
    info!("Starting image processor");

    let config = loader::load_and_validate(config_path)?;
    info!("Configuration loaded and validated");

    let metrics = Arc::new(Metrics::new()?);

    if config.prometheus.enabled {
        let metrics_server = MetricsServer::new(metrics.clone(), config.prometheus.port);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.start().await {
                error!(error = %e, "Prometheus server failed");
            }
        });
        info!(port = config.prometheus.port, "Prometheus metrics server started");
    }

    let broker = Arc::new(Broker::connect(&config.rabbitmq).await?);
    broker.declare_queues().await?;

    let repository = Arc::new(PgProductRepository::connect(&config.database).await?);
    let cache = Arc::new(RedisProductCache::connect(&config.redis).await?);
    let store = Arc::new(S3BlobStore::from_config(&config.storage).await);

    let processor = Arc::new(Transcoder::from_config(
        store,
        &config.processing,
        &config.storage,
    )?);
    let dispatcher = Arc::new(Dispatcher::new(
        processor,
        repository.clone(),
        Reconciler::new(repository.clone(), cache),
        DeadLetterReporter::new(broker.clone(), DEAD_LETTER_QUEUE, metrics.clone()),
        RetryPolicy::from(&config.processing.retry),
        metrics,
    ));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        });
    }

    let deliveries = broker.consume_tasks(&config.rabbitmq.consumer_tag).await?;
    info!("Image processor is running. Press Ctrl+C to stop.");

    let result = TaskConsumer::new(dispatcher)
        .run(deliveries, shutdown)
        .await;

    info!("Shutting down image processor");
    if let Err(e) = broker.close().await {
        warn!(error = %e, "Failed to close broker connection cleanly");
    }
    repository.close().await;

    let settled = result?;
    info!(settled, "Image processor stopped");
    Ok(())
}

/// Validates the configuration file and reports any issues.
async fn validate_config(config_path: &Path) -> Result<()> {
    let config = loader::load(config_path)?;
    let result = validation::validate_config(&config);

    if !result.is_valid() {
        print!("{}", result);
        anyhow::bail!(ConfigError::ValidationFailed {
            error_count: result.error_count()
        });
    }

    print!("{}", validation_summary(&config, &result));
    Ok(())
}

/// Report printed by `config-validate` for a config that passed.
fn validation_summary(config: &AppConfig, result: &ValidationResult) -> String {
    let mut out = String::from("Configuration is valid.\n");
    out.push_str(&format!(
        "  broker:  {}\n",
        queue::broker::redacted(&config.rabbitmq.url)
    ));
    out.push_str(&format!(
        "  bucket:  {} ({})\n",
        config.storage.bucket, config.storage.region
    ));
    out.push_str(&format!(
        "  retries: {} attempt(s), {}ms backoff unit\n",
        config.processing.retry.max_attempts, config.processing.retry.base_delay_ms
    ));
    for issue in result.warnings() {
        out.push_str(&issue.to_string());
    }
    out
}

/// Displays the effective configuration with credentials masked.
async fn show_config(config_path: &Path) -> Result<()> {
    let config = masked(loader::load_and_validate(config_path)?);
    let yaml = serde_yaml::to_string(&config)?;
    println!("{}", yaml);
    Ok(())
}

fn masked(mut config: AppConfig) -> AppConfig {
    config.rabbitmq.url = queue::broker::redacted(&config.rabbitmq.url);
    if !config.database.password.is_empty() {
        config.database.password = "***".to_string();
    }
    if config.redis.password.is_some() {
        config.redis.password = Some("***".to_string());
    }
    config
}

/// Publishes a task for `product_id` to the main queue.
async fn enqueue(config_path: &Path, product_id: u64, images: Vec<String>) -> Result<()> {
    let config = loader::load(config_path)?;
    let task = ImageTask::new(product_id, images);
    let payload = task.encode()?;

    let broker = Broker::connect(&config.rabbitmq).await?;
    broker.declare_queues().await?;
    broker.publish(TASK_QUEUE, &payload).await?;
    broker.close().await?;

    println!(
        "Queued {} image(s) for product {}.",
        task.images.len(),
        task.product_id
    );
    Ok(())
}

/// Prints dead-letter records without consuming them.
async fn list_dead_letters(config_path: &Path, limit: usize) -> Result<()> {
    let config = loader::load(config_path)?;

    let broker = Broker::connect(&config.rabbitmq).await?;
    broker.declare_queues().await?;
    let payloads = broker.peek(DEAD_LETTER_QUEUE, limit).await?;
    broker.close().await?;

    if payloads.is_empty() {
        println!("Dead letter queue is empty.");
        return Ok(());
    }

    println!("Dead letter queue ({} shown):", payloads.len());
    for payload in payloads {
        match serde_json::from_slice::<DeadLetterRecord>(&payload) {
            Ok(record) => println!(
                "  {} product {} - {}",
                record.timestamp.to_rfc3339(),
                record.product_id,
                record.error
            ),
            Err(_) => println!("  <unreadable> {}", String::from_utf8_lossy(&payload)),
        }
    }

    Ok(())
}
