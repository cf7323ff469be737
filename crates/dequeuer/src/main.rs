// SQS Dequeuer binary
//
// Design Decision: clap flags override the DEQUEUER_* environment; both feed DequeuerConfig::from_lookup.
// Design Decision: the bundled handler only logs payloads; applications embed the library instead.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use sqs_dequeuer::config::{AwsCredentials, DequeuerConfig};
use sqs_dequeuer::error::ConfigError;
use sqs_dequeuer::telemetry::{init_telemetry, TelemetryConfig};
use sqs_dequeuer::{Dispatcher, HandlerContext, HandlerError, MessageHandler};

#[derive(Parser, Debug, Default)]
#[command(name = "sqs-dequeuer")]
#[command(about = "Consume an SQS queue and dispatch messages to worker pools")]
#[command(version)]
struct Cli {
    /// Queue to consume [env: SQS_QUEUE_NAME]
    #[arg(long)]
    queue: Option<String>,

    /// Isolated pool size, 0 runs handlers inline [env: DEQUEUER_PROCESS_CONCURRENCY, default: 2]
    #[arg(long)]
    process_concurrency: Option<usize>,

    /// Worker thread count, 0 runs handlers inline [env: DEQUEUER_THREAD_CONCURRENCY, default: 2]
    #[arg(long)]
    thread_concurrency: Option<usize>,

    /// Worker thread queue capacity [env: DEQUEUER_QUEUE_CAPACITY, default: 200 per thread]
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Worker dequeue timeout in milliseconds [env: DEQUEUER_DEQUEUE_TIMEOUT_MS, default: 5000]
    #[arg(long)]
    dequeue_timeout_ms: Option<u64>,

    /// Pool that receives messages [env: DEQUEUER_ROUTE, default: isolated]
    #[arg(long, value_parser = ["isolated", "threaded"])]
    route: Option<String>,

    /// Messages per receive call, max 10 [env: DEQUEUER_MAX_MESSAGES]
    #[arg(long)]
    max_messages: Option<usize>,

    /// Long-poll wait in seconds, max 20 [env: DEQUEUER_WAIT_TIME_SECS, default: 5]
    #[arg(long)]
    wait_time_secs: Option<u64>,

    /// Visibility timeout in seconds [env: DEQUEUER_VISIBILITY_TIMEOUT_SECS, default: 30]
    #[arg(long)]
    visibility_timeout_secs: Option<u64>,

    /// AWS access key ID (falls back to AWS_ACCESS_KEY_ID)
    #[arg(long)]
    aws_access_key_id: Option<String>,

    /// AWS secret access key (falls back to AWS_SECRET_ACCESS_KEY)
    #[arg(long)]
    aws_secret_access_key: Option<String>,

    /// AWS region (falls back to AWS_REGION)
    #[arg(long)]
    aws_region: Option<String>,
}

impl Cli {
    /// Value given on the command line for a configuration key
    fn flag(&self, key: &str) -> Option<String> {
        match key {
            "SQS_QUEUE_NAME" => self.queue.clone(),
            "DEQUEUER_PROCESS_CONCURRENCY" => self.process_concurrency.map(|v| v.to_string()),
            "DEQUEUER_THREAD_CONCURRENCY" => self.thread_concurrency.map(|v| v.to_string()),
            "DEQUEUER_QUEUE_CAPACITY" => self.queue_capacity.map(|v| v.to_string()),
            "DEQUEUER_DEQUEUE_TIMEOUT_MS" => self.dequeue_timeout_ms.map(|v| v.to_string()),
            "DEQUEUER_ROUTE" => self.route.clone(),
            "DEQUEUER_MAX_MESSAGES" => self.max_messages.map(|v| v.to_string()),
            "DEQUEUER_WAIT_TIME_SECS" => self.wait_time_secs.map(|v| v.to_string()),
            "DEQUEUER_VISIBILITY_TIMEOUT_SECS" => self.visibility_timeout_secs.map(|v| v.to_string()),
            _ => None,
        }
    }

    /// Build the dispatcher configuration, flags first, then `env`
    fn config<F>(&self, env: F) -> Result<DequeuerConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        DequeuerConfig::from_lookup(|key| self.flag(key).or_else(|| env(key)))
    }
}

/// Handler that logs each payload and acknowledges it
struct LoggingHandler;

impl MessageHandler for LoggingHandler {
    fn handle(
        &self,
        ctx: &HandlerContext,
        _transport: &Value,
        payload: &Value,
    ) -> Result<(), HandlerError> {
        ctx.log(format!("{} received {}", ctx.queue_name(), payload));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("sqs_dequeuer=info".to_string());
    }
    init_telemetry(telemetry_config);

    let cli = Cli::parse();

    let config = cli
        .config(|key| std::env::var(key).ok())
        .context("Invalid dequeuer configuration")?;

    let credentials = AwsCredentials::resolve(
        cli.aws_access_key_id,
        cli.aws_secret_access_key,
        cli.aws_region,
    )
    .context("Failed to resolve AWS credentials")?;

    tracing::info!(
        queue = %config.queue_name,
        region = %credentials.region,
        route = %config.pool.route,
        "sqs-dequeuer starting..."
    );

    let dispatcher = Dispatcher::connect_sqs(config, &credentials, LoggingHandler)
        .await
        .context("Failed to create dispatcher")?;

    // Runs until Ctrl-C, then joins workers
    dispatcher
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    tracing::info!(stats = ?dispatcher.stats(), "Dequeuer shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqs_dequeuer::config::PoolKind;
    use std::time::Duration;

    fn env_from(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_env_supplies_full_config() {
        let cli = Cli::try_parse_from(["sqs-dequeuer"]).unwrap();
        let config = cli
            .config(env_from(&[
                ("SQS_QUEUE_NAME", "orders"),
                ("DEQUEUER_QUEUE_CAPACITY", "32"),
                ("DEQUEUER_DEQUEUE_TIMEOUT_MS", "250"),
                ("DEQUEUER_WAIT_TIME_SECS", "20"),
                ("DEQUEUER_VISIBILITY_TIMEOUT_SECS", "90"),
            ]))
            .unwrap();

        assert_eq!(config.queue_name, "orders");
        assert_eq!(config.pool.internal_queue_capacity, 32);
        assert_eq!(config.pool.dequeue_timeout, Duration::from_millis(250));
        assert_eq!(config.receive.wait_time, Duration::from_secs(20));
        assert_eq!(config.receive.visibility_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_flags_override_env() {
        let cli = Cli::try_parse_from([
            "sqs-dequeuer",
            "--queue",
            "payments",
            "--thread-concurrency",
            "4",
            "--route",
            "threaded",
            "--wait-time-secs",
            "1",
        ])
        .unwrap();
        let config = cli
            .config(env_from(&[
                ("SQS_QUEUE_NAME", "orders"),
                ("DEQUEUER_THREAD_CONCURRENCY", "8"),
                ("DEQUEUER_WAIT_TIME_SECS", "20"),
            ]))
            .unwrap();

        assert_eq!(config.queue_name, "payments");
        assert_eq!(config.pool.thread_concurrency, 4);
        assert_eq!(config.pool.route, PoolKind::Threaded);
        assert_eq!(config.receive.wait_time, Duration::from_secs(1));
    }

    #[test]
    fn test_missing_queue_and_bad_values_are_rejected() {
        let cli = Cli::default();
        assert_eq!(
            cli.config(env_from(&[])),
            Err(ConfigError::MissingVar("SQS_QUEUE_NAME"))
        );

        let cli = Cli::try_parse_from(["sqs-dequeuer", "--queue", "orders", "--wait-time-secs", "60"])
            .unwrap();
        assert!(cli.config(env_from(&[])).is_err());
    }
}
