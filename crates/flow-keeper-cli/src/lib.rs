//! # Flow Keeper CLI
//!
//! Command-line front end for the flow runtime.
//!
//! This module provides CLI commands for:
//! - Running the consumer against the in-memory broker
//! - Validating and printing the resolved configuration
//!
//! Configuration sources, applied in order (later sources override earlier
//! ones):
//!  1. `/etc/flow-keeper/consumer.yaml`
//!  2. `./config/consumer.yaml`
//!  3. The file given by `--config` / `FLOW_KEEPER_CONFIG`
//!  4. Environment variables prefixed `FK__`, e.g. `FK__QUEUE__NAME=orders`
//!  5. Connection and queue flags on the command line

use clap::{Args, Parser, Subcommand};
use flow_runtime::{
    AckFaults, AuthScheme, ConfigurationError, ConnectError, Connection, ConsumerConfig,
    FlowConsumer, FlowError, InMemoryBroker,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// Flow Keeper - at-least-once queue consumer
#[derive(Parser)]
#[command(name = "flow-keeper")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "At-least-once consumer for durable message queues")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FLOW_KEEPER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level, overriding the configured one
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(flatten)]
    pub overrides: ConnectionArgs,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Connection and queue settings that override the configuration files
#[derive(Args, Debug, Default, Clone)]
pub struct ConnectionArgs {
    /// Broker host, e.g. tcp://localhost:55555
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Message VPN
    #[arg(long, global = true)]
    pub vpn: Option<String>,

    #[arg(short, long, global = true)]
    pub username: Option<String>,

    #[arg(short, long, env = "FLOW_KEEPER_PASSWORD", global = true, hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long, value_enum, global = true)]
    pub auth_scheme: Option<AuthSchemeArg>,

    /// Skip server certificate validation
    #[arg(long, global = true)]
    pub no_validate_certificate: bool,

    /// Compression level, 0 (off) to 9
    #[arg(long, global = true)]
    pub compression_level: Option<u8>,

    /// Queue to consume from
    #[arg(short, long, global = true)]
    pub queue: Option<String>,

    /// Whether the queue is durable (true) or temporary (false)
    #[arg(long, global = true)]
    pub durable: Option<bool>,
}

impl ConnectionArgs {
    /// Write every flag that was given into `config`
    pub fn apply(&self, config: &mut ConsumerConfig) {
        let connection = &mut config.connection;
        if let Some(host) = &self.host {
            connection.host = host.clone();
        }
        if let Some(vpn) = &self.vpn {
            connection.vpn = Some(vpn.clone());
        }
        if let Some(username) = &self.username {
            connection.username = username.clone();
        }
        if let Some(password) = &self.password {
            connection.password = Some(password.clone());
        }
        if let Some(scheme) = self.auth_scheme {
            connection.auth_scheme = scheme.into();
        }
        if self.no_validate_certificate {
            connection.validate_certificate = false;
        }
        if let Some(level) = self.compression_level {
            connection.compression_level = level;
        }
        if let Some(queue) = &self.queue {
            config.queue.name = queue.clone();
        }
        if let Some(durable) = self.durable {
            config.queue.durable = durable;
        }
    }
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the consumer against an in-memory broker
    Consume {
        /// Number of demo messages to publish once the consumer is bound
        #[arg(long, default_value = "0")]
        demo_messages: usize,

        /// Probability (0.0 - 1.0) that the broker rejects an acknowledgment
        #[arg(long)]
        ack_failure_rate: Option<f64>,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        run_for_secs: Option<u64>,
    },

    /// Validate configuration and print the resolved result
    Config {
        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum AuthSchemeArg {
    Basic,
    Kerberos,
}

impl From<AuthSchemeArg> for AuthScheme {
    fn from(arg: AuthSchemeArg) -> Self {
        match arg {
            AuthSchemeArg::Basic => AuthScheme::Basic,
            AuthSchemeArg::Kerberos => AuthScheme::Kerberos,
        }
    }
}

/// Configuration format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Connection failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Consumer error: {0}")]
    Consumer(#[from] FlowError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Logging setup failed: {message}")]
    Logging { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Connect(_) => 2,
            Self::Consumer(_) => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Logging { .. } => 5,
            Self::Io(_) => 6,
        }
    }
}

/// Configuration loading and rendering errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] ConfigurationError),

    #[error("Failed to render configuration: {message}")]
    Render { message: String },
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Logging section of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Everything resolved from the configuration sources
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub consumer: ConsumerConfig,
    pub logging: LoggingConfig,
}

#[derive(Serialize)]
struct ResolvedConfig<'a> {
    #[serde(flatten)]
    consumer: &'a ConsumerConfig,
    logging: &'a LoggingConfig,
}

/// Build the layered configuration without validating it
pub fn load_configuration(explicit_path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let mut builder = config::Config::builder()
        .add_source(
            config::File::with_name("/etc/flow-keeper/consumer")
                .required(false)
                .format(config::FileFormat::Yaml),
        )
        .add_source(
            config::File::with_name("config/consumer")
                .required(false)
                .format(config::FileFormat::Yaml),
        );

    if let Some(path) = explicit_path {
        builder = builder.add_source(
            config::File::from(path)
                .required(true)
                .format(config::FileFormat::Yaml),
        );
    }

    let settings = builder
        .add_source(config::Environment::with_prefix("FK").separator("__"))
        .build()?;

    let logging = match settings.get::<LoggingConfig>("logging") {
        Ok(logging) => logging,
        Err(config::ConfigError::NotFound(_)) => LoggingConfig::default(),
        Err(e) => return Err(e.into()),
    };
    let consumer: ConsumerConfig = settings.try_deserialize()?;

    Ok(LoadedConfig { consumer, logging })
}

/// Render the configuration with the password masked
pub fn render_configuration(
    loaded: &LoadedConfig,
    format: ConfigFormat,
) -> Result<String, ConfigError> {
    let mut consumer = loaded.consumer.clone();
    if consumer.connection.password.is_some() {
        consumer.connection.password = Some("<redacted>".to_string());
    }

    let resolved = ResolvedConfig {
        consumer: &consumer,
        logging: &loaded.logging,
    };

    match format {
        ConfigFormat::Yaml => serde_yaml::to_string(&resolved).map_err(|e| ConfigError::Render {
            message: e.to_string(),
        }),
        ConfigFormat::Json => {
            serde_json::to_string_pretty(&resolved).map_err(|e| ConfigError::Render {
                message: e.to_string(),
            })
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

pub async fn run_cli() -> Result<(), CliError> {
    run(Cli::parse()).await
}

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let loaded = load_configuration(cli.config.as_deref());

    let logging = loaded
        .as_ref()
        .map(|loaded| loaded.logging.clone())
        .unwrap_or_default();
    initialize_logging(cli.log_level.as_deref(), cli.json_logs || logging.json_format, &logging)?;

    let mut loaded = loaded?;
    cli.overrides.apply(&mut loaded.consumer);
    loaded
        .consumer
        .validate()
        .map_err(|e| CliError::Configuration(e.into()))?;

    match cli.command {
        Commands::Consume {
            demo_messages,
            ack_failure_rate,
            run_for_secs,
        } => {
            execute_consume_command(
                &loaded.consumer,
                demo_messages,
                ack_failure_rate,
                run_for_secs.map(Duration::from_secs),
            )
            .await
        }
        Commands::Config { format } => {
            let rendered = render_configuration(&loaded, format)?;
            println!("{rendered}");
            Ok(())
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Directive string for the log filter; `RUST_LOG` still wins when set
pub fn log_filter(level: &str) -> String {
    format!("flow_keeper={level},flow_runtime={level}")
}

fn initialize_logging(
    level_override: Option<&str>,
    json: bool,
    logging: &LoggingConfig,
) -> Result<(), CliError> {
    let level = level_override.unwrap_or(&logging.level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log_filter(level).into());

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .try_init()
        .map_err(|e| CliError::Logging {
            message: e.to_string(),
        })
}

/// Run the consumer until Ctrl-C or until `run_for` elapses
pub async fn execute_consume_command(
    config: &ConsumerConfig,
    demo_messages: usize,
    ack_failure_rate: Option<f64>,
    run_for: Option<Duration>,
) -> Result<(), CliError> {
    if let Some(rate) = ack_failure_rate {
        if !(0.0..=1.0).contains(&rate) {
            return Err(CliError::InvalidArgument {
                arg: "ack-failure-rate".to_string(),
                message: format!("{rate} is not between 0.0 and 1.0"),
            });
        }
    }

    let endpoint = config
        .queue
        .endpoint()
        .map_err(|e| CliError::Configuration(e.into()))?;

    let broker = InMemoryBroker::new().with_user(
        config.connection.username.clone(),
        config.connection.password.clone(),
    );
    if endpoint.is_durable() {
        broker.provision_queue(endpoint.name.clone());
    }

    let connection = Arc::new(broker.connect(&config.connection)?);
    let consumer = FlowConsumer::start(connection.clone(), config).await?;

    if let Some(failure_rate) = ack_failure_rate {
        broker.set_ack_faults(AckFaults::Random { failure_rate });
        warn!(failure_rate = failure_rate, "Injecting acknowledgment failures");
    }

    for i in 0..demo_messages {
        broker.publish(&endpoint.name, format!("demo message {i}"))?;
    }
    if demo_messages > 0 {
        info!(count = demo_messages, queue = %endpoint, "Published demo messages");
    }

    let stopped = match run_for {
        Some(duration) => tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            signal = tokio::signal::ctrl_c() => signal,
        },
        None => tokio::signal::ctrl_c().await,
    };

    info!(pending = consumer.pending(), "Shutting down consumer");
    let summary = consumer.shutdown().await;
    connection.disconnect().await;
    stopped?;

    info!(
        passes = summary.passes,
        acknowledged = summary.acknowledged,
        rebinds = summary.rebinds,
        panicked_passes = summary.panicked_passes,
        abandoned = summary.abandoned,
        "Consumer stopped"
    );

    if let Some(stats) = broker.stats(&endpoint.name) {
        info!(
            ready = stats.ready,
            in_flight = stats.in_flight,
            acknowledged = stats.acknowledged,
            redelivered = stats.redelivered,
            "Broker queue statistics"
        );
    }

    Ok(())
}
