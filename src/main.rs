//! Agent gateway entry point
//!
//! Connects one agent session to the configured broker, subscribes a
//! logging consumer to every configured filter and keeps the session alive
//! until SIGINT or SIGTERM.

use agent_gateway::agent::{
    AgentIdentity, AgentSession, ConsumerError, ConsumerHandle, MessageConsumer,
    ReconnectSupervisor, SupervisorExit, WorkerPool,
};
use agent_gateway::config::AgentConfig;
use agent_gateway::observability::logging::{init_logging, parse_level, LogFormat};
use agent_gateway::transport::mqtt::MqttClient;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{error, info};

/// How long shutdown waits for running consumers
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// MQTT agent gateway
#[derive(Parser)]
#[command(name = "agent-gateway")]
#[command(about = "Connects an agent to an MQTT broker and routes its messages")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "AGENT_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace); ignored when LOG_LEVEL is set
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and run until interrupted
    Run,
    /// Validate the configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_cli_logging(cli.verbose);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting agent gateway");

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn init_cli_logging(verbose: u8) {
    let level = match std::env::var("LOG_LEVEL") {
        Ok(level) => parse_level(&level),
        Err(_) => match verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        },
    };
    let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = std::env::var("LOG_SPANS")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loading configuration");
        return Ok(AgentConfig::load_from_file(path)?);
    }

    for candidate in ["agent-gateway.toml", "config/agent-gateway.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            return Ok(AgentConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create agent-gateway.toml".into())
}

/// Logs every message it receives
struct LoggingConsumer;

#[async_trait::async_trait]
impl MessageConsumer for LoggingConsumer {
    async fn receive(
        &self,
        session: &AgentSession,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), ConsumerError> {
        match session.decode::<serde_json::Value>(&payload) {
            Ok(value) => info!(topic = %topic, payload = %value, "Message received"),
            Err(_) => info!(topic = %topic, bytes = payload.len(), "Message received (undecodable)"),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "logger"
    }
}

async fn run_agent(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let identity = AgentIdentity::from_config(&config.agent);
    info!(
        agent_id = %identity.agent_id,
        session_id = %identity.session_id,
        "Application starting"
    );

    let transport = Arc::new(MqttClient::new(config.mqtt.clone())?);
    let session = AgentSession::new(identity, transport, WorkerPool::current("consumers"));

    let logger = ConsumerHandle::new(LoggingConsumer);
    for subscription in &config.subscriptions {
        session.subscribe(&subscription.filter, logger.clone()).await?;
    }

    session.connect().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut supervisor = tokio::spawn(
        ReconnectSupervisor::new(Arc::clone(&session), config.reconnect.to_policy(), shutdown_rx)
            .run(),
    );

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Agent session running");

    let mut failure: Option<Box<dyn std::error::Error>> = None;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
        exit = &mut supervisor => {
            match exit {
                Ok(SupervisorExit::AttemptsExhausted { attempts }) => {
                    error!(attempts, "Broker unreachable, shutting down");
                    failure = Some(format!("reconnect gave up after {attempts} attempts").into());
                }
                Ok(exit) => info!(?exit, "Reconnect supervisor exited"),
                Err(e) => {
                    error!(error = %e, "Reconnect supervisor task failed");
                    failure = Some(Box::new(e));
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if !supervisor.is_finished() {
        let _ = supervisor.await;
    }

    info!("Application shutdown initiated");
    session.shutdown(SHUTDOWN_GRACE).await?;
    info!(stats = ?session.stats(), "Dispatch totals");

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn handle_config_command(config: &AgentConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
