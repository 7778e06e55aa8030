//! BrokerView - broker management session coordinator
//!
//! CLI entry point for opening a management session and watching what the
//! coordinator reports.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use brokerview::cli::{Cli, Command, OutputFormat, get_log_path};
use brokerview::config::Config;
use brokerview::session::{CallerHandle, ConnectionState, NotificationBus, SessionCoordinator, SessionNotification};
use brokerview::transport::sim::SimulatedBroker;

/// How long to wait for the session to close after the run ends
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

fn setup_logging(verbose: bool) -> Result<()> {
    let log_path = get_log_path();

    // Create log directory
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Setup tracing subscriber - write to log file, not stdout/stderr
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {}, path: {})", verbose, log_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        "BrokerView loaded config: address={}, poll-interval-ms={}",
        config.broker.address, config.session.poll_interval_ms
    );

    match cli.command {
        Some(Command::Connect {
            address,
            connection_options,
            session_options,
            classes,
            duration_secs,
        }) => {
            cmd_connect(
                &config,
                address,
                connection_options,
                session_options,
                classes,
                Duration::from_secs(duration_secs),
            )
            .await
        }
        Some(Command::ShowConfig { format }) => cmd_show_config(&config, format),
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Print the effective configuration
fn cmd_show_config(config: &Config, format: OutputFormat) -> Result<()> {
    let rendered = match format {
        OutputFormat::Yaml => serde_yaml::to_string(config).context("Failed to render config as YAML")?,
        OutputFormat::Json => serde_json::to_string_pretty(config).context("Failed to render config as JSON")?,
    };
    println!("{}", rendered.trim_end());
    Ok(())
}

/// Run a session against the simulated broker and print every notification
async fn cmd_connect(
    config: &Config,
    address: Option<String>,
    connection_options: Option<String>,
    session_options: Option<String>,
    classes: Vec<String>,
    duration: Duration,
) -> Result<()> {
    let broker = config.broker.with_overrides(address, connection_options, session_options);
    info!(address = %broker.address, ?classes, ?duration, "cmd_connect: starting");

    let sim = SimulatedBroker::new();
    let responder = sim.serve_catalog(demo_catalog());

    let bus = NotificationBus::new(config.session.notification_capacity);
    let mut notifications = bus.subscribe();
    let coordinator = SessionCoordinator::spawn_with_bus(config.session.clone(), Arc::new(sim.transport()), bus)
        .context("Failed to start session coordinator")?;
    let handle = coordinator.handle();

    handle.request_connect(&broker.address, &broker.connection_options, &broker.session_options);
    sim.announce_broker_agent();

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            received = notifications.recv() => match received {
                Ok(notification) => {
                    println!("{}", describe(&notification));
                    if matches!(notification, SessionNotification::ConnectedChanged { connected: true }) {
                        for class in &classes {
                            if !handle.submit_streaming_query(class.clone(), CallerHandle::new(class.clone())) {
                                warn!(%class, "Class query not accepted");
                            }
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notification subscriber lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if handle.state() == ConnectionState::Connected {
        handle.request_disconnect();
        let closing = tokio::time::sleep(DISCONNECT_GRACE);
        tokio::pin!(closing);
        loop {
            tokio::select! {
                _ = &mut closing => {
                    warn!("Session did not close within the grace period");
                    break;
                }
                received = notifications.recv() => match received {
                    Ok(notification) => {
                        println!("{}", describe(&notification));
                        if matches!(
                            notification,
                            SessionNotification::StateChanged { to: ConnectionState::Disconnected, .. }
                        ) {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notification subscriber lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    while let Ok(notification) = notifications.try_recv() {
        println!("{}", describe(&notification));
    }

    let metrics = handle.snapshot().metrics;
    tokio::task::spawn_blocking(move || coordinator.cancel_and_join())
        .await
        .context("Session coordinator join task failed")?
        .context("Session coordinator did not stop cleanly")?;
    responder.abort();

    println!("{}", serde_json::to_string(&metrics).context("Failed to render metrics")?);
    Ok(())
}

/// One line per notification
fn describe(notification: &SessionNotification) -> String {
    match notification {
        SessionNotification::ConnectionStatus { text } => format!("status: {text}"),
        SessionNotification::ConnectedChanged { connected } => format!("connected: {connected}"),
        SessionNotification::Error { message } => format!("error: {message}"),
        SessionNotification::IdleTick => "idle".to_string(),
        SessionNotification::StateChanged { from, to } => format!("state: {from} -> {to}"),
        SessionNotification::QueryIssued {
            caller,
            correlation_id,
            kind,
        } => format!(
            "issued: {} id={correlation_id} kind={kind:?}",
            caller_label(caller)
        ),
        SessionNotification::QueryResolved { caller, event } => {
            let rows = Value::Array(event.rows.clone());
            match &event.error {
                Some(error) => format!(
                    "resolved: {} id={} final={} error={error}",
                    caller_label(caller),
                    event.correlation_id,
                    event.is_final
                ),
                None => format!(
                    "resolved: {} id={} final={} rows={rows}",
                    caller_label(caller),
                    event.correlation_id,
                    event.is_final
                ),
            }
        }
    }
}

fn caller_label(caller: &CallerHandle) -> String {
    caller
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| format!("{caller:?}"))
}

/// Objects the simulated broker reports for class queries
fn demo_catalog() -> HashMap<String, Vec<Value>> {
    HashMap::from([
        (
            "queue".to_string(),
            vec![
                json!({ "name": "orders", "msgDepth": 12, "consumerCount": 2, "durable": true }),
                json!({ "name": "audit", "msgDepth": 0, "consumerCount": 1, "durable": true }),
                json!({ "name": "scratch", "msgDepth": 3, "consumerCount": 0, "durable": false }),
            ],
        ),
        (
            "exchange".to_string(),
            vec![
                json!({ "name": "amq.direct", "type": "direct", "bindingCount": 2 }),
                json!({ "name": "amq.topic", "type": "topic", "bindingCount": 1 }),
            ],
        ),
        (
            "binding".to_string(),
            vec![
                json!({ "exchangeRef": "amq.direct", "queueRef": "orders", "bindingKey": "orders" }),
                json!({ "exchangeRef": "amq.direct", "queueRef": "audit", "bindingKey": "audit" }),
                json!({ "exchangeRef": "amq.topic", "queueRef": "audit", "bindingKey": "#" }),
            ],
        ),
        (
            "connection".to_string(),
            vec![json!({ "address": "127.0.0.1:40122", "authIdentity": "anonymous", "federationLink": false })],
        ),
    ])
}
