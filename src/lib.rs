// Module declarations
pub mod config;         // YAML configuration and validation
pub mod engine;         // Per-inverter protocol engine
pub mod error;          // Protocol error types
pub mod lxp;            // Wire format and TCP session
pub mod options;        // Command line options parsing
pub mod planner;        // Bank read planning
pub mod prelude;        // Common imports and types
pub mod register;       // Register bindings and decoding
pub mod register_cache; // Last raw value of every register read
pub mod scheduler;      // Poll loop and reconnect backoff
pub mod sink;           // Outbound events

use crate::options::Command;
use crate::prelude::*;

use std::sync::Arc;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialises `env_logger` with a `[timestamp level module]` prefix.
/// `RUST_LOG` overrides `level`; a second call only logs a warning.
pub fn init_logging(level: &str) {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(e) = result {
        warn!("logger already initialised: {}", e);
    }
}

/// Entry point for the binary: loads the config and runs the selected
/// command until it finishes or a shutdown signal arrives.
pub async fn run(options: Options) -> Result<()> {
    let config = Config::new(options.config_file.clone());
    init_logging(config.as_ref().map(|c| c.loglevel()).unwrap_or("info"));
    let config = config?;

    info!("lux-engine {} starting", CARGO_PKG_VERSION);

    match &options.command {
        Some(Command::Toggle {
            datalog,
            slot,
            state,
        }) => toggle(&config, datalog.as_deref(), slot, *state).await,
        Some(Command::Run) | None => {
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

            let signal_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for ctrl+c: {}", e);
                }
                info!("ctrl+c received, shutting down");
                let _ = signal_tx.send(());
            });

            if let Some(runtime) = options.runtime {
                let limit_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(runtime)).await;
                    info!("runtime limit of {}s reached, shutting down", runtime);
                    let _ = limit_tx.send(());
                });
            }

            app(config, options.json, shutdown_rx).await
        }
    }
}

/// Runs an engine and scheduler per enabled inverter until `shutdown_rx`
/// fires, logging every sink event on the way.
pub async fn app(config: Config, json: bool, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    config.log_summary();

    let events = ChannelSink::channel();
    let logger = tokio::spawn(log_events(events.subscribe(), json));

    info!("Creating engines...");
    let engines = config
        .enabled_inverters()
        .map(|inverter| {
            let sink = ChannelSink::new(inverter.datalog(), events.clone());
            Engine::new(inverter.clone(), Arc::new(sink))
        })
        .collect::<Result<Vec<_>>>()?;

    if engines.is_empty() {
        warn!("no enabled inverters configured");
    }

    let handles: Vec<_> = engines
        .iter()
        .map(|engine| {
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.start().await {
                    error!("inverter {}: scheduler failed: {}", engine.datalog(), e);
                }
            })
        })
        .collect();

    info!("Waiting for shutdown signal...");
    let _ = shutdown_rx.recv().await;

    for engine in &engines {
        engine.stop();
    }

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!("Error waiting for scheduler task: {}", e);
        }
    }

    logger.abort();

    for engine in &engines {
        engine.stats().print_summary(engine.datalog());
    }

    info!("Shutdown complete");

    Ok(())
}

/// One-shot switch change for the `toggle` subcommand.
async fn toggle(config: &Config, datalog: Option<&str>, slot: &str, state: bool) -> Result<()> {
    let inverter = match datalog {
        Some(datalog) => {
            let datalog = Serial::from_str(datalog)?;
            config
                .enabled_inverter_with_datalog(datalog)
                .ok_or_else(|| anyhow!("no enabled inverter with datalog {}", datalog))?
        }
        None => config
            .enabled_inverters()
            .next()
            .ok_or_else(|| anyhow!("no enabled inverters configured"))?,
    };

    let sink = ChannelSink::new(inverter.datalog(), ChannelSink::channel());
    let engine = Engine::new(inverter.clone(), Arc::new(sink))?;

    engine.connect().await?;
    let result = engine.toggle_switch(slot, state).await;
    engine.disconnect().await;

    let state = result?;
    info!(
        "inverter {}: {} switched {}",
        inverter.datalog(),
        slot,
        if state { "on" } else { "off" }
    );

    Ok(())
}

// prints every sink event, as JSON lines when asked to
async fn log_events(mut rx: broadcast::Receiver<SinkEvent>, json: bool) {
    loop {
        match rx.recv().await {
            Ok(event) if json => match serde_json::to_string(&event) {
                Ok(line) => {
                    let _ = writeln!(std::io::stdout().lock(), "{}", line);
                }
                Err(e) => warn!("could not serialise {}: {}", event, e),
            },
            Ok(event) => info!("{}", event),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("event logger lagged, {} events lost", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
