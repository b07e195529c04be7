// Piman Daemon - telemetry collector entry point
// Copyright (c) 2025 Piman contributors
//
// Licensed under AGPL-3.0.

//! # Piman Daemon
//!
//! Collects OS metrics, board vitals and external-power presence until
//! SIGINT or SIGTERM.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults plus environment overrides (FETCH_INTERVAL, AC_SIGNAL_PIN, ...)
//! piman
//!
//! # With a configuration file
//! piman --config /etc/piman.toml --log-level debug
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use piman::readers::board::Vcgencmd;
use piman::readers::os::SystemSource;
use piman::readers::{
    hardware_group, open_line, os_group, power_group, HARDWARE_GROUP, OS_GROUP, POWER_GROUP,
};
use piman::{
    Config, ConsoleSink, GroupConfig, JsonLinesSink, LogFile, Logger, ReaderGroup, Scheduler, Sink,
};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Piman telemetry collector
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Diagnostics go to stderr; stdout belongs to the console sink
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Piman v{}", piman::VERSION);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> piman::Result<()> {
    let config = Config::load(args.config.as_deref())?;
    info!(
        os_interval = config.os.interval_secs,
        hw_interval = config.hardware.interval_secs,
        ac_interval = config.power.interval_secs,
        ac_pin = config.ac_signal_pin,
        logging = config.logging_enabled,
        "Configuration loaded"
    );

    let (os_logger, os_sinks) = outputs(&config, OS_GROUP, &config.os)?;
    let (hw_logger, hw_sinks) = outputs(&config, HARDWARE_GROUP, &config.hardware)?;
    let (ac_logger, ac_sinks) = outputs(&config, POWER_GROUP, &config.power)?;

    // The only fatal hardware condition: no line, no start.
    let line = open_line(config.ac_signal_pin)?;

    let groups: [(ReaderGroup, &GroupConfig, Vec<Arc<dyn Sink>>); 3] = [
        (
            os_group(OS_GROUP, Arc::new(SystemSource::new()), os_logger),
            &config.os,
            os_sinks,
        ),
        (
            hardware_group(
                HARDWARE_GROUP,
                Arc::new(Vcgencmd::new(&config.vcgencmd_path, config.command_timeout())),
                &config.fan_speed_file,
                &config.fan_pwm_file,
                hw_logger,
            ),
            &config.hardware,
            hw_sinks,
        ),
        (
            power_group(POWER_GROUP, line, ac_logger),
            &config.power,
            ac_sinks,
        ),
    ];

    let mut scheduler = Scheduler::new().with_start_delay(config.start_delay());
    for (group, group_config, sinks) in groups {
        scheduler.add_group(group, group_config.interval(), sinks)?;
    }

    let report = scheduler.run_until(shutdown_signal()).await?;
    for group in &report.groups {
        info!(
            group = %group.group,
            ticks = group.ticks,
            sink_failures = group.sink_failures,
            "Group summary"
        );
    }
    Ok(())
}

/// Logger and sinks of one group
fn outputs(
    config: &Config,
    name: &str,
    group: &GroupConfig,
) -> piman::Result<(Logger, Vec<Arc<dyn Sink>>)> {
    let mut sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(ConsoleSink::new())];
    if !config.logging_enabled {
        return Ok((Logger::disabled(name), sinks));
    }

    let file = Arc::new(LogFile::open(&group.log_file)?);
    info!(group = name, path = %group.log_file.display(), "Opened log file");
    sinks.push(Arc::new(JsonLinesSink::new(file.clone())));
    Ok((Logger::to_file(name, file), sinks))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
