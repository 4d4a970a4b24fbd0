mod admin;
mod bot;
mod bus;
mod config;
mod db;
mod error;
mod flow;
mod ledger;
mod logging;
mod pour;
mod supervisor;
mod thermo;
mod ui;

use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use bot::NoopBot;
use bus::SerialOneWireBus;
use config::AppConfig;
use db::Database;
use flow::SerialFlowController;
use supervisor::Supervisor;
use thermo::SerialTempSensor;
use ui::{LogLcd, NullUi, UiSink};

/// Dispensing control loop for an instrumented kegerator: token
/// authorization, flow metering, valve gating, and thermostatic control.
#[derive(Parser, Debug)]
#[command(name = "kegbotd", version, about)]
struct Cli {
    /// Path to the INI configuration file (§6).
    #[arg(short, long, default_value = "keg.cfg", env = "KEGBOT_CONFIG")]
    config: String,

    /// Path to the SQLite database file.
    #[arg(long, default_value = "kegbot.db", env = "KEGBOT_DATABASE")]
    database: String,

    /// Load the config, run migrations, and exit without starting the
    /// control loop — for validating a config file, mirroring
    /// `coolercontrold --config`'s check flag.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    let log_echo = logging::init(&config.logging)?;

    let db = Database::connect(&cli.database).await?;
    db.migrate().await?;

    if cli.once {
        info!("config and database check passed (--once); exiting");
        return Ok(());
    }

    let bus = SerialOneWireBus::open(&config.devices.onewire)
        .map_err(|e| anyhow::anyhow!("opening 1-Wire bus device: {e}"))?;
    let flow = SerialFlowController::open(&config.devices.flow)
        .map_err(|e| anyhow::anyhow!("opening flow controller device: {e}"))?;
    let sensor = SerialTempSensor::open(&config.devices.thermo)
        .map_err(|e| anyhow::anyhow!("opening thermo sensor device: {e}"))?;

    let ui: Arc<dyn UiSink> = if config.ui.use_lcd {
        Arc::new(LogLcd)
    } else {
        Arc::new(NullUi)
    };
    let bot = Arc::new(NoopBot);

    let supervisor = Supervisor::new(config, db, bus, flow, sensor, ui, bot);
    let admin_handle = supervisor.admin_handle(log_echo);
    let shutdown = supervisor.shutdown_token();

    let admin_task = tokio::task::spawn_blocking(move || admin::run(admin_handle));
    let signal_task = tokio::spawn(install_signal_handlers(shutdown));

    supervisor.run().await?;

    signal_task.abort();
    let _ = admin_task.await;

    Ok(())
}

/// §6: SIGHUP, SIGINT, SIGQUIT, SIGTERM all request a graceful shutdown; a
/// second signal of any of these kinds escalates to an immediate exit,
/// matching the original's `setsigs` double-signal behavior.
async fn install_signal_handlers(shutdown: tokio_util::sync::CancellationToken) {
    let (mut hup, mut int, mut quit, mut term) = match (
        signal(SignalKind::hangup()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::quit()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(h), Ok(i), Ok(q), Ok(t)) => (h, i, q, t),
        _ => {
            warn!("failed to install unix signal handlers; shutdown must be triggered via the admin shell");
            return;
        }
    };

    tokio::select! {
        _ = hup.recv() => info!(signal = "SIGHUP", "shutdown requested"),
        _ = int.recv() => info!(signal = "SIGINT", "shutdown requested"),
        _ = quit.recv() => info!(signal = "SIGQUIT", "shutdown requested"),
        _ = term.recv() => info!(signal = "SIGTERM", "shutdown requested"),
    }
    shutdown.cancel();

    tokio::select! {
        _ = hup.recv() => {}
        _ = int.recv() => {}
        _ = quit.recv() => {}
        _ = term.recv() => {}
    }
    warn!("second termination signal received; exiting immediately");
    std::process::exit(130);
}
