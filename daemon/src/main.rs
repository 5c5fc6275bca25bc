//! Fernsprech Media-Daemon – Einstiegspunkt
//!
//! Laedt die Konfiguration, initialisiert das Logging, startet die
//! Media-Engine und laeuft bis Ctrl-C.

use anyhow::Result;
use fernsprech_daemon::{config::DaemonConfig, Daemon};
use fernsprech_observability::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let config_pfad = DaemonConfig::pfad_aus_env();
    let config = DaemonConfig::laden(&config_pfad)?;

    init_logging(&config.logging.level, config.logging.format)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_pfad.display(),
        "Fernsprech-Daemon wird initialisiert"
    );

    // Backend-Start wartet blockierend auf Geraete bzw. Server
    let mut daemon = tokio::task::spawn_blocking(move || -> Result<Daemon> {
        let mut daemon = Daemon::neu(config)?;
        daemon.starten()?;
        Ok(daemon)
    })
    .await??;

    tracing::info!("Daemon laeuft. Warte auf Shutdown-Signal (Ctrl-C)...");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown-Signal empfangen, Daemon wird beendet");

    tokio::task::spawn_blocking(move || daemon.stoppen()).await??;
    Ok(())
}
