use log::{debug, error, info, warn};
use tokio::sync::watch;

use progressor_client::bluetooth::BluerTransport;
use progressor_client::config::SessionConfig;
use progressor_client::models::SessionReport;
use progressor_client::session::SessionController;
use progressor_client::utils::format_datetime;

fn print_report(report: &SessionReport) {
    info!("---Device information---");
    info!("  Name: {} ({})", report.device.name, report.device.address);
    info!(
        "  FW version: {}",
        report.device.firmware_version.as_deref().unwrap_or("unknown")
    );
    match report.device.battery_millivolts {
        Some(mv) => info!("  Battery voltage: {} mV", mv),
        None => info!("  Battery voltage: unknown"),
    }
    info!(
        "  Crashlog: {}",
        report.device.crash_log.as_deref().unwrap_or("empty")
    );

    info!(
        "Session started at {}, {} samples",
        format_datetime(&report.started_at),
        report.samples.len()
    );
    if let Some(last) = report.samples.last() {
        info!("  Last sample at {:.3} s", last.timestamp);
    }

    match report.summary {
        Some(summary) => info!(
            "Measurement = {:.2} ± {:.2} kg",
            summary.median, summary.mad
        ),
        None => warn!("No weight samples collected!"),
    }

    if report.low_power_warnings > 0 {
        warn!(
            "Device reported low battery {} times",
            report.low_power_warnings
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match SessionConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Handle Ctrl+C gracefully: the session winds down and disconnects
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Session interrupted by user. Disconnecting.");
            let _ = shutdown_tx.send(true);
        }
    });

    let transport = BluerTransport::new().await?;
    let mut controller = SessionController::new(transport, config).with_shutdown(shutdown_rx);

    let result = controller.run().await;
    debug!("Session ended in state {:?}", controller.state());

    match result {
        Ok(report) => print_report(&report),
        Err(e) => {
            error!("Fatal error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
