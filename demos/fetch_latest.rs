use std::{env, fs::File, io::BufWriter};
use bipfetch::{BipDevice, BipError, ConnectionParams, FetchConfig, Result, SyncEvent};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Device key as 32 hex digits, from the first argument or BIP_KEY
    let Some(key) = env::args().nth(1).or_else(|| env::var("BIP_KEY").ok()) else {
        error!("Usage: fetch_latest <device-key-hex> [output.gpx]");
        return Err(BipError::Configuration("missing device key".to_string()));
    };
    let output = env::args()
        .nth(2)
        .unwrap_or_else(|| "activity.gpx".to_string());

    info!("⌚ bipfetch: fetch latest activity");
    info!("Searching for Amazfit watches...");

    let mut device = match BipDevice::connect_first_with_params(
        ConnectionParams::default(),
        FetchConfig::default(),
    )
    .await
    {
        Ok(device) => {
            info!("✅ Connected to: {}", device.device_info().name);
            device
        }
        Err(e) => {
            error!("❌ Failed to connect to watch: {}", e);
            return Err(e);
        }
    };

    let mut events = device.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::Progress { bytes_received } => info!("📥 {} bytes", bytes_received),
                SyncEvent::Completed(summary) => info!("🏁 Fetch {}", summary.outcome),
                SyncEvent::Failed { reason } => warn!("⚠️ {}", reason),
            }
        }
    });

    info!("🔐 Authenticating...");
    if let Err(e) = device.authenticate_hex(&key).await {
        error!("❌ Authentication failed: {}", e);
        return Err(e);
    }

    if let Err(e) = device.sync_time().await {
        warn!("⚠️ Clock sync failed: {}", e);
    }

    let summary = device.fetch_activities().await?;
    info!("📊 Activity:");
    info!("  Outcome: {}", summary.outcome);
    info!("  Bytes: {}", summary.bytes_received);
    info!("  Distance: {:.2} km", summary.distance_km);
    info!("  Duration: {}", summary.duration_hms());
    if let Some(calories) = summary.calorie_estimate {
        info!("  Calories: {}", calories);
    }
    if let Some(hr) = summary.avg_heart_rate {
        info!("  Avg HR: {:.0} bpm", hr);
    }
    if !summary.is_real_data {
        warn!("⚠️ Stream could not be decoded, only the byte count is reported");
    }

    if summary.position_points().next().is_some() {
        let file = File::create(&output)?;
        device.export_gpx_to(&summary, BufWriter::new(file))?;
        info!("💾 Track written to {}", output);
    } else {
        info!("No GPS points to export");
    }

    device.disconnect().await?;
    drop(device);
    let _ = printer.await;

    info!("✅ Done");
    Ok(())
}
