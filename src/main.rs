use std::sync::Arc;
use tactile_nav::domain::algorithm::RandomGridProducer;
use tactile_nav::domain::integration::Integration;
use tactile_nav::domain::settings::{Settings, SettingsService};
use tactile_nav::infrastructure::bluetooth::simulated::SimulatedTransport;
use tactile_nav::infrastructure::bluetooth::transport::BleTransport;
use tactile_nav::infrastructure::bluetooth::HardwareService;
use tactile_nav::infrastructure::logging;
use tokio::sync::mpsc;
use tracing::{info, warn};

fn select_transport(settings: &Settings, simulate: bool) -> Arc<dyn BleTransport> {
    let grid_len = settings.grid_layout().len;
    let simulated = || -> Arc<dyn BleTransport> {
        info!("Using simulated device");
        Arc::new(SimulatedTransport::new(
            &format!("{}-SIM", settings.ble.name_prefix),
            grid_len,
        ))
    };

    if simulate {
        return simulated();
    }

    #[cfg(windows)]
    {
        use std::time::Duration;
        use tactile_nav::infrastructure::bluetooth::winrt::WinRtTransport;

        let transport = WinRtTransport::new(Duration::from_millis(settings.ble.scan_timeout_ms));
        if transport.is_available() {
            return Arc::new(transport);
        }
        warn!("Bluetooth LE unavailable, falling back to simulation");
    }
    #[cfg(not(windows))]
    warn!("No native BLE backend on this platform, falling back to simulation");

    simulated()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let simulate = std::env::args().any(|arg| arg == "--simulate");

    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting TactileNav ({:?} layout)", settings.layout);

    let transport = select_transport(&settings, simulate);
    let (app_tx, app_rx) = mpsc::unbounded_channel();
    let (service, hardware) = HardwareService::new(transport, &settings, Arc::new(app_tx));
    let service_task = tokio::spawn(service.run());

    if !hardware.connect().await {
        warn!("Device not connected; frames are kept until it is");
    }

    let producer = RandomGridProducer::new(settings.grid_layout());
    let mut integration = Integration::new(hardware.clone(), Box::new(producer), &settings);
    integration
        .run(app_rx, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await;

    hardware.disconnect();
    hardware.shutdown();
    service_task.await?;

    if let Err(e) = settings_service.save() {
        warn!("Failed to save settings: {}", e);
    }
    info!("TactileNav stopped");
    Ok(())
}
