//! Integration layer
//!
//! Drives the producer at the mode's tick rate, forwards each grid to the
//! hardware service, toggles modes on button presses and keeps a short
//! error log for display.

use crate::domain::algorithm::GridProducer;
use crate::domain::grid::Grid;
use crate::domain::models::{AppEvent, ButtonEvent, HardwareError, Mode};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::service::HardwareHandle;
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Errors kept for display
pub const MAX_ERRORS: usize = 20;
pub const MIN_FPS: u32 = 1;
pub const MAX_FPS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    /// Seconds since the Unix epoch
    pub time: u64,
    pub message: String,
}

/// Snapshot handed to the UI bridge after every change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationStats {
    pub running: bool,
    pub mode: Mode,
    pub mode_name: &'static str,
    pub fps: u32,
    pub measured_fps: u32,
    pub latency_ms: u64,
    pub seq: u32,
    pub connected: bool,
    pub errors: Vec<ErrorEntry>,
    pub last_grid: Grid,
}

pub struct Integration {
    hardware: HardwareHandle,
    producer: Box<dyn GridProducer>,
    fps_map: u32,
    fps_zoom: u32,
    mode: Mode,
    running: bool,
    seq: u32,
    fps: u32,
    last_tick: Option<Instant>,
    measured_fps: u32,
    last_latency: Duration,
    errors: VecDeque<ErrorEntry>,
    stats: watch::Sender<IntegrationStats>,
}

impl Integration {
    pub fn new(hardware: HardwareHandle, producer: Box<dyn GridProducer>, settings: &Settings) -> Self {
        let mode = Mode::default();
        let fps = settings.default_fps(mode).clamp(MIN_FPS, MAX_FPS);
        let (stats, _) = watch::channel(IntegrationStats {
            running: false,
            mode,
            mode_name: mode.name(),
            fps,
            measured_fps: 0,
            latency_ms: 0,
            seq: 0,
            connected: false,
            errors: Vec::new(),
            last_grid: hardware.last_frame().1,
        });

        Self {
            hardware,
            producer,
            fps_map: settings.fps_map,
            fps_zoom: settings.fps_zoom,
            mode,
            running: false,
            seq: 0,
            fps,
            last_tick: None,
            measured_fps: 0,
            last_latency: Duration::ZERO,
            errors: VecDeque::new(),
            stats,
        }
    }

    /// Receive a stats snapshot after every change
    pub fn subscribe(&self) -> watch::Receiver<IntegrationStats> {
        self.stats.subscribe()
    }

    pub fn start(&mut self) {
        if self.running {
            return;
        }
        info!("Integration started in {} mode", self.mode.name());
        self.running = true;
        self.seq = 0;
        self.last_tick = None;
        self.measured_fps = 0;
        self.notify();
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        info!("Integration stopped at seq {}", self.seq);
        self.running = false;
        self.notify();
    }

    /// Switch mode, reset the tick rate to the mode default and tell the device
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.fps = match mode {
            Mode::Map => self.fps_map,
            Mode::Zoom => self.fps_zoom,
        }
        .clamp(MIN_FPS, MAX_FPS);
        info!("Mode -> {} at {} fps", mode.name(), self.fps);
        self.hardware.send_mode_command(mode, 0);
        self.notify();
    }

    pub fn toggle_mode(&mut self) {
        self.set_mode(self.mode.toggled());
    }

    pub fn set_fps(&mut self, fps: u32) {
        self.fps = fps.clamp(MIN_FPS, MAX_FPS);
        self.notify();
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Produce one grid and hand it to the hardware
    pub fn tick(&mut self) {
        if !self.running {
            return;
        }
        let started = Instant::now();
        self.seq = self.seq.wrapping_add(1);
        let grid = match self.mode {
            Mode::Map => self.producer.produce_map(),
            Mode::Zoom => self.producer.produce_zoom(),
        };
        self.hardware.set_frame(self.seq, grid);

        let now = Instant::now();
        if let Some(last) = self.last_tick {
            let elapsed = now.duration_since(last).as_secs_f64();
            self.measured_fps = if elapsed > 0.0 {
                (1.0 / elapsed).round() as u32
            } else {
                0
            };
        }
        self.last_tick = Some(now);
        self.last_latency = now.duration_since(started);
        self.notify();
    }

    /// Record an error for display, keeping the most recent ones
    pub fn on_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("Error: {}", message);
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.errors.push_back(ErrorEntry { time, message });
        while self.errors.len() > MAX_ERRORS {
            self.errors.pop_front();
        }
        self.notify();
    }

    pub fn on_button_event(&mut self, event: ButtonEvent) {
        debug!("Button event {:?}", event);
        if event.value == ButtonEvent::TOGGLE_MODE {
            self.toggle_mode();
        }
    }

    /// Same as a press of the device's mode button
    pub fn simulate_button(&mut self) {
        self.on_button_event(ButtonEvent {
            value: ButtonEvent::TOGGLE_MODE,
        });
    }

    pub fn handle_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::Button(button) => self.on_button_event(button),
            AppEvent::Error(error) => self.report(error),
        }
    }

    pub fn stats(&self) -> IntegrationStats {
        IntegrationStats {
            running: self.running,
            mode: self.mode,
            mode_name: self.mode.name(),
            fps: self.fps,
            measured_fps: self.measured_fps,
            latency_ms: self.last_latency.as_millis() as u64,
            seq: self.seq,
            connected: self.hardware.is_connected(),
            errors: self.errors.iter().cloned().collect(),
            last_grid: self.hardware.last_frame().1,
        }
    }

    /// Tick at the current rate and react to hardware events until `shutdown`
    pub async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<AppEvent>,
        shutdown: impl Future<Output = ()>,
    ) {
        tokio::pin!(shutdown);
        self.start();

        'outer: loop {
            let fps = self.fps;
            let mut ticker = interval(Duration::from_secs_f64(1.0 / fps as f64));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while self.fps == fps {
                tokio::select! {
                    _ = &mut shutdown => break 'outer,
                    _ = ticker.tick() => self.tick(),
                    Some(event) = events.recv() => self.handle_event(event),
                }
            }
            debug!("Re-arming ticker at {} fps", self.fps);
        }

        self.stop();
    }

    fn report(&mut self, error: HardwareError) {
        self.on_error(error.to_string());
    }

    fn notify(&self) {
        self.stats.send_replace(self.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::algorithm::{RandomGridProducer, ZoomContent};
    use crate::domain::grid::GridLayout;
    use crate::infrastructure::bluetooth::protocol::WireFrame;
    use crate::infrastructure::bluetooth::service::HardwareService;
    use crate::infrastructure::bluetooth::simulated::SimulatedTransport;
    use crate::infrastructure::bluetooth::transport::EndpointKind;
    use std::sync::Arc;

    struct Fixture {
        integration: Integration,
        transport: Arc<SimulatedTransport>,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    async fn fixture() -> Fixture {
        let settings = Settings::default();
        let transport = Arc::new(SimulatedTransport::new("TactileNav-01", 15));
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let (service, handle) =
            HardwareService::new(transport.clone(), &settings, Arc::new(app_tx));
        tokio::spawn(service.run());
        assert!(handle.connect().await);

        let mut producer = RandomGridProducer::seeded(GridLayout::compact15(), 3);
        producer.set_zoom_content(ZoomContent {
            left: [2; 6],
            right: [1; 6],
        });
        Fixture {
            integration: Integration::new(handle, Box::new(producer), &settings),
            transport,
            events: app_rx,
        }
    }

    #[tokio::test]
    async fn test_tick_requires_running() {
        let mut f = fixture().await;
        f.integration.tick();
        assert_eq!(f.integration.stats().seq, 0);

        f.integration.start();
        f.integration.tick();
        f.integration.tick();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = f.integration.stats();
        assert_eq!(stats.seq, 2);
        assert!(stats.connected);
        assert!(!f.transport.frames().is_empty());
    }

    #[tokio::test]
    async fn test_button_toggles_mode_and_notifies_device() {
        let mut f = fixture().await;
        f.integration.simulate_button();
        assert_eq!(f.integration.mode(), Mode::Zoom);
        assert_eq!(f.integration.fps(), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let writes = f.transport.writes();
        assert_eq!(writes[0].kind, EndpointKind::Mode);
        assert_eq!(writes[0].payload, vec![0x10, 1, 0, 0x11]);

        f.integration.start();
        f.integration.tick();
        tokio::time::sleep(Duration::from_millis(20)).await;
        match &f.transport.frames()[0] {
            WireFrame::Full { mode, grid, .. } => {
                assert_eq!(*mode, 1);
                assert_eq!(grid[0], 2);
                assert_eq!(grid[3], 1);
                assert_eq!(grid[2], 0);
            }
            other => panic!("expected full frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_log_is_bounded() {
        let mut f = fixture().await;
        for i in 0..25 {
            f.integration.on_error(format!("error {}", i));
        }
        let stats = f.integration.stats();
        assert_eq!(stats.errors.len(), MAX_ERRORS);
        assert_eq!(stats.errors[0].message, "error 5");
        assert_eq!(stats.errors[19].message, "error 24");
    }

    #[tokio::test]
    async fn test_fps_is_clamped() {
        let mut f = fixture().await;
        f.integration.set_fps(0);
        assert_eq!(f.integration.fps(), 1);
        f.integration.set_fps(120);
        assert_eq!(f.integration.fps(), 30);
    }

    #[tokio::test]
    async fn test_hardware_errors_land_in_log() {
        let mut f = fixture().await;
        f.integration.handle_event(AppEvent::Error(HardwareError::LowBattery(10)));
        let updates = f.integration.subscribe();
        assert_eq!(updates.borrow().errors[0].message, "Low battery: 10%");
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_shutdown() {
        let mut f = fixture().await;
        let events = std::mem::replace(&mut f.events, mpsc::unbounded_channel().1);
        f.integration
            .run(events, tokio::time::sleep(Duration::from_millis(1100)))
            .await;

        let stats = f.integration.stats();
        assert!(!stats.running);
        // 5 fps: ticks at 0, 200, ..., 1000 ms
        assert_eq!(stats.seq, 6);
    }
}
