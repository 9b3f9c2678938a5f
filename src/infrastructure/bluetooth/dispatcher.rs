//! Frame Dispatcher
//!
//! Chooses between full and diff frames for each grid handed down by the
//! tick driver and queues the packet on the connected session.

use crate::domain::grid::{empty_grid, Grid, GridLayout};
use crate::domain::models::{HardwareError, HardwareEvents, Mode};
use crate::domain::settings::DispatchSettings;
use crate::infrastructure::bluetooth::connection::LinkSession;
use crate::infrastructure::bluetooth::protocol::{self, PinChange};
use crate::infrastructure::bluetooth::scheduler::{Completion, SendError};
use crate::infrastructure::bluetooth::transport::EndpointKind;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Counter value meaning "a full frame is due now"
pub const FULL_FRAME_DUE: u32 = u32::MAX;

/// What to put on the wire for one grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchPlan {
    Full,
    Diff(Vec<PinChange>),
    /// Nothing changed since the last transmitted grid
    Skip,
}

/// Last transmitted grid and the full-frame cadence counter
#[derive(Debug, Clone)]
pub struct DispatchState {
    last_sent: Grid,
    frames_since_full: u32,
}

impl DispatchState {
    pub fn new(len: usize) -> Self {
        Self {
            last_sent: empty_grid(len),
            frames_since_full: FULL_FRAME_DUE,
        }
    }

    /// Make the next planned grid go out as a full frame
    pub fn force_full_frame(&mut self) {
        self.frames_since_full = FULL_FRAME_DUE;
    }

    pub fn last_sent(&self) -> &[u8] {
        &self.last_sent
    }

    /// Decide how to transmit a sanitized grid and advance the state as if
    /// it was sent.
    pub fn plan(&mut self, grid: &[u8], policy: &DispatchSettings) -> DispatchPlan {
        self.frames_since_full = self.frames_since_full.saturating_add(1);

        let plan = if self.frames_since_full >= policy.full_frame_interval {
            DispatchPlan::Full
        } else {
            let changes = protocol::diff_grids(&self.last_sent, grid);
            let ratio = changes.len() as f64 / grid.len().max(1) as f64;
            if changes.is_empty() {
                DispatchPlan::Skip
            } else if ratio > policy.diff_threshold {
                DispatchPlan::Full
            } else {
                DispatchPlan::Diff(changes)
            }
        };

        if plan == DispatchPlan::Full {
            self.frames_since_full = 0;
        }
        self.last_sent.clear();
        self.last_sent.extend_from_slice(grid);
        plan
    }
}

/// Turns grids into queued packets on the active session
pub struct FrameDispatcher {
    layout: GridLayout,
    policy: DispatchSettings,
    state: DispatchState,
    mode: Mode,
    last_seq: u32,
    last_observed: Grid,
    events: Arc<dyn HardwareEvents>,
}

impl FrameDispatcher {
    pub fn new(layout: GridLayout, policy: DispatchSettings, events: Arc<dyn HardwareEvents>) -> Self {
        Self {
            state: DispatchState::new(layout.len),
            last_observed: empty_grid(layout.len),
            layout,
            policy,
            mode: Mode::default(),
            last_seq: 0,
            events,
        }
    }

    /// Called after every (re)connection: device state is unknown
    pub fn force_full_frame(&mut self) {
        self.state.force_full_frame();
    }

    /// Last grid handed in, sanitized, whether or not it was sent
    pub fn last_frame(&self) -> (u32, &[u8]) {
        (self.last_seq, &self.last_observed)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Transmit one grid. Offline this only records it for diagnostics.
    pub fn set_frame(&mut self, seq: u32, grid: &[u8], session: &LinkSession) {
        if grid.len() != self.layout.len {
            error!(
                "set_frame: grid length {} (expected {})",
                grid.len(),
                self.layout.len
            );
            self.events.on_error(HardwareError::GridLength {
                expected: self.layout.len,
                actual: grid.len(),
            });
            return;
        }

        let sanitized = self.layout.sanitize(grid);
        self.last_seq = seq;
        self.last_observed.clone_from(&sanitized);

        let endpoint = match session.endpoint(EndpointKind::Tactile) {
            Some(endpoint) if session.is_connected() => endpoint.clone(),
            _ => {
                trace!("frame #{} kept locally, not connected", seq);
                return;
            }
        };

        let packet = match self.state.plan(&sanitized, &self.policy) {
            DispatchPlan::Full => {
                debug!("frame #{} -> full", seq);
                protocol::build_full_frame(seq, self.mode, &sanitized)
            }
            DispatchPlan::Diff(changes) => {
                debug!("frame #{} -> diff ({} changes)", seq, changes.len());
                match protocol::build_diff_frame(seq, &changes) {
                    Ok(packet) => packet,
                    Err(e) => {
                        error!("Could not build diff frame: {}", e);
                        return;
                    }
                }
            }
            DispatchPlan::Skip => {
                trace!("frame #{} unchanged", seq);
                return;
            }
        };

        let completion = session.scheduler().enqueue(endpoint, packet);
        self.report_failure(completion, HardwareError::SendFailed);
    }

    /// Ask the device to switch mode. Offline this only updates the mode
    /// carried by subsequent full frames.
    pub fn send_mode_command(&mut self, mode: Mode, direction: u8, session: &LinkSession) {
        self.mode = mode;

        let endpoint = match session.endpoint(EndpointKind::Mode) {
            Some(endpoint) if session.is_connected() => endpoint.clone(),
            _ => {
                debug!("Mode command {:?} not sent, not connected", mode);
                return;
            }
        };

        let packet = protocol::build_mode_command(mode, direction).to_vec();
        let completion = session.scheduler().enqueue(endpoint, packet);
        self.report_failure(completion, HardwareError::ModeCommandFailed);
    }

    fn report_failure(&self, completion: Completion, wrap: fn(String) -> HardwareError) {
        let events = self.events.clone();
        tokio::spawn(async move {
            match completion.await {
                Ok(()) => {}
                Err(SendError::Abandoned) => debug!("Queued write dropped by teardown"),
                Err(SendError::Write(e)) => {
                    warn!("Write failed: {}", e);
                    events.on_error(wrap(e.to_string()));
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AppEvent;
    use crate::infrastructure::bluetooth::connection::ConnectionConfig;
    use crate::infrastructure::bluetooth::protocol::WireFrame;
    use crate::infrastructure::bluetooth::simulated::SimulatedTransport;
    use crate::infrastructure::bluetooth::transport::TransportEvent;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        transport: Arc<SimulatedTransport>,
        session: LinkSession,
        dispatcher: FrameDispatcher,
        app_rx: mpsc::UnboundedReceiver<AppEvent>,
        _link_rx: mpsc::UnboundedReceiver<TransportEvent>,
    }

    async fn connected(layout: GridLayout) -> Harness {
        let transport = Arc::new(SimulatedTransport::new("TactileNav-01", layout.len));
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let events: Arc<dyn HardwareEvents> = Arc::new(app_tx);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let mut session = LinkSession::new(
            transport.clone(),
            ConnectionConfig::default(),
            events.clone(),
            link_tx,
        );
        assert!(session.connect().await);
        Harness {
            transport,
            session,
            dispatcher: FrameDispatcher::new(layout, DispatchSettings::default(), events),
            app_rx,
            _link_rx: link_rx,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn errors(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<HardwareError> {
        let mut errors = Vec::new();
        while let Ok(AppEvent::Error(e)) = rx.try_recv() {
            errors.push(e);
        }
        errors
    }

    #[test]
    fn test_plan_cadence() {
        let policy = DispatchSettings::default();
        let mut state = DispatchState::new(15);
        let mut grid = vec![0u8; 15];

        grid[0] = 1;
        assert_eq!(state.plan(&grid, &policy), DispatchPlan::Full);
        for i in 1..10 {
            grid[i] = 1;
            assert!(matches!(state.plan(&grid, &policy), DispatchPlan::Diff(_)));
        }
        grid[10] = 1;
        assert_eq!(state.plan(&grid, &policy), DispatchPlan::Full);
    }

    #[test]
    fn test_plan_full_frame_at_least_every_interval() {
        let policy = DispatchSettings::default();
        let mut state = DispatchState::new(15);
        let mut since_full = 0;
        for n in 0..100u32 {
            let mut grid = vec![0u8; 15];
            grid[(n % 15) as usize] = 1;
            match state.plan(&grid, &policy) {
                DispatchPlan::Full => since_full = 0,
                _ => since_full += 1,
            }
            assert!(since_full < policy.full_frame_interval);
        }
    }

    #[test]
    fn test_plan_skip_and_threshold() {
        let policy = DispatchSettings::default();
        let mut state = DispatchState::new(10);
        assert_eq!(state.plan(&[0; 10], &policy), DispatchPlan::Full);
        assert_eq!(state.plan(&[0; 10], &policy), DispatchPlan::Skip);

        // 5/10 is not above the threshold
        let half = [1, 1, 1, 1, 1, 0, 0, 0, 0, 0];
        assert!(matches!(state.plan(&half, &policy), DispatchPlan::Diff(c) if c.len() == 5));

        // 8/10 changed pins is cheaper as a full frame
        let flipped = [0, 0, 0, 0, 0, 1, 1, 1, 0, 0];
        assert_eq!(state.plan(&flipped, &policy), DispatchPlan::Full);
        assert_eq!(state.last_sent(), &flipped);
    }

    #[tokio::test]
    async fn test_first_frame_full_then_single_change_diff() {
        let mut h = connected(GridLayout::compact15()).await;

        let mut grid = vec![0u8; 15];
        grid[3] = 2;
        grid[7] = 2;
        h.dispatcher.set_frame(1, &grid, &h.session);
        settle().await;

        grid[3] = 0;
        h.dispatcher.set_frame(2, &grid, &h.session);
        settle().await;

        let frames = h.transport.frames();
        assert_eq!(frames.len(), 2);
        let mut expected = vec![0u8; 15];
        expected[3] = 2;
        assert_eq!(
            frames[0],
            WireFrame::Full {
                seq: 1,
                mode: 0,
                grid: expected
            }
        );
        assert_eq!(
            frames[1],
            WireFrame::Diff {
                seq: 2,
                changes: vec![PinChange { index: 3, value: 0 }]
            }
        );
    }

    #[tokio::test]
    async fn test_wrong_length_reports_and_sends_nothing() {
        let mut h = connected(GridLayout::compact15()).await;
        h.dispatcher.set_frame(1, &[0u8; 14], &h.session);
        settle().await;

        assert!(h.transport.writes().is_empty());
        assert_eq!(
            errors(&mut h.app_rx),
            vec![HardwareError::GridLength {
                expected: 15,
                actual: 14
            }]
        );
    }

    #[tokio::test]
    async fn test_offline_frames_are_observed_only() {
        let mut h = connected(GridLayout::compact15()).await;
        h.session.disconnect().await;

        let grid = vec![1u8; 15];
        h.dispatcher.set_frame(4, &grid, &h.session);
        settle().await;

        assert!(h.transport.writes().is_empty());
        let (seq, last) = h.dispatcher.last_frame();
        assert_eq!(seq, 4);
        assert_eq!(last[7], 0);
        assert!(errors(&mut h.app_rx).is_empty());
    }

    #[tokio::test]
    async fn test_self_pin_never_transmitted_raised() {
        let mut h = connected(GridLayout::braille105()).await;
        let grid = vec![2u8; 105];
        h.dispatcher.set_frame(1, &grid, &h.session);
        settle().await;

        match &h.transport.frames()[0] {
            WireFrame::Full { grid, .. } => {
                assert_eq!(grid[97], 0);
                assert!(grid[..90].iter().all(|&l| l == 1));
                assert_eq!(grid[90], 2);
            }
            other => panic!("expected full frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forced_full_frame_after_reconnect() {
        let mut h = connected(GridLayout::compact15()).await;
        let mut grid = vec![0u8; 15];
        h.dispatcher.set_frame(1, &grid, &h.session);
        grid[0] = 1;
        h.dispatcher.set_frame(2, &grid, &h.session);
        h.dispatcher.force_full_frame();
        grid[1] = 1;
        h.dispatcher.set_frame(3, &grid, &h.session);
        settle().await;

        let frames = h.transport.frames();
        assert!(matches!(frames[0], WireFrame::Full { .. }));
        assert!(matches!(frames[1], WireFrame::Diff { .. }));
        assert!(matches!(frames[2], WireFrame::Full { seq: 3, .. }));
    }

    #[tokio::test]
    async fn test_write_failure_reports_send_failed() {
        let mut h = connected(GridLayout::compact15()).await;
        h.transport.fail_next_writes(1);
        h.dispatcher.set_frame(1, &[0u8; 15], &h.session);
        settle().await;

        let errors = errors(&mut h.app_rx);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], HardwareError::SendFailed(_)));
        // Not rolled back: the next identical grid is skipped
        h.dispatcher.set_frame(2, &[0u8; 15], &h.session);
        settle().await;
        assert!(h.transport.writes().is_empty());
    }

    #[tokio::test]
    async fn test_mode_command_written_and_used_in_full_frames() {
        let mut h = connected(GridLayout::compact15()).await;
        h.dispatcher.send_mode_command(Mode::Zoom, 0, &h.session);
        h.dispatcher.set_frame(1, &[0u8; 15], &h.session);
        settle().await;

        let writes = h.transport.writes();
        assert_eq!(writes[0].kind, EndpointKind::Mode);
        assert_eq!(writes[0].payload, vec![0x10, 1, 0, 0x11]);
        assert!(matches!(h.transport.frames()[0], WireFrame::Full { mode: 1, .. }));
    }

    #[tokio::test]
    async fn test_mode_command_failure_reported() {
        let mut h = connected(GridLayout::compact15()).await;
        h.transport.fail_next_writes(1);
        h.dispatcher.send_mode_command(Mode::Zoom, 0, &h.session);
        settle().await;
        let errors = errors(&mut h.app_rx);
        assert!(matches!(
            errors.as_slice(),
            [HardwareError::ModeCommandFailed(_)]
        ));
    }
}
