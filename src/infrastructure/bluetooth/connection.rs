//! BLE Connection Module
//!
//! Owns the link to a single pin display: discovery, GATT endpoint
//! resolution, status notifications, and bounded automatic reconnection.

use crate::domain::models::{DeviceStatus, HardwareError, HardwareEvents, LinkState};
use crate::domain::settings::BleSettings;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::scheduler::SendScheduler;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, Endpoint, EndpointKind, PeerHandle, TransportError, TransportEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Battery percentages in this open range raise a low-battery warning
const LOW_BATTERY_RANGE: std::ops::Range<i32> = 1..20;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Advertised name prefix to look for
    pub name_prefix: String,
    /// Service UUID to look for
    pub service_uuid: String,
    /// Frame characteristic UUID
    pub tactile_char_uuid: String,
    /// Mode command characteristic UUID
    pub mode_char_uuid: String,
    /// Status notification characteristic UUID
    pub status_char_uuid: String,
    /// Automatic reconnection attempts after a link drop
    pub reconnect_attempts: u32,
    /// Delay before each reconnection attempt
    pub reconnect_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&BleSettings::default())
    }
}

impl From<&BleSettings> for ConnectionConfig {
    fn from(s: &BleSettings) -> Self {
        Self {
            name_prefix: s.name_prefix.clone(),
            service_uuid: s.service_uuid.clone(),
            tactile_char_uuid: s.tactile_char_uuid.clone(),
            mode_char_uuid: s.mode_char_uuid.clone(),
            status_char_uuid: s.status_char_uuid.clone(),
            reconnect_attempts: s.reconnect_attempts,
            reconnect_delay: Duration::from_millis(s.reconnect_delay_ms),
        }
    }
}

/// Characteristics resolved on the connected peer
#[derive(Debug, Clone)]
pub struct ResolvedEndpoints {
    pub tactile: Endpoint,
    pub mode: Endpoint,
    /// Optional: older firmware has no status characteristic
    pub status: Option<Endpoint>,
}

/// Inputs to the link state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInput {
    ConnectRequested,
    Established,
    ConnectFailed,
    LinkLost,
    ReconnectFailed,
    ManualDisconnect,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEffect {
    /// Forget endpoints and abandon queued writes
    Teardown,
    /// Arm the reconnection timer
    ScheduleReconnect,
    /// Tell the user to reconnect by hand
    ReportExhausted,
}

/// Pure link state transition.
///
/// `Reconnecting { attempt }` counts attempts that already failed.
pub fn transition(
    state: LinkState,
    input: LinkInput,
    max_attempts: u32,
) -> (LinkState, Vec<LinkEffect>) {
    use LinkEffect::*;
    use LinkState::*;

    match (state, input) {
        (Disconnected | Reconnecting { .. }, LinkInput::ConnectRequested) => (Connecting, vec![]),
        (Connecting | Reconnecting { .. }, LinkInput::Established) => (Connected, vec![]),
        (Connecting, LinkInput::ConnectFailed) => (Disconnected, vec![]),
        (Connected, LinkInput::LinkLost) => {
            if max_attempts == 0 {
                (Disconnected, vec![Teardown, ReportExhausted])
            } else {
                (Reconnecting { attempt: 0 }, vec![Teardown, ScheduleReconnect])
            }
        }
        (Reconnecting { attempt }, LinkInput::ReconnectFailed) => {
            let attempt = attempt + 1;
            if attempt >= max_attempts {
                (Disconnected, vec![ReportExhausted])
            } else {
                (Reconnecting { attempt }, vec![ScheduleReconnect])
            }
        }
        (_, LinkInput::ManualDisconnect) => (Disconnected, vec![Teardown]),
        (state, _) => (state, vec![]),
    }
}

/// Connection to one pin display
pub struct LinkSession {
    transport: Arc<dyn BleTransport>,
    config: ConnectionConfig,
    events: Arc<dyn HardwareEvents>,
    link_events: mpsc::UnboundedSender<TransportEvent>,
    scheduler: SendScheduler,
    state: LinkState,
    peer: Option<PeerHandle>,
    endpoints: Option<ResolvedEndpoints>,
    status: DeviceStatus,
    reconnect_at: Option<Instant>,
}

impl LinkSession {
    /// Create a session; transport events are delivered to `link_events`
    pub fn new(
        transport: Arc<dyn BleTransport>,
        config: ConnectionConfig,
        events: Arc<dyn HardwareEvents>,
        link_events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            scheduler: SendScheduler::new(transport.clone()),
            transport,
            config,
            events,
            link_events,
            state: LinkState::Disconnected,
            peer: None,
            endpoints: None,
            status: DeviceStatus::default(),
            reconnect_at: None,
        }
    }

    /// Discover the device and open a session.
    ///
    /// Failures are reported through the error sink; a cancelled chooser is not.
    pub async fn connect(&mut self) -> bool {
        if !self.transport.is_available() {
            error!("BLE transport unavailable");
            self.events.on_error(HardwareError::Unsupported);
            return false;
        }
        if matches!(self.state, LinkState::Connected | LinkState::Connecting) {
            debug!("connect() ignored in state {:?}", self.state);
            return self.state == LinkState::Connected;
        }

        self.reconnect_at = None;
        self.apply(LinkInput::ConnectRequested);
        info!(
            "Requesting device with prefix '{}'",
            self.config.name_prefix
        );

        let peer = match self.transport.request_device(&self.config.name_prefix).await {
            Ok(peer) => peer,
            Err(TransportError::Cancelled) => {
                info!("Device selection cancelled by user");
                self.apply(LinkInput::ConnectFailed);
                return false;
            }
            Err(e) => {
                self.fail_connect(e);
                return false;
            }
        };

        info!("Connecting to {} ({})", peer.name, peer.id);
        match self.establish(&peer).await {
            Ok(()) => {
                self.peer = Some(peer);
                self.apply(LinkInput::Established);
                info!("Connected");
                true
            }
            Err(e) => {
                self.close_partial().await;
                self.fail_connect(e);
                false
            }
        }
    }

    /// Caller-initiated teardown; never triggers reconnection
    pub async fn disconnect(&mut self) {
        if self.transport.is_linked() {
            self.transport.disconnect().await;
        }
        self.reconnect_at = None;
        self.peer = None;
        self.apply(LinkInput::ManualDisconnect);
        info!("Disconnected from device");
    }

    /// React to a link event delivered by the transport
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Disconnected => {
                if self.state != LinkState::Connected {
                    debug!("Ignoring link loss in state {:?}", self.state);
                    return;
                }
                warn!("Link to device lost");
                self.apply(LinkInput::LinkLost);
            }
            TransportEvent::Notification { uuid, data } => {
                if uuid.eq_ignore_ascii_case(&self.config.status_char_uuid) {
                    self.handle_status(&data);
                } else {
                    debug!("Notification from unexpected characteristic {}", uuid);
                }
            }
        }
    }

    /// When the next reconnection attempt is due, if one is pending
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Run one reconnection attempt. Returns true once connected again.
    pub async fn reconnect_attempt(&mut self) -> bool {
        let LinkState::Reconnecting { attempt } = self.state else {
            self.reconnect_at = None;
            return false;
        };
        self.reconnect_at = None;

        let Some(peer) = self.peer.clone() else {
            self.apply(LinkInput::ReconnectFailed);
            return false;
        };

        info!(
            "Reconnection attempt {}/{}",
            attempt + 1,
            self.config.reconnect_attempts
        );
        match self.establish(&peer).await {
            Ok(()) => {
                self.apply(LinkInput::Established);
                info!("Reconnected");
                true
            }
            Err(e) => {
                warn!("Reconnection attempt {} failed: {}", attempt + 1, e);
                self.close_partial().await;
                self.apply(LinkInput::ReconnectFailed);
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected && self.endpoints.is_some()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn endpoint(&self, kind: EndpointKind) -> Option<&Endpoint> {
        let endpoints = self.endpoints.as_ref()?;
        match kind {
            EndpointKind::Tactile => Some(&endpoints.tactile),
            EndpointKind::Mode => Some(&endpoints.mode),
            EndpointKind::Status => endpoints.status.as_ref(),
        }
    }

    pub fn scheduler(&self) -> &SendScheduler {
        &self.scheduler
    }

    /// Open GATT and resolve every endpoint; shared by connect and reconnect
    async fn establish(&mut self, peer: &PeerHandle) -> Result<(), TransportError> {
        self.transport
            .connect(peer, self.link_events.clone())
            .await?;

        let service = self.config.service_uuid.as_str();
        let tactile = self
            .transport
            .resolve_endpoint(service, EndpointKind::Tactile, &self.config.tactile_char_uuid)
            .await?;
        info!("Found tactile characteristic");
        let mode = self
            .transport
            .resolve_endpoint(service, EndpointKind::Mode, &self.config.mode_char_uuid)
            .await?;
        info!("Found mode characteristic");

        let status = match self
            .transport
            .resolve_endpoint(service, EndpointKind::Status, &self.config.status_char_uuid)
            .await
        {
            Ok(endpoint) => match self.transport.subscribe(&endpoint).await {
                Ok(()) => {
                    info!("Status notifications enabled");
                    Some(endpoint)
                }
                Err(e) => {
                    warn!("Could not enable status notifications: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Status characteristic unavailable: {}", e);
                None
            }
        };

        self.endpoints = Some(ResolvedEndpoints {
            tactile,
            mode,
            status,
        });
        Ok(())
    }

    async fn close_partial(&mut self) {
        self.endpoints = None;
        if self.transport.is_linked() {
            self.transport.disconnect().await;
        }
    }

    fn fail_connect(&mut self, e: TransportError) {
        error!("Connection failed: {}", e);
        self.apply(LinkInput::ConnectFailed);
        let error = match e {
            TransportError::Unsupported => HardwareError::Unsupported,
            other => HardwareError::ConnectionFailed(other.to_string()),
        };
        self.events.on_error(error);
    }

    fn handle_status(&mut self, data: &[u8]) {
        let Some(report) = protocol::parse_status_packet(data) else {
            return;
        };
        debug!("Device status: {:?}", report.status);
        self.status = report.status;

        if LOW_BATTERY_RANGE.contains(&report.status.battery) {
            self.events
                .on_error(HardwareError::LowBattery(report.status.battery));
        }
        if report.status.error_code != 0 {
            self.events
                .on_error(HardwareError::DeviceError(report.status.error_code));
        }
        if let Some(button) = report.button {
            self.events.on_button_event(button);
        }
    }

    fn apply(&mut self, input: LinkInput) {
        let (next, effects) = transition(self.state, input, self.config.reconnect_attempts);
        if next != self.state {
            debug!("Link state {:?} -> {:?} on {:?}", self.state, next, input);
        }
        self.state = next;

        for effect in effects {
            match effect {
                LinkEffect::Teardown => {
                    self.endpoints = None;
                    self.scheduler.clear();
                }
                LinkEffect::ScheduleReconnect => {
                    self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
                }
                LinkEffect::ReportExhausted => {
                    error!("Automatic reconnection exhausted");
                    self.reconnect_at = None;
                    self.events.on_error(HardwareError::ReconnectExhausted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AppEvent, ButtonEvent};
    use crate::infrastructure::bluetooth::simulated::SimulatedTransport;

    struct Harness {
        transport: Arc<SimulatedTransport>,
        session: LinkSession,
        app_rx: mpsc::UnboundedReceiver<AppEvent>,
        link_rx: mpsc::UnboundedReceiver<TransportEvent>,
    }

    fn harness(transport: SimulatedTransport) -> Harness {
        let transport = Arc::new(transport);
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let session = LinkSession::new(
            transport.clone(),
            ConnectionConfig::default(),
            Arc::new(app_tx),
            link_tx,
        );
        Harness {
            transport,
            session,
            app_rx,
            link_rx,
        }
    }

    fn drain_errors(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<HardwareError> {
        let mut errors = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::Error(e) = event {
                errors.push(e);
            }
        }
        errors
    }

    #[test]
    fn test_transition_reconnect_budget() {
        let (state, effects) = transition(LinkState::Connected, LinkInput::LinkLost, 3);
        assert_eq!(state, LinkState::Reconnecting { attempt: 0 });
        assert_eq!(effects, vec![LinkEffect::Teardown, LinkEffect::ScheduleReconnect]);

        let (state, _) = transition(state, LinkInput::ReconnectFailed, 3);
        let (state, effects) = transition(state, LinkInput::ReconnectFailed, 3);
        assert_eq!(state, LinkState::Reconnecting { attempt: 2 });
        assert_eq!(effects, vec![LinkEffect::ScheduleReconnect]);

        let (state, effects) = transition(state, LinkInput::ReconnectFailed, 3);
        assert_eq!(state, LinkState::Disconnected);
        assert_eq!(effects, vec![LinkEffect::ReportExhausted]);
    }

    #[test]
    fn test_transition_ignores_link_loss_when_idle() {
        let (state, effects) = transition(LinkState::Disconnected, LinkInput::LinkLost, 3);
        assert_eq!(state, LinkState::Disconnected);
        assert!(effects.is_empty());
    }

    #[tokio::test]
    async fn test_connect_resolves_endpoints() {
        let mut h = harness(SimulatedTransport::new("TactileNav-01", 15));
        assert!(h.session.connect().await);
        assert!(h.session.is_connected());
        assert!(h.session.endpoint(EndpointKind::Tactile).is_some());
        assert!(h.session.endpoint(EndpointKind::Mode).is_some());
        assert!(h.session.endpoint(EndpointKind::Status).is_some());
        assert!(drain_errors(&mut h.app_rx).is_empty());
    }

    #[tokio::test]
    async fn test_missing_status_endpoint_is_not_fatal() {
        let transport = SimulatedTransport::new("TactileNav-01", 15);
        transport.set_without_status(true);
        let mut h = harness(transport);
        assert!(h.session.connect().await);
        assert!(h.session.endpoint(EndpointKind::Status).is_none());
    }

    #[tokio::test]
    async fn test_unsupported_environment() {
        let mut h = harness(SimulatedTransport::unsupported(15));
        assert!(!h.session.connect().await);
        assert_eq!(drain_errors(&mut h.app_rx), vec![HardwareError::Unsupported]);
        assert_eq!(h.session.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_cancelled_discovery_is_silent() {
        let transport = SimulatedTransport::new("TactileNav-01", 15);
        transport.set_cancel_discovery(true);
        let mut h = harness(transport);
        assert!(!h.session.connect().await);
        assert!(drain_errors(&mut h.app_rx).is_empty());
        assert_eq!(h.session.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_message() {
        let transport = SimulatedTransport::new("TactileNav-01", 15);
        transport.fail_next_connects(1);
        let mut h = harness(transport);
        assert!(!h.session.connect().await);
        let errors = drain_errors(&mut h.app_rx);
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], HardwareError::ConnectionFailed(msg) if msg.contains("unreachable")));
        assert!(h.session.reconnect_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_reports_once() {
        let mut h = harness(SimulatedTransport::new("TactileNav-01", 15));
        assert!(h.session.connect().await);

        h.transport.fail_next_connects(3);
        h.transport.drop_link();
        let event = h.link_rx.recv().await.unwrap();
        h.session.handle_transport_event(event);
        assert!(!h.session.is_connected());

        let started = Instant::now();
        while let Some(deadline) = h.session.reconnect_deadline() {
            tokio::time::sleep_until(deadline).await;
            assert!(!h.session.reconnect_attempt().await);
        }

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
        assert_eq!(h.transport.connect_attempts(), 4);
        assert_eq!(h.session.state(), LinkState::Disconnected);
        assert_eq!(
            drain_errors(&mut h.app_rx),
            vec![HardwareError::ReconnectExhausted]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_succeeds_after_failure() {
        let mut h = harness(SimulatedTransport::new("TactileNav-01", 15));
        assert!(h.session.connect().await);

        h.transport.fail_next_connects(1);
        h.transport.drop_link();
        let event = h.link_rx.recv().await.unwrap();
        h.session.handle_transport_event(event);

        let first = h.session.reconnect_deadline().unwrap();
        tokio::time::sleep_until(first).await;
        assert!(!h.session.reconnect_attempt().await);
        assert_eq!(h.session.state(), LinkState::Reconnecting { attempt: 1 });

        let second = h.session.reconnect_deadline().unwrap();
        tokio::time::sleep_until(second).await;
        assert!(h.session.reconnect_attempt().await);
        assert!(h.session.is_connected());
        assert!(drain_errors(&mut h.app_rx).is_empty());
    }

    #[tokio::test]
    async fn test_manual_disconnect_does_not_reconnect() {
        let mut h = harness(SimulatedTransport::new("TactileNav-01", 15));
        assert!(h.session.connect().await);
        h.session.disconnect().await;

        assert_eq!(h.session.state(), LinkState::Disconnected);
        assert!(h.session.reconnect_deadline().is_none());
        assert!(!h.transport.is_linked());

        h.session.handle_transport_event(TransportEvent::Disconnected);
        assert!(h.session.reconnect_deadline().is_none());
    }

    #[tokio::test]
    async fn test_status_notification_side_effects() {
        let mut h = harness(SimulatedTransport::new("TactileNav-01", 15));
        assert!(h.session.connect().await);

        h.transport
            .notify_status(&[protocol::TAG_STATUS, 12, 0x3C, 9, 1]);
        let event = h.link_rx.recv().await.unwrap();
        h.session.handle_transport_event(event);

        assert_eq!(
            h.session.status(),
            DeviceStatus {
                battery: 12,
                error_code: 0x3C,
                last_seq: 9
            }
        );
        let mut events = Vec::new();
        while let Ok(event) = h.app_rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events[0], AppEvent::Error(HardwareError::LowBattery(12))));
        assert!(matches!(events[1], AppEvent::Error(HardwareError::DeviceError(0x3C))));
        assert!(matches!(
            events[2],
            AppEvent::Button(ButtonEvent { value: 1 })
        ));
    }

    #[tokio::test]
    async fn test_short_status_is_ignored() {
        let mut h = harness(SimulatedTransport::new("TactileNav-01", 15));
        assert!(h.session.connect().await);
        h.session.handle_transport_event(TransportEvent::Notification {
            uuid: protocol::STATUS_CHAR_UUID.to_string(),
            data: vec![protocol::TAG_STATUS, 5, 1],
        });
        assert_eq!(h.session.status(), DeviceStatus::default());
        assert!(drain_errors(&mut h.app_rx).is_empty());
    }
}
