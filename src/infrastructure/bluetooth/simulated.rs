//! Simulated Pin Display
//!
//! In-process stand-in for the device. Frames written to it are decoded and
//! logged, which is how the prototype runs without hardware. Failures can be
//! injected to exercise the reconnection and error paths.

use crate::infrastructure::bluetooth::protocol::{self, WireFrame};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, Endpoint, EndpointKind, PeerHandle, TransportError, TransportEvent,
};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One successful write as seen by the simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub kind: EndpointKind,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct SimState {
    available: bool,
    cancel_discovery: bool,
    without_status: bool,
    connect_failures: u32,
    write_failures: u32,
    write_delay: Duration,
    connect_attempts: u32,
    linked: bool,
    in_flight: bool,
    overlapped: bool,
    writes: Vec<WriteRecord>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

pub struct SimulatedTransport {
    device_name: String,
    grid_len: usize,
    state: Mutex<SimState>,
}

impl SimulatedTransport {
    /// A reachable device advertising `device_name` with an `grid_len`-pin display
    pub fn new(device_name: &str, grid_len: usize) -> Self {
        Self {
            device_name: device_name.to_string(),
            grid_len,
            state: Mutex::new(SimState {
                available: true,
                ..Default::default()
            }),
        }
    }

    /// An environment without any BLE stack
    pub fn unsupported(grid_len: usize) -> Self {
        let transport = Self::new("", grid_len);
        transport.lock().available = false;
        transport
    }

    /// Make discovery behave as if the user dismissed the chooser
    pub fn set_cancel_discovery(&self, cancel: bool) {
        self.lock().cancel_discovery = cancel;
    }

    /// Drop the status characteristic from the GATT table
    pub fn set_without_status(&self, without: bool) {
        self.lock().without_status = without;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.lock().connect_failures = count;
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.lock().write_failures = count;
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.lock().write_delay = delay;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    /// Writes targeting the tactile characteristic, decoded
    pub fn frames(&self) -> Vec<WireFrame> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.kind == EndpointKind::Tactile)
            .filter_map(|w| protocol::decode_frame(&w.payload, self.grid_len).ok())
            .collect()
    }

    /// Whether a write ever started while another was still running
    pub fn saw_overlapping_writes(&self) -> bool {
        self.lock().overlapped
    }

    /// Push a status notification as the device would
    pub fn notify_status(&self, payload: &[u8]) {
        if let Some(events) = &self.lock().events {
            let _ = events.send(TransportEvent::Notification {
                uuid: protocol::STATUS_CHAR_UUID.to_string(),
                data: payload.to_vec(),
            });
        }
    }

    /// Simulate the device going out of range
    pub fn drop_link(&self) {
        let mut state = self.lock();
        state.linked = false;
        if let Some(events) = state.events.take() {
            warn!("Simulated link dropped");
            let _ = events.send(TransportEvent::Disconnected);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_frame(&self, kind: EndpointKind, payload: &[u8]) {
        match protocol::decode_frame(payload, self.grid_len) {
            Ok(WireFrame::Full { seq, mode, grid }) => {
                info!("[SIM] full frame #{} mode={} -> {:?}", seq, mode, grid)
            }
            Ok(WireFrame::Diff { seq, changes }) => {
                info!("[SIM] diff frame #{} ({} changes)", seq, changes.len())
            }
            Ok(WireFrame::ModeCommand { mode, direction }) => {
                info!("[SIM] mode command mode={} direction={}", mode, direction)
            }
            Err(e) => warn!("[SIM] undecodable write on {:?}: {}", kind, e),
        }
    }
}

#[async_trait]
impl BleTransport for SimulatedTransport {
    fn is_available(&self) -> bool {
        self.lock().available
    }

    async fn request_device(&self, name_prefix: &str) -> Result<PeerHandle, TransportError> {
        let state = self.lock();
        if !state.available {
            return Err(TransportError::Unsupported);
        }
        if state.cancel_discovery {
            return Err(TransportError::Cancelled);
        }
        if !self.device_name.starts_with(name_prefix) {
            return Err(TransportError::NotFound(format!(
                "Device with prefix '{}'",
                name_prefix
            )));
        }
        Ok(PeerHandle {
            id: "sim-0".to_string(),
            name: self.device_name.clone(),
        })
    }

    async fn connect(
        &self,
        peer: &PeerHandle,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TransportError::Gatt("GATT server unreachable".to_string()));
        }
        debug!("[SIM] linked to {}", peer.name);
        state.linked = true;
        state.events = Some(events);
        Ok(())
    }

    async fn resolve_endpoint(
        &self,
        service_uuid: &str,
        kind: EndpointKind,
        char_uuid: &str,
    ) -> Result<Endpoint, TransportError> {
        let state = self.lock();
        if !state.linked {
            return Err(TransportError::NotConnected);
        }
        if kind == EndpointKind::Status && state.without_status {
            return Err(TransportError::NotFound(format!(
                "Characteristic {} in {}",
                char_uuid, service_uuid
            )));
        }
        Ok(Endpoint {
            kind,
            uuid: char_uuid.to_string(),
        })
    }

    async fn subscribe(&self, _endpoint: &Endpoint) -> Result<(), TransportError> {
        if !self.lock().linked {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    async fn write(&self, endpoint: &Endpoint, payload: &[u8]) -> Result<(), TransportError> {
        let delay = {
            let mut state = self.lock();
            if !state.linked {
                return Err(TransportError::NotConnected);
            }
            if state.in_flight {
                state.overlapped = true;
            }
            state.in_flight = true;
            state.write_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.in_flight = false;
        if state.write_failures > 0 {
            state.write_failures -= 1;
            return Err(TransportError::Gatt("Write not permitted".to_string()));
        }
        state.writes.push(WriteRecord {
            kind: endpoint.kind,
            payload: payload.to_vec(),
        });
        drop(state);

        self.log_frame(endpoint.kind, payload);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.lock();
        state.linked = false;
        state.events = None;
        debug!("[SIM] closed");
    }

    fn is_linked(&self) -> bool {
        self.lock().linked
    }
}
