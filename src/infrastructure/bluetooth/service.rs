//! Hardware Service Module
//!
//! Single task that owns the link session and the frame dispatcher. Callers
//! talk to it through a cloneable [`HardwareHandle`]; the service publishes a
//! [`HardwareSnapshot`] after every change.

use crate::domain::grid::{empty_grid, Grid};
use crate::domain::models::{DeviceStatus, HardwareEvents, LinkState, Mode};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::{
    connection::{ConnectionConfig, LinkSession},
    dispatcher::FrameDispatcher,
    transport::{BleTransport, TransportEvent},
};
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep_until;
use tracing::{debug, info};

/// Requests accepted by the hardware service
#[derive(Debug)]
pub enum HardwareCommand {
    Connect(Option<oneshot::Sender<bool>>),
    Disconnect,
    SetFrame { seq: u32, grid: Grid },
    SendMode { mode: Mode, direction: u8 },
    Shutdown,
}

/// Observable state of the hardware layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareSnapshot {
    pub link_state: LinkState,
    pub connected: bool,
    pub status: DeviceStatus,
    pub mode: Mode,
    pub last_seq: u32,
    pub last_grid: Grid,
}

/// Cloneable front door to the hardware service
#[derive(Clone)]
pub struct HardwareHandle {
    commands: mpsc::UnboundedSender<HardwareCommand>,
    snapshot: watch::Receiver<HardwareSnapshot>,
}

impl HardwareHandle {
    /// Connect and wait for the outcome
    pub async fn connect(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(HardwareCommand::Connect(Some(tx))).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Connect without waiting
    pub fn request_connect(&self) {
        let _ = self.commands.send(HardwareCommand::Connect(None));
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(HardwareCommand::Disconnect);
    }

    pub fn set_frame(&self, seq: u32, grid: Grid) {
        let _ = self.commands.send(HardwareCommand::SetFrame { seq, grid });
    }

    pub fn send_mode_command(&self, mode: Mode, direction: u8) {
        let _ = self
            .commands
            .send(HardwareCommand::SendMode { mode, direction });
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(HardwareCommand::Shutdown);
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().connected
    }

    pub fn status(&self) -> DeviceStatus {
        self.snapshot.borrow().status
    }

    /// Last sanitized grid seen by the dispatcher
    pub fn last_frame(&self) -> (u32, Grid) {
        let snapshot = self.snapshot.borrow();
        (snapshot.last_seq, snapshot.last_grid.clone())
    }

    pub fn snapshot(&self) -> HardwareSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HardwareSnapshot> {
        self.snapshot.clone()
    }
}

/// Owner of the link session and dispatcher
pub struct HardwareService {
    session: LinkSession,
    dispatcher: FrameDispatcher,
    commands: mpsc::UnboundedReceiver<HardwareCommand>,
    link_events: mpsc::UnboundedReceiver<TransportEvent>,
    snapshot: watch::Sender<HardwareSnapshot>,
}

impl HardwareService {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        settings: &Settings,
        events: Arc<dyn HardwareEvents>,
    ) -> (Self, HardwareHandle) {
        let layout = settings.grid_layout();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(HardwareSnapshot {
            link_state: LinkState::Disconnected,
            connected: false,
            status: DeviceStatus::default(),
            mode: Mode::default(),
            last_seq: 0,
            last_grid: empty_grid(layout.len),
        });

        let session = LinkSession::new(
            transport,
            ConnectionConfig::from(&settings.ble),
            events.clone(),
            link_tx,
        );
        let dispatcher = FrameDispatcher::new(layout, settings.dispatch.clone(), events);

        let service = Self {
            session,
            dispatcher,
            commands: command_rx,
            link_events: link_rx,
            snapshot: snapshot_tx,
        };
        let handle = HardwareHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
        };
        (service, handle)
    }

    /// Process commands and link events until shutdown or every handle is dropped
    pub async fn run(mut self) {
        info!("Hardware service started");
        loop {
            let deadline = self.session.reconnect_deadline();
            let reconnect_due = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(HardwareCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                Some(event) = self.link_events.recv() => {
                    self.session.handle_transport_event(event);
                }
                _ = reconnect_due => {
                    if self.session.reconnect_attempt().await {
                        self.dispatcher.force_full_frame();
                    }
                }
            }
            self.publish();
        }

        if self.session.is_connected() {
            self.session.disconnect().await;
        }
        info!("Hardware service stopped");
    }

    async fn handle_command(&mut self, command: HardwareCommand) {
        match command {
            HardwareCommand::Connect(reply) => {
                let connected = self.session.connect().await;
                if connected {
                    self.dispatcher.force_full_frame();
                }
                if let Some(reply) = reply {
                    let _ = reply.send(connected);
                }
            }
            HardwareCommand::Disconnect => self.session.disconnect().await,
            HardwareCommand::SetFrame { seq, grid } => {
                self.dispatcher.set_frame(seq, &grid, &self.session)
            }
            HardwareCommand::SendMode { mode, direction } => {
                self.dispatcher
                    .send_mode_command(mode, direction, &self.session)
            }
            HardwareCommand::Shutdown => {}
        }
    }

    fn publish(&self) {
        let (last_seq, last_grid) = self.dispatcher.last_frame();
        let next = HardwareSnapshot {
            link_state: self.session.state(),
            connected: self.session.is_connected(),
            status: self.session.status(),
            mode: self.dispatcher.mode(),
            last_seq,
            last_grid: last_grid.to_vec(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                debug!("Hardware snapshot updated: {:?}", next.link_state);
                *current = next;
                true
            }
        });
    }
}
