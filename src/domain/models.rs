use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Rendering mode of the pin array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Obstacle map around the wearer
    #[default]
    Map,
    /// Two enlarged glyphs
    Zoom,
}

impl Mode {
    /// Byte carried in full frames and mode commands
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Map => 0,
            Self::Zoom => 1,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Map),
            1 => Some(Self::Zoom),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Map => "MAP",
            Self::Zoom => "ZOOM",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Map => Self::Zoom,
            Self::Zoom => Self::Map,
        }
    }
}

/// Last status reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Battery percent, -1 when unknown
    pub battery: i32,
    pub error_code: u8,
    /// Last frame sequence the device acknowledged
    pub last_seq: u8,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            battery: -1,
            error_code: 0,
            last_seq: 0,
        }
    }
}

/// Lifecycle of the link to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
    },
}

/// Physical button press reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    /// 1 = toggle mode
    pub value: u8,
}

impl ButtonEvent {
    pub const TOGGLE_MODE: u8 = 1;
}

/// Every failure the hardware layer reports through the error sink
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    #[error("Bluetooth is not supported in this environment")]
    Unsupported,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Reconnection failed, please reconnect manually")]
    ReconnectExhausted,

    #[error("set_frame: grid length {actual} does not match {expected}")]
    GridLength { expected: usize, actual: usize },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Mode command failed: {0}")]
    ModeCommandFailed(String),

    #[error("Low battery: {0}%")]
    LowBattery(i32),

    #[error("Device error: 0x{0:02X}")]
    DeviceError(u8),
}

/// Sink for events surfaced by the hardware layer.
///
/// Invoked synchronously, in the order the events occur.
pub trait HardwareEvents: Send + Sync {
    fn on_button_event(&self, event: ButtonEvent);
    fn on_error(&self, error: HardwareError);
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    Button(ButtonEvent),
    Error(HardwareError),
}

impl HardwareEvents for mpsc::UnboundedSender<AppEvent> {
    fn on_button_event(&self, event: ButtonEvent) {
        let _ = self.send(AppEvent::Button(event));
    }

    fn on_error(&self, error: HardwareError) {
        let _ = self.send(AppEvent::Error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bytes() {
        assert_eq!(Mode::Map.as_byte(), 0);
        assert_eq!(Mode::from_byte(1), Some(Mode::Zoom));
        assert_eq!(Mode::from_byte(7), None);
        assert_eq!(Mode::Map.toggled(), Mode::Zoom);
    }

    #[test]
    fn test_device_error_is_hex_formatted() {
        assert_eq!(
            HardwareError::DeviceError(0x1F).to_string(),
            "Device error: 0x1F"
        );
    }

    #[test]
    fn test_channel_sink_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.on_error(HardwareError::Unsupported);
        tx.on_button_event(ButtonEvent { value: 1 });
        assert!(matches!(
            rx.try_recv().unwrap(),
            AppEvent::Error(HardwareError::Unsupported)
        ));
        assert!(matches!(rx.try_recv().unwrap(), AppEvent::Button(_)));
    }
}
