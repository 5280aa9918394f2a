//! Transport abstraction layer
//!
//! The platform BLE stack is an external collaborator. The engine issues
//! fire-and-forget commands through [`BleTransport`]; the platform reports
//! every outcome back as a [`TransportEvent`], which the registry routes to
//! the right peripheral's task slot or notification bus.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable platform identifier of one physical peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralHandle(String);

impl PeripheralHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralHandle {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeripheralHandle {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A characteristic within a service; also the notification topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Characteristic capability flags as reported by discovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

/// A discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

impl CharacteristicInfo {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self { uuid, properties }
    }
}

/// Acknowledgement mode of a characteristic write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteType {
    /// The platform reports completion through `CharacteristicWritten`
    WithResponse,
    /// No completion callback is guaranteed
    WithoutResponse,
}

/// Bluetooth adapter state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// States in which every outstanding operation is void
    pub fn invalidates_connections(&self) -> bool {
        matches!(self, AdapterState::PoweredOff | AdapterState::Resetting)
    }

    /// Whether new connections may be attempted. `Unknown` is allowed since
    /// some stacks only report once something changes.
    pub fn accepts_connections(&self) -> bool {
        matches!(self, AdapterState::Unknown | AdapterState::PoweredOn)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterState::Unknown => write!(f, "Unknown"),
            AdapterState::Resetting => write!(f, "Resetting"),
            AdapterState::Unsupported => write!(f, "Unsupported"),
            AdapterState::Unauthorized => write!(f, "Unauthorized"),
            AdapterState::PoweredOff => write!(f, "PoweredOff"),
            AdapterState::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// Callbacks from the platform BLE stack
///
/// Failures carry the platform's message; the registry wraps them in
/// [`crate::SwitchLinkError::TransportFailure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected {
        handle: PeripheralHandle,
    },
    ConnectFailed {
        handle: PeripheralHandle,
        reason: String,
    },
    /// The link dropped, either requested or unexpected
    Disconnected {
        handle: PeripheralHandle,
        reason: Option<String>,
    },
    ServicesDiscovered {
        handle: PeripheralHandle,
        result: Result<Vec<Uuid>, String>,
    },
    CharacteristicsDiscovered {
        handle: PeripheralHandle,
        service: Uuid,
        result: Result<Vec<CharacteristicInfo>, String>,
    },
    CharacteristicRead {
        handle: PeripheralHandle,
        characteristic: CharacteristicId,
        result: Result<Vec<u8>, String>,
    },
    CharacteristicWritten {
        handle: PeripheralHandle,
        characteristic: CharacteristicId,
        result: Result<(), String>,
    },
    NotificationStateChanged {
        handle: PeripheralHandle,
        characteristic: CharacteristicId,
        result: Result<bool, String>,
    },
    /// One raw notification fragment
    Notification {
        handle: PeripheralHandle,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    AdapterStateChanged(AdapterState),
}

impl TransportEvent {
    /// The peripheral this event concerns, if any
    pub fn handle(&self) -> Option<&PeripheralHandle> {
        match self {
            TransportEvent::Connected { handle }
            | TransportEvent::ConnectFailed { handle, .. }
            | TransportEvent::Disconnected { handle, .. }
            | TransportEvent::ServicesDiscovered { handle, .. }
            | TransportEvent::CharacteristicsDiscovered { handle, .. }
            | TransportEvent::CharacteristicRead { handle, .. }
            | TransportEvent::CharacteristicWritten { handle, .. }
            | TransportEvent::NotificationStateChanged { handle, .. }
            | TransportEvent::Notification { handle, .. } => Some(handle),
            TransportEvent::AdapterStateChanged(_) => None,
        }
    }
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Connected { handle } => write!(f, "Connected {{ {} }}", handle),
            TransportEvent::ConnectFailed { handle, reason } => {
                write!(f, "ConnectFailed {{ {}, reason: {} }}", handle, reason)
            }
            TransportEvent::Disconnected { handle, reason } => write!(
                f,
                "Disconnected {{ {}, reason: {} }}",
                handle,
                reason.as_deref().unwrap_or("requested")
            ),
            TransportEvent::ServicesDiscovered { handle, result } => match result {
                Ok(services) => write!(
                    f,
                    "ServicesDiscovered {{ {}, count: {} }}",
                    handle,
                    services.len()
                ),
                Err(e) => write!(f, "ServicesDiscovered {{ {}, error: {} }}", handle, e),
            },
            TransportEvent::CharacteristicsDiscovered {
                handle,
                service,
                result,
            } => match result {
                Ok(chars) => write!(
                    f,
                    "CharacteristicsDiscovered {{ {}, service: {}, count: {} }}",
                    handle,
                    service,
                    chars.len()
                ),
                Err(e) => write!(
                    f,
                    "CharacteristicsDiscovered {{ {}, service: {}, error: {} }}",
                    handle, service, e
                ),
            },
            TransportEvent::CharacteristicRead {
                handle,
                characteristic,
                result,
            } => match result {
                Ok(data) => write!(
                    f,
                    "CharacteristicRead {{ {}, {}, data_len: {} }}",
                    handle,
                    characteristic,
                    data.len()
                ),
                Err(e) => write!(
                    f,
                    "CharacteristicRead {{ {}, {}, error: {} }}",
                    handle, characteristic, e
                ),
            },
            TransportEvent::CharacteristicWritten {
                handle,
                characteristic,
                result,
            } => write!(
                f,
                "CharacteristicWritten {{ {}, {}, ok: {} }}",
                handle,
                characteristic,
                result.is_ok()
            ),
            TransportEvent::NotificationStateChanged {
                handle,
                characteristic,
                result,
            } => write!(
                f,
                "NotificationStateChanged {{ {}, {}, result: {:?} }}",
                handle, characteristic, result
            ),
            TransportEvent::Notification {
                handle,
                characteristic,
                value,
            } => write!(
                f,
                "Notification {{ {}, {}, data_len: {} }}",
                handle,
                characteristic,
                value.len()
            ),
            TransportEvent::AdapterStateChanged(state) => {
                write!(f, "AdapterStateChanged {{ {} }}", state)
            }
        }
    }
}

/// Platform BLE stack binding
///
/// Every method only issues the request; completion is reported later
/// through [`TransportEvent`]. Implementations may deliver that event
/// synchronously from inside the call, the engine never holds its lock while
/// calling into the transport.
#[cfg_attr(test, mockall::automock)]
pub trait BleTransport: Send + Sync {
    /// Whether the platform knows a peripheral object for this handle
    fn has_peripheral(&self, handle: &PeripheralHandle) -> bool;

    fn connect(&self, handle: &PeripheralHandle);

    fn cancel_connection(&self, handle: &PeripheralHandle);

    fn disconnect(&self, handle: &PeripheralHandle);

    fn discover_services(&self, handle: &PeripheralHandle);

    fn discover_characteristics(&self, handle: &PeripheralHandle, service: Uuid);

    fn read_characteristic(&self, handle: &PeripheralHandle, characteristic: &CharacteristicId);

    fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    );

    fn set_notify(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
        enabled: bool,
    );
}
