//! Error taxonomy for the engine
//!
//! Every failure surfaced to a caller is one of these variants. Platform
//! failures arrive as text from the transport and are wrapped in
//! [`SwitchLinkError::TransportFailure`]; raw platform codes never leak.

use crate::transport::OperationKind;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SwitchLinkError {
    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------
    #[error("Bluetooth adapter not ready")]
    NotInitialized,
    #[error("Cannot resolve peripheral handle: {0}")]
    CannotResolveHandle(String),
    #[error("Already connecting to {0}")]
    AlreadyConnecting(String),
    #[error("Connection attempt cancelled")]
    ConnectionCancelled,
    #[error("Connect timed out")]
    ConnectTimeout,
    #[error("Disconnect timed out")]
    DisconnectTimeout,
    #[error("Bluetooth adapter was reset")]
    TransportReset,
    #[error("Not connected")]
    NotConnected,
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------
    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),
    #[error("No services returned")]
    NoServicesReturned,
    #[error("No characteristics returned")]
    NoCharacteristicsReturned,
    #[error("Service discovery timed out")]
    GetServicesTimeout,
    #[error("Characteristic discovery timed out")]
    GetCharacteristicsTimeout,

    // ------------------------------------------------------------------
    // I/O
    // ------------------------------------------------------------------
    #[error("Read timed out")]
    ReadTimeout,
    #[error("Write timed out")]
    WriteTimeout,
    #[error("Enabling notifications timed out")]
    EnableNotificationsTimeout,
    #[error("Disabling notifications timed out")]
    DisableNotificationsTimeout,
    #[error("Timed out waiting for notification")]
    NotificationTimeout,
    #[error("Notification stream timed out")]
    StreamTimeout,
    #[error("Malformed notification: {0}")]
    MalformedNotification(String),

    // ------------------------------------------------------------------
    // Crypto
    // ------------------------------------------------------------------
    #[error("Session not established")]
    SessionNotEstablished,
    #[error("Session nonce unavailable")]
    SessionNonceUnavailable,
    #[error("No key configured for the active access level")]
    EncryptionKeyMissing,
    #[error("Packet validation failed")]
    ValidationFailed,
    #[error("Packet was encrypted with a different key")]
    KeyMismatch,
    #[error("Malformed encrypted payload: {0}")]
    MalformedEncryptedPayload(String),
    #[error("Malformed session data: {0}")]
    MalformedSessionData(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // ------------------------------------------------------------------
    // Protocol
    // ------------------------------------------------------------------
    #[error("Process aborted by peripheral")]
    ProcessAborted,
    #[error("Unknown result code: {0}")]
    UnknownResultCode(u16),
    #[error("Malformed result packet: {0}")]
    MalformedResultPacket(String),
    #[error("Payload of {0} bytes exceeds the 16-bit length field")]
    PayloadTooLarge(usize),

    // ------------------------------------------------------------------
    // Programming errors
    // ------------------------------------------------------------------
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Task slot occupied by {active:?}, cannot arm {requested:?}")]
    TaskSlotOccupied {
        active: OperationKind,
        requested: OperationKind,
    },
    #[error("Result type mismatch: expected {expected}, got {got}")]
    ResultTypeMismatch {
        expected: &'static str,
        got: &'static str,
    },
}

impl SwitchLinkError {
    /// Whether this error was produced by an expired timer.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SwitchLinkError::ConnectTimeout
                | SwitchLinkError::DisconnectTimeout
                | SwitchLinkError::GetServicesTimeout
                | SwitchLinkError::GetCharacteristicsTimeout
                | SwitchLinkError::ReadTimeout
                | SwitchLinkError::WriteTimeout
                | SwitchLinkError::EnableNotificationsTimeout
                | SwitchLinkError::DisableNotificationsTimeout
                | SwitchLinkError::NotificationTimeout
                | SwitchLinkError::StreamTimeout
        )
    }

    /// Whether this error belongs to the crypto category.
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            SwitchLinkError::SessionNotEstablished
                | SwitchLinkError::SessionNonceUnavailable
                | SwitchLinkError::EncryptionKeyMissing
                | SwitchLinkError::ValidationFailed
                | SwitchLinkError::KeyMismatch
                | SwitchLinkError::MalformedEncryptedPayload(_)
                | SwitchLinkError::MalformedSessionData(_)
                | SwitchLinkError::InvalidKey(_)
        )
    }
}

pub type Result<T, E = SwitchLinkError> = std::result::Result<T, E>;
