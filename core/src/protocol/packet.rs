// Control and result packets
//
//   control = [protocol u8][command u16 LE][payload_len u16 LE][payload]
//   result  = [protocol u8][command u16 LE][result_code u16 LE][payload_len u16 LE][payload]

use crate::error::{Result, SwitchLinkError};
use crate::transport::ProcessStep;
use tracing::{debug, warn};

/// Protocol version written into outgoing control packets
pub const PROTOCOL_VERSION: u8 = 5;

const CONTROL_HEADER_LEN: usize = 5;
const RESULT_HEADER_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    WaitForSuccess,
    SuccessNoChange,
    WrongPayloadLength,
    WrongParameter,
    InvalidMessage,
    UnknownOpCode,
    UnknownType,
    NotFound,
    NoSpace,
    Busy,
    WrongState,
    AlreadyExists,
    Timeout,
    Cancelled,
    ProtocolUnsupported,
    Mismatch,
    NoAccess,
    NotAvailable,
    NotImplemented,
    NotInitialized,
    WriteDisabled,
    WriteNotAllowed,
}

impl ResultCode {
    pub fn from_u16(code: u16) -> Result<Self> {
        Ok(match code {
            0 => ResultCode::Success,
            1 => ResultCode::WaitForSuccess,
            2 => ResultCode::SuccessNoChange,
            32 => ResultCode::WrongPayloadLength,
            33 => ResultCode::WrongParameter,
            34 => ResultCode::InvalidMessage,
            35 => ResultCode::UnknownOpCode,
            36 => ResultCode::UnknownType,
            37 => ResultCode::NotFound,
            38 => ResultCode::NoSpace,
            39 => ResultCode::Busy,
            40 => ResultCode::WrongState,
            41 => ResultCode::AlreadyExists,
            42 => ResultCode::Timeout,
            43 => ResultCode::Cancelled,
            44 => ResultCode::ProtocolUnsupported,
            45 => ResultCode::Mismatch,
            48 => ResultCode::NoAccess,
            64 => ResultCode::NotAvailable,
            65 => ResultCode::NotImplemented,
            67 => ResultCode::NotInitialized,
            80 => ResultCode::WriteDisabled,
            81 => ResultCode::WriteNotAllowed,
            other => return Err(SwitchLinkError::UnknownResultCode(other)),
        })
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ResultCode::Success => 0,
            ResultCode::WaitForSuccess => 1,
            ResultCode::SuccessNoChange => 2,
            ResultCode::WrongPayloadLength => 32,
            ResultCode::WrongParameter => 33,
            ResultCode::InvalidMessage => 34,
            ResultCode::UnknownOpCode => 35,
            ResultCode::UnknownType => 36,
            ResultCode::NotFound => 37,
            ResultCode::NoSpace => 38,
            ResultCode::Busy => 39,
            ResultCode::WrongState => 40,
            ResultCode::AlreadyExists => 41,
            ResultCode::Timeout => 42,
            ResultCode::Cancelled => 43,
            ResultCode::ProtocolUnsupported => 44,
            ResultCode::Mismatch => 45,
            ResultCode::NoAccess => 48,
            ResultCode::NotAvailable => 64,
            ResultCode::NotImplemented => 65,
            ResultCode::NotInitialized => 67,
            ResultCode::WriteDisabled => 80,
            ResultCode::WriteNotAllowed => 81,
        }
    }

    /// Final success, with or without a state change
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success | ResultCode::SuccessNoChange)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub protocol: u8,
    pub command: u16,
    pub payload: Vec<u8>,
}

impl ControlPacket {
    pub fn new(command: u16, payload: Vec<u8>) -> Self {
        Self {
            protocol: PROTOCOL_VERSION,
            command,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = payload_len(&self.payload)?;
        let mut bytes = Vec::with_capacity(CONTROL_HEADER_LEN + self.payload.len());
        bytes.push(self.protocol);
        bytes.extend_from_slice(&self.command.to_le_bytes());
        bytes.extend_from_slice(&len.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPacket {
    pub protocol: u8,
    pub command: u16,
    pub result: ResultCode,
    pub payload: Vec<u8>,
}

impl ResultPacket {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RESULT_HEADER_LEN {
            return Err(SwitchLinkError::MalformedResultPacket(format!(
                "{} bytes, header needs {}",
                bytes.len(),
                RESULT_HEADER_LEN
            )));
        }
        let command = u16::from_le_bytes([bytes[1], bytes[2]]);
        let code = u16::from_le_bytes([bytes[3], bytes[4]]);
        let len = u16::from_le_bytes([bytes[5], bytes[6]]) as usize;
        let body = &bytes[RESULT_HEADER_LEN..];
        if body.len() < len {
            return Err(SwitchLinkError::MalformedResultPacket(format!(
                "Declared payload {} bytes, got {}",
                len,
                body.len()
            )));
        }
        Ok(Self {
            protocol: bytes[0],
            command,
            result: ResultCode::from_u16(code)?,
            payload: body[..len].to_vec(),
        })
    }

    /// Encode as the peripheral does
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = payload_len(&self.payload)?;
        let mut bytes = Vec::with_capacity(RESULT_HEADER_LEN + self.payload.len());
        bytes.push(self.protocol);
        bytes.extend_from_slice(&self.command.to_le_bytes());
        bytes.extend_from_slice(&self.result.as_u16().to_le_bytes());
        bytes.extend_from_slice(&len.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }
}

fn payload_len(payload: &[u8]) -> Result<u16> {
    u16::try_from(payload.len()).map_err(|_| SwitchLinkError::PayloadTooLarge(payload.len()))
}

/// Stream interpreter for result packets answering `command`
pub fn interpret_result(command: u16) -> impl FnMut(&[u8]) -> ProcessStep + Send + 'static {
    move |bytes: &[u8]| match ResultPacket::parse(bytes) {
        Ok(packet) if packet.command != command => {
            debug!(
                "Result for command {} while waiting for {}",
                packet.command, command
            );
            ProcessStep::Continue
        }
        Ok(packet) if packet.result == ResultCode::WaitForSuccess => ProcessStep::Continue,
        Ok(packet) if packet.result.is_success() => ProcessStep::Finished,
        Ok(packet) => {
            warn!("Command {} failed: {:?}", command, packet.result);
            ProcessStep::AbortError
        }
        Err(e) => {
            warn!("Unreadable result for command {}: {}", command, e);
            ProcessStep::AbortError
        }
    }
}
