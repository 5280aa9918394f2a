//! Device protocol surface
//!
//! Characteristic ids of the plug firmware and the control/result packet
//! codec carried over them.

pub mod packet;

pub use packet::{interpret_result, ControlPacket, ResultCode, ResultPacket, PROTOCOL_VERSION};

use crate::transport::CharacteristicId;
use uuid::Uuid;

pub const DEVICE_SERVICE: Uuid = Uuid::from_u128(0x24f0_0000_7d10_4805_bfc1_7666_3a9c_3bf0);
pub const CONTROL_UUID: Uuid = Uuid::from_u128(0x24f0_0001_7d10_4805_bfc1_7666_3a9c_3bf0);
pub const RESULT_UUID: Uuid = Uuid::from_u128(0x24f0_0002_7d10_4805_bfc1_7666_3a9c_3bf0);
pub const SESSION_DATA_UUID: Uuid = Uuid::from_u128(0x24f0_0003_7d10_4805_bfc1_7666_3a9c_3bf0);

pub const SETUP_SERVICE: Uuid = Uuid::from_u128(0x24f1_0000_7d10_4805_bfc1_7666_3a9c_3bf0);
pub const SETUP_KEY_UUID: Uuid = Uuid::from_u128(0x24f1_0001_7d10_4805_bfc1_7666_3a9c_3bf0);

/// Control commands are written here
pub const CONTROL: CharacteristicId = CharacteristicId::new(DEVICE_SERVICE, CONTROL_UUID);

/// Result packets arrive as notifications here
pub const RESULT: CharacteristicId = CharacteristicId::new(DEVICE_SERVICE, RESULT_UUID);

/// Read unencrypted once per connection
pub const SESSION_DATA: CharacteristicId = CharacteristicId::new(DEVICE_SERVICE, SESSION_DATA_UUID);

/// Per-device setup key, only readable while the plug is in setup mode
pub const SETUP_KEY: CharacteristicId = CharacteristicId::new(SETUP_SERVICE, SETUP_KEY_UUID);
