// Access-level key hierarchy
//
// Keys are supplied by the embedding application; nothing here persists them.

use crate::error::{Result, SwitchLinkError};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// AES-128 key length
pub const KEY_LEN: usize = 16;

/// Access level a packet is encrypted for. The discriminant is the byte
/// carried in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    Admin,
    Member,
    /// Also called guest
    Basic,
    /// Per-device key, only valid during setup
    Setup,
}

impl AccessLevel {
    pub fn as_byte(&self) -> u8 {
        match self {
            AccessLevel::Admin => 0,
            AccessLevel::Member => 1,
            AccessLevel::Basic => 2,
            AccessLevel::Setup => 100,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(AccessLevel::Admin),
            1 => Some(AccessLevel::Member),
            2 => Some(AccessLevel::Basic),
            100 => Some(AccessLevel::Setup),
            _ => None,
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::Admin => write!(f, "admin"),
            AccessLevel::Member => write!(f, "member"),
            AccessLevel::Basic => write!(f, "basic"),
            AccessLevel::Setup => write!(f, "setup"),
        }
    }
}

/// Parse a 16-byte key from hex
pub fn key_from_hex(hex_key: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = Zeroizing::new(
        hex::decode(hex_key.trim())
            .map_err(|e| SwitchLinkError::InvalidKey(format!("Invalid hex: {}", e)))?,
    );
    if bytes.len() != KEY_LEN {
        return Err(SwitchLinkError::InvalidKey(format!(
            "Expected {} bytes, got {}",
            KEY_LEN,
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Sphere-wide keys for the admin, member and basic levels
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyStore {
    admin: Option<[u8; KEY_LEN]>,
    member: Option<[u8; KEY_LEN]>,
    basic: Option<[u8; KEY_LEN]>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with_key(mut self, level: AccessLevel, key: [u8; KEY_LEN]) -> Result<Self> {
        self.set_key(level, key)?;
        Ok(self)
    }

    pub fn set_key(&mut self, level: AccessLevel, key: [u8; KEY_LEN]) -> Result<()> {
        let slot = match level {
            AccessLevel::Admin => &mut self.admin,
            AccessLevel::Member => &mut self.member,
            AccessLevel::Basic => &mut self.basic,
            AccessLevel::Setup => {
                return Err(SwitchLinkError::InvalidKey(
                    "Setup keys are per device, read them from the peripheral".to_string(),
                ))
            }
        };
        if let Some(old) = slot.as_mut() {
            old.zeroize();
        }
        *slot = Some(key);
        Ok(())
    }

    pub fn set_key_hex(&mut self, level: AccessLevel, hex_key: &str) -> Result<()> {
        let mut key = key_from_hex(hex_key)?;
        let result = self.set_key(level, key);
        key.zeroize();
        result
    }

    pub fn key(&self, level: AccessLevel) -> Option<&[u8; KEY_LEN]> {
        match level {
            AccessLevel::Admin => self.admin.as_ref(),
            AccessLevel::Member => self.member.as_ref(),
            AccessLevel::Basic => self.basic.as_ref(),
            AccessLevel::Setup => None,
        }
    }

    /// Highest configured level: admin, then member, then basic
    pub fn highest_level(&self) -> Option<AccessLevel> {
        [AccessLevel::Admin, AccessLevel::Member, AccessLevel::Basic]
            .into_iter()
            .find(|level| self.key(*level).is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.highest_level().is_none()
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |key: &Option<[u8; KEY_LEN]>| key.map(|_| "<redacted>");
        f.debug_struct("KeyStore")
            .field("admin", &redact(&self.admin))
            .field("member", &redact(&self.member))
            .field("basic", &redact(&self.basic))
            .finish()
    }
}
