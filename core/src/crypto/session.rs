// Per-peripheral session crypto
//
// Uninitialized -> AwaitingSessionData -> Established -> Invalidated
//
// The session data characteristic is read unencrypted once per connection.
// Its layout is detected structurally:
//   versioned (>= 14 bytes): [magic 0xCAFEBABE u32 LE][protocol u8][nonce 5][validation 4]
//   legacy (exactly 5 bytes): [nonce 5], validation key = nonce[0..4]
// An all-zero nonce means the device has encryption disabled; it is never
// used as key material.

use super::encrypt::{
    self, PACKET_NONCE_LEN, SESSION_NONCE_LEN, VALIDATION_KEY_LEN,
};
use super::keys::{AccessLevel, KeyStore, KEY_LEN};
use crate::error::{Result, SwitchLinkError};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub const SESSION_DATA_MAGIC: u32 = 0xCAFE_BABE;
pub const LEGACY_SESSION_DATA_LEN: usize = SESSION_NONCE_LEN;
pub const VERSIONED_SESSION_DATA_LEN: usize = 4 + 1 + SESSION_NONCE_LEN + VALIDATION_KEY_LEN;

const PACKET_COUNTER_MASK: u32 = 0x00FF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    AwaitingSessionData,
    Established,
    /// The link went down; a new handshake is required
    Invalidated,
}

/// Handshake result issued by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionData {
    pub protocol_version: u8,
    pub session_nonce: [u8; SESSION_NONCE_LEN],
    pub validation_key: [u8; VALIDATION_KEY_LEN],
}

impl SessionData {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.iter().all(|b| *b == 0) {
            return Err(SwitchLinkError::SessionNonceUnavailable);
        }

        let data = if raw.len() == LEGACY_SESSION_DATA_LEN {
            let mut session_nonce = [0u8; SESSION_NONCE_LEN];
            session_nonce.copy_from_slice(raw);
            let mut validation_key = [0u8; VALIDATION_KEY_LEN];
            validation_key.copy_from_slice(&raw[..VALIDATION_KEY_LEN]);
            SessionData {
                protocol_version: 0,
                session_nonce,
                validation_key,
            }
        } else if raw.len() >= VERSIONED_SESSION_DATA_LEN {
            let magic = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            if magic != SESSION_DATA_MAGIC {
                return Err(SwitchLinkError::MalformedSessionData(format!(
                    "Bad magic {:#010x}",
                    magic
                )));
            }
            let mut session_nonce = [0u8; SESSION_NONCE_LEN];
            session_nonce.copy_from_slice(&raw[5..5 + SESSION_NONCE_LEN]);
            let mut validation_key = [0u8; VALIDATION_KEY_LEN];
            validation_key.copy_from_slice(&raw[10..10 + VALIDATION_KEY_LEN]);
            SessionData {
                protocol_version: raw[4],
                session_nonce,
                validation_key,
            }
        } else {
            return Err(SwitchLinkError::MalformedSessionData(format!(
                "Unexpected length {}",
                raw.len()
            )));
        };

        if data.session_nonce.iter().all(|b| *b == 0) {
            return Err(SwitchLinkError::SessionNonceUnavailable);
        }
        Ok(data)
    }
}

pub struct SessionCrypto {
    keys: Arc<KeyStore>,
    setup_key: Option<Zeroizing<[u8; KEY_LEN]>>,
    session: Option<SessionData>,
    state: SessionState,
    encryption_enabled: bool,
    saved_flags: Vec<bool>,
    packet_counter: u32,
}

impl SessionCrypto {
    pub fn new(keys: Arc<KeyStore>, encryption_enabled: bool) -> Self {
        Self {
            keys,
            setup_key: None,
            session: None,
            state: SessionState::Uninitialized,
            encryption_enabled,
            saved_flags: Vec::new(),
            packet_counter: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established && self.session.is_some()
    }

    pub fn session_data(&self) -> Option<&SessionData> {
        self.session.as_ref()
    }

    /// No session history, no setup key and the encryption flag at its default
    pub fn is_pristine(&self, encryption_default: bool) -> bool {
        self.state == SessionState::Uninitialized
            && self.setup_key.is_none()
            && self.saved_flags.is_empty()
            && self.encryption_enabled == encryption_default
    }

    pub fn set_keys(&mut self, keys: Arc<KeyStore>) {
        self.keys = keys;
    }

    // ===== HANDSHAKE =====

    pub fn begin_handshake(&mut self) {
        self.session = None;
        self.state = SessionState::AwaitingSessionData;
    }

    /// Store the device's session data. On failure the state falls back to
    /// `Uninitialized`.
    pub fn apply_session_data(&mut self, raw: &[u8]) -> Result<()> {
        match SessionData::parse(raw) {
            Ok(data) => {
                debug!(
                    "Session established: protocol {}, nonce {}, validation {}",
                    data.protocol_version,
                    hex::encode(data.session_nonce),
                    hex::encode(data.validation_key)
                );
                self.packet_counter = rand::thread_rng().gen::<u32>() & PACKET_COUNTER_MASK;
                self.session = Some(data);
                self.state = SessionState::Established;
                Ok(())
            }
            Err(e) => {
                warn!("Session handshake failed: {}", e);
                self.fail_handshake();
                Err(e)
            }
        }
    }

    pub fn fail_handshake(&mut self) {
        self.session = None;
        self.state = SessionState::Uninitialized;
    }

    /// Forget the session after the link dropped
    pub fn invalidate(&mut self) {
        if self.state != SessionState::Uninitialized {
            self.state = SessionState::Invalidated;
        }
        self.session = None;
    }

    // ===== ENCRYPTION FLAG =====

    pub fn encryption_enabled(&self) -> bool {
        self.encryption_enabled
    }

    pub fn set_encryption_enabled(&mut self, enabled: bool) {
        self.encryption_enabled = enabled;
    }

    /// Force encryption off until the matching `pop_encryption_state`
    pub fn push_encryption_disabled(&mut self) {
        self.saved_flags.push(self.encryption_enabled);
        self.encryption_enabled = false;
    }

    pub fn pop_encryption_state(&mut self) {
        match self.saved_flags.pop() {
            Some(previous) => self.encryption_enabled = previous,
            None => warn!("Encryption state popped without a matching push"),
        }
    }

    // ===== SETUP KEY =====

    pub fn set_setup_key(&mut self, key: [u8; KEY_LEN]) {
        self.setup_key = Some(Zeroizing::new(key));
    }

    pub fn clear_setup_key(&mut self) {
        self.setup_key = None;
    }

    pub fn has_setup_key(&self) -> bool {
        self.setup_key.is_some()
    }

    /// Setup while a setup key is held, otherwise the highest configured level
    pub fn active_access_level(&self) -> Option<AccessLevel> {
        if self.setup_key.is_some() {
            return Some(AccessLevel::Setup);
        }
        self.keys.highest_level()
    }

    fn key_for(&self, level: AccessLevel) -> Option<&[u8; KEY_LEN]> {
        match level {
            AccessLevel::Setup => self.setup_key.as_deref(),
            other => self.keys.key(other),
        }
    }

    // ===== PACKETS =====

    pub fn encrypt(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.packet_counter = (self.packet_counter + 1) & PACKET_COUNTER_MASK;
        let counter = self.packet_counter.to_be_bytes();
        self.encrypt_with_packet_nonce(payload, [counter[1], counter[2], counter[3]])
    }

    pub fn encrypt_with_packet_nonce(
        &self,
        payload: &[u8],
        packet_nonce: [u8; PACKET_NONCE_LEN],
    ) -> Result<Vec<u8>> {
        let level = self
            .active_access_level()
            .ok_or(SwitchLinkError::EncryptionKeyMissing)?;
        let key = self
            .key_for(level)
            .ok_or(SwitchLinkError::EncryptionKeyMissing)?;
        let session = self
            .session
            .as_ref()
            .ok_or(SwitchLinkError::SessionNotEstablished)?;

        encrypt::encrypt_packet(
            key,
            level,
            &session.session_nonce,
            &session.validation_key,
            packet_nonce,
            payload,
        )
    }

    pub fn decrypt(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let level = encrypt::packet_access_level(packet)?;
        let key = self
            .key_for(level)
            .ok_or(SwitchLinkError::EncryptionKeyMissing)?;
        let session = self
            .session
            .as_ref()
            .ok_or(SwitchLinkError::SessionNotEstablished)?;

        encrypt::decrypt_packet(key, &session.session_nonce, &session.validation_key, packet)
    }
}
