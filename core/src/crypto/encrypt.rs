// Per-packet encryption: AES-128-CTR + truncated BLAKE3 tag
//
// Packet layout:
//   [packet_nonce: 3][access_level: 1][ciphertext: 16*n][tag: 8]
//
// Plaintext before encryption:
//   [validation_key: 4][payload_len: u16 LE][payload][zero padding to 16]
//
// Counter block: [packet_nonce 3][session_nonce 5][0u64], big-endian counter.
// Tag: BLAKE3 keyed hash over header + ciphertext, keyed by
// derive_key(TAG_CONTEXT, access key), truncated to 8 bytes.
//
// The receiver authenticates a packet twice: the tag proves the access key,
// the decrypted validation bytes prove the session.

use super::keys::{AccessLevel, KEY_LEN};
use crate::error::{Result, SwitchLinkError};
use aes::cipher::{KeyIvInit, StreamCipher};
use zeroize::Zeroizing;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// KDF context for the tag key. Changing this breaks compatibility with
/// every deployed peripheral.
const TAG_CONTEXT: &str = "switchlink ble v1 packet tag 2025-11-03";

pub const BLOCK_LEN: usize = 16;
pub const SESSION_NONCE_LEN: usize = 5;
pub const VALIDATION_KEY_LEN: usize = 4;
pub const PACKET_NONCE_LEN: usize = 3;
pub const HEADER_LEN: usize = PACKET_NONCE_LEN + 1;
pub const TAG_LEN: usize = 8;

const LEN_FIELD: usize = 2;
const PLAINTEXT_PREFIX: usize = VALIDATION_KEY_LEN + LEN_FIELD;

/// Smallest possible encrypted packet (empty payload)
pub const MIN_PACKET_LEN: usize = HEADER_LEN + BLOCK_LEN + TAG_LEN;

fn counter_block(
    packet_nonce: &[u8; PACKET_NONCE_LEN],
    session_nonce: &[u8; SESSION_NONCE_LEN],
) -> [u8; BLOCK_LEN] {
    let mut block = [0u8; BLOCK_LEN];
    block[..PACKET_NONCE_LEN].copy_from_slice(packet_nonce);
    block[PACKET_NONCE_LEN..PACKET_NONCE_LEN + SESSION_NONCE_LEN].copy_from_slice(session_nonce);
    block
}

fn apply_keystream(
    key: &[u8; KEY_LEN],
    packet_nonce: &[u8; PACKET_NONCE_LEN],
    session_nonce: &[u8; SESSION_NONCE_LEN],
    buffer: &mut [u8],
) -> Result<()> {
    let iv = counter_block(packet_nonce, session_nonce);
    let mut cipher = Aes128Ctr::new_from_slices(key, &iv)
        .map_err(|e| SwitchLinkError::InvalidKey(format!("Failed to create cipher: {}", e)))?;
    cipher.apply_keystream(buffer);
    Ok(())
}

fn compute_tag(key: &[u8; KEY_LEN], header: &[u8], ciphertext: &[u8]) -> [u8; TAG_LEN] {
    let tag_key = Zeroizing::new(blake3::derive_key(TAG_CONTEXT, key));
    let mut hasher = blake3::Hasher::new_keyed(&tag_key);
    hasher.update(header);
    hasher.update(ciphertext);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&hasher.finalize().as_bytes()[..TAG_LEN]);
    tag
}

fn tags_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Read the access level from an encrypted packet's header
pub fn packet_access_level(packet: &[u8]) -> Result<AccessLevel> {
    check_packet_len(packet)?;
    let byte = packet[PACKET_NONCE_LEN];
    AccessLevel::from_byte(byte).ok_or_else(|| {
        SwitchLinkError::MalformedEncryptedPayload(format!("Unknown access level {}", byte))
    })
}

fn check_packet_len(packet: &[u8]) -> Result<()> {
    if packet.len() < MIN_PACKET_LEN {
        return Err(SwitchLinkError::MalformedEncryptedPayload(format!(
            "Packet is {} bytes, minimum is {}",
            packet.len(),
            MIN_PACKET_LEN
        )));
    }
    if (packet.len() - HEADER_LEN - TAG_LEN) % BLOCK_LEN != 0 {
        return Err(SwitchLinkError::MalformedEncryptedPayload(format!(
            "Ciphertext of {} bytes is not block aligned",
            packet.len() - HEADER_LEN - TAG_LEN
        )));
    }
    Ok(())
}

/// Encrypt `payload` for `level` within the given session
pub fn encrypt_packet(
    key: &[u8; KEY_LEN],
    level: AccessLevel,
    session_nonce: &[u8; SESSION_NONCE_LEN],
    validation_key: &[u8; VALIDATION_KEY_LEN],
    packet_nonce: [u8; PACKET_NONCE_LEN],
    payload: &[u8],
) -> Result<Vec<u8>> {
    let payload_len = u16::try_from(payload.len()).map_err(|_| {
        SwitchLinkError::MalformedEncryptedPayload(format!(
            "Payload of {} bytes exceeds 16-bit length field",
            payload.len()
        ))
    })?;

    let padded_len = (PLAINTEXT_PREFIX + payload.len()).div_ceil(BLOCK_LEN) * BLOCK_LEN;
    let mut body = Zeroizing::new(Vec::with_capacity(padded_len));
    body.extend_from_slice(validation_key);
    body.extend_from_slice(&payload_len.to_le_bytes());
    body.extend_from_slice(payload);
    body.resize(padded_len, 0);

    apply_keystream(key, &packet_nonce, session_nonce, &mut body)?;

    let mut packet = Vec::with_capacity(HEADER_LEN + padded_len + TAG_LEN);
    packet.extend_from_slice(&packet_nonce);
    packet.push(level.as_byte());
    packet.extend_from_slice(&body);
    let tag = compute_tag(key, &packet[..HEADER_LEN], &packet[HEADER_LEN..]);
    packet.extend_from_slice(&tag);
    Ok(packet)
}

/// Decrypt a packet with the key of the level named in its header.
///
/// Tag valid but validation bytes wrong: another session, `ValidationFailed`.
/// Tag invalid with validation bytes nearly intact: corruption,
/// `ValidationFailed`. Tag invalid and validation bytes garbled: `KeyMismatch`.
pub fn decrypt_packet(
    key: &[u8; KEY_LEN],
    session_nonce: &[u8; SESSION_NONCE_LEN],
    validation_key: &[u8; VALIDATION_KEY_LEN],
    packet: &[u8],
) -> Result<Vec<u8>> {
    check_packet_len(packet)?;

    let tag_start = packet.len() - TAG_LEN;
    let header = &packet[..HEADER_LEN];
    let ciphertext = &packet[HEADER_LEN..tag_start];
    let tag_ok = tags_equal(&compute_tag(key, header, ciphertext), &packet[tag_start..]);

    let mut packet_nonce = [0u8; PACKET_NONCE_LEN];
    packet_nonce.copy_from_slice(&packet[..PACKET_NONCE_LEN]);

    let mut body = Zeroizing::new(ciphertext.to_vec());
    apply_keystream(key, &packet_nonce, session_nonce, &mut body)?;

    let matching = body[..VALIDATION_KEY_LEN]
        .iter()
        .zip(validation_key)
        .filter(|(a, b)| a == b)
        .count();

    if !tag_ok {
        return Err(if matching >= VALIDATION_KEY_LEN - 1 {
            SwitchLinkError::ValidationFailed
        } else {
            SwitchLinkError::KeyMismatch
        });
    }
    if matching != VALIDATION_KEY_LEN {
        return Err(SwitchLinkError::ValidationFailed);
    }

    let payload_len = u16::from_le_bytes([body[VALIDATION_KEY_LEN], body[VALIDATION_KEY_LEN + 1]])
        as usize;
    if PLAINTEXT_PREFIX + payload_len > body.len() {
        return Err(SwitchLinkError::MalformedEncryptedPayload(format!(
            "Declared payload length {} exceeds packet",
            payload_len
        )));
    }
    Ok(body[PLAINTEXT_PREFIX..PLAINTEXT_PREFIX + payload_len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: [u8; KEY_LEN] = [0x11; KEY_LEN];
    const OTHER_KEY: [u8; KEY_LEN] = [0x22; KEY_LEN];
    const SESSION: [u8; SESSION_NONCE_LEN] = [1, 2, 3, 4, 5];
    const VALIDATION: [u8; VALIDATION_KEY_LEN] = [0xCA, 0xFE, 0xBA, 0xBE];

    fn seal(payload: &[u8]) -> Vec<u8> {
        encrypt_packet(&KEY, AccessLevel::Admin, &SESSION, &VALIDATION, [7, 8, 9], payload)
            .unwrap()
    }

    #[test]
    fn test_layout() {
        let packet = seal(b"hello");
        assert_eq!(packet.len(), HEADER_LEN + BLOCK_LEN + TAG_LEN);
        assert_eq!(&packet[..3], &[7, 8, 9]);
        assert_eq!(packet_access_level(&packet).unwrap(), AccessLevel::Admin);

        // 6 byte prefix + 11 byte payload spills into a second block
        let packet = seal(&[0u8; 11]);
        assert_eq!(packet.len(), HEADER_LEN + 2 * BLOCK_LEN + TAG_LEN);
    }

    #[test]
    fn test_roundtrip_empty() {
        let packet = seal(&[]);
        let plain = decrypt_packet(&KEY, &SESSION, &VALIDATION, &packet).unwrap();
        assert!(plain.is_empty());
    }

    #[test]
    fn test_wrong_key_is_key_mismatch() {
        let packet = seal(b"switch on");
        assert_eq!(
            decrypt_packet(&OTHER_KEY, &SESSION, &VALIDATION, &packet),
            Err(SwitchLinkError::KeyMismatch)
        );
    }

    #[test]
    fn test_other_session_fails_validation() {
        let packet = seal(b"switch on");
        assert_eq!(
            decrypt_packet(&KEY, &[9, 9, 9, 9, 9], &VALIDATION, &packet),
            Err(SwitchLinkError::ValidationFailed)
        );
        assert_eq!(
            decrypt_packet(&KEY, &SESSION, &[0, 0, 0, 0], &packet),
            Err(SwitchLinkError::ValidationFailed)
        );
    }

    #[test]
    fn test_malformed_packets() {
        assert!(matches!(
            decrypt_packet(&KEY, &SESSION, &VALIDATION, &[0u8; 10]),
            Err(SwitchLinkError::MalformedEncryptedPayload(_))
        ));

        let mut packet = seal(b"x");
        packet.push(0);
        assert!(matches!(
            decrypt_packet(&KEY, &SESSION, &VALIDATION, &packet),
            Err(SwitchLinkError::MalformedEncryptedPayload(_))
        ));

        let mut packet = seal(b"x");
        packet[PACKET_NONCE_LEN] = 42;
        assert!(matches!(
            packet_access_level(&packet),
            Err(SwitchLinkError::MalformedEncryptedPayload(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            payload in proptest::collection::vec(any::<u8>(), 0..300),
            key in any::<[u8; KEY_LEN]>(),
            session in any::<[u8; SESSION_NONCE_LEN]>(),
            validation in any::<[u8; VALIDATION_KEY_LEN]>(),
            packet_nonce in any::<[u8; PACKET_NONCE_LEN]>(),
        ) {
            let packet = encrypt_packet(
                &key, AccessLevel::Member, &session, &validation, packet_nonce, &payload,
            ).unwrap();
            let plain = decrypt_packet(&key, &session, &validation, &packet).unwrap();
            prop_assert_eq!(plain, payload);
        }

        #[test]
        fn prop_corrupted_ciphertext_fails_validation(
            payload in proptest::collection::vec(any::<u8>(), 0..100),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut packet = seal(&payload);
            let ciphertext_len = packet.len() - HEADER_LEN - TAG_LEN;
            let at = HEADER_LEN + index.index(ciphertext_len);
            packet[at] ^= flip;

            prop_assert_eq!(
                decrypt_packet(&KEY, &SESSION, &VALIDATION, &packet),
                Err(SwitchLinkError::ValidationFailed)
            );
        }

        #[test]
        fn prop_wrong_key_is_key_mismatch(
            payload in proptest::collection::vec(any::<u8>(), 0..100),
            wrong in any::<[u8; KEY_LEN]>(),
        ) {
            prop_assume!(wrong != KEY);
            let packet = seal(&payload);
            prop_assert_eq!(
                decrypt_packet(&wrong, &SESSION, &VALIDATION, &packet),
                Err(SwitchLinkError::KeyMismatch)
            );
        }
    }
}
