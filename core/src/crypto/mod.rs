// Cryptography module: key hierarchy, packet cipher and session handshake

pub mod encrypt;
pub mod keys;
pub mod session;

pub use encrypt::{decrypt_packet, encrypt_packet, packet_access_level};
pub use keys::{key_from_hex, AccessLevel, KeyStore, KEY_LEN};
pub use session::{SessionCrypto, SessionData, SessionState};
