//! Notification reassembly
//!
//! Notifications are capped at the negotiated MTU while logical packets are
//! larger. A logical packet is framed as `[declared_len: u16 LE][body]` and
//! split into MTU-sized fragments; the reassembler buffers fragments of one
//! exchange until the declared length is reached.

use crate::error::{Result, SwitchLinkError};
use tracing::{debug, trace};

/// Size of the length header at the start of the first fragment
pub const LENGTH_HEADER_SIZE: usize = 2;

/// Buffers the fragments of one logical exchange. Use a fresh instance per
/// exchange.
#[derive(Debug, Default)]
pub struct NotificationReassembler {
    buffer: Vec<u8>,
    declared_len: Option<usize>,
    completed: bool,
}

impl NotificationReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the complete body exactly once, when the
    /// declared length has been reached; fragments after that are ignored.
    pub fn merge(&mut self, fragment: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.completed {
            debug!(
                "Ignoring {} byte fragment after completion",
                fragment.len()
            );
            return Ok(None);
        }

        match self.declared_len {
            None => {
                if fragment.len() < LENGTH_HEADER_SIZE {
                    return Err(SwitchLinkError::MalformedNotification(format!(
                        "First fragment is {} bytes, length header needs {}",
                        fragment.len(),
                        LENGTH_HEADER_SIZE
                    )));
                }
                let declared = u16::from_le_bytes([fragment[0], fragment[1]]) as usize;
                self.declared_len = Some(declared);
                self.buffer.reserve(declared);
                self.buffer.extend_from_slice(&fragment[LENGTH_HEADER_SIZE..]);
            }
            Some(_) => self.buffer.extend_from_slice(fragment),
        }

        let declared = self.declared_len.unwrap_or(0);
        trace!("Reassembled {}/{} bytes", self.buffer.len(), declared);

        if self.buffer.len() < declared {
            return Ok(None);
        }

        self.completed = true;
        let mut body = std::mem::take(&mut self.buffer);
        body.truncate(declared);
        Ok(Some(body))
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Bytes still missing, if the header has been seen
    pub fn remaining(&self) -> Option<usize> {
        self.declared_len
            .map(|declared| declared.saturating_sub(self.buffer.len()))
    }
}

/// Frame `body` and split it into notifications of at most `mtu` bytes, the
/// way the peripheral sends it
pub fn frame_notification(body: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>> {
    if mtu == 0 {
        return Err(SwitchLinkError::MalformedNotification(
            "MTU must be > 0".to_string(),
        ));
    }
    let declared = u16::try_from(body.len()).map_err(|_| {
        SwitchLinkError::MalformedNotification(format!(
            "Body of {} bytes exceeds the 16-bit length header",
            body.len()
        ))
    })?;

    let mut framed = Vec::with_capacity(LENGTH_HEADER_SIZE + body.len());
    framed.extend_from_slice(&declared.to_le_bytes());
    framed.extend_from_slice(body);

    Ok(framed.chunks(mtu).map(|chunk| chunk.to_vec()).collect())
}
