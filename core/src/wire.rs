//! Fixed-layout, little-endian wire codec for `ArbiterMessage`, the message
//! carried on the `txreq`/`txresp` streams for the two-phase-commit poll
//! protocol.
//!
//! Layout (76 bytes total):
//!
//! | field | width | meaning |
//! |---|---|---|
//! | `code`  | 4 bytes | message kind |
//! | `node`  | 4 bytes | originating node id |
//! | `state` | 4 bytes | transaction state, 0 on a request |
//! | `gid`   | 64 bytes, NUL-padded | global transaction id |

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::node_mask::NodeId;

/// Width in bytes of the `gid` field.
pub const GID_WIDTH: usize = 64;

/// Total encoded size of an [`ArbiterMessage`].
pub const WIRE_LEN: usize = 4 + 4 + 4 + GID_WIDTH;

pub const CODE_POLL_REQUEST: u32 = 1;
pub const CODE_POLL_STATUS: u32 = 2;
/// Codes `>= 16` are reserved for extensions; this codec preserves them
/// on decode instead of rejecting them.
pub const CODE_EXTENSION_MIN: u32 = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("ArbiterMessage requires {WIRE_LEN} bytes, got {0}")]
    TooShort(usize),
    #[error("gid field is not valid UTF-8 after trimming NUL padding")]
    InvalidGid,
    #[error("gid {0:?} is longer than {GID_WIDTH} bytes")]
    GidTooLong(String),
}

/// A decoded `ArbiterMessage`. `code` is kept as a raw `u32` rather than an
/// enum so that extension-reserved values (`>= 16`) round-trip without the
/// codec needing to know about them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbiterMessage {
    pub code: u32,
    pub node: NodeId,
    pub state: u32,
    pub gid: String,
}

impl ArbiterMessage {
    #[must_use]
    pub fn poll_request(node: NodeId, gid: impl Into<String>) -> Self {
        ArbiterMessage {
            code: CODE_POLL_REQUEST,
            node,
            state: 0,
            gid: gid.into(),
        }
    }

    #[must_use]
    pub fn poll_status(node: NodeId, state: u32, gid: impl Into<String>) -> Self {
        ArbiterMessage {
            code: CODE_POLL_STATUS,
            node,
            state,
            gid: gid.into(),
        }
    }

    #[must_use]
    pub fn is_poll_request(&self) -> bool {
        self.code == CODE_POLL_REQUEST
    }

    #[must_use]
    pub fn is_poll_status(&self) -> bool {
        self.code == CODE_POLL_STATUS
    }

    /// Encode into the fixed 76-byte little-endian wire layout.
    ///
    /// # Errors
    /// Returns [`WireError::GidTooLong`] if `gid` does not fit in
    /// [`GID_WIDTH`] bytes.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let gid_bytes = self.gid.as_bytes();
        if gid_bytes.len() > GID_WIDTH {
            return Err(WireError::GidTooLong(self.gid.clone()));
        }
        let mut buf = BytesMut::with_capacity(WIRE_LEN);
        buf.put_u32_le(self.code);
        buf.put_u32_le(self.node);
        buf.put_u32_le(self.state);
        buf.put_slice(gid_bytes);
        buf.put_bytes(0, GID_WIDTH - gid_bytes.len());
        Ok(buf.freeze())
    }

    /// Decode from the fixed 76-byte little-endian wire layout.
    ///
    /// # Errors
    /// Returns [`WireError::TooShort`] if fewer than [`WIRE_LEN`] bytes are
    /// available, or [`WireError::InvalidGid`] if the trimmed `gid` field is
    /// not valid UTF-8.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < WIRE_LEN {
            return Err(WireError::TooShort(bytes.len()));
        }
        let code = bytes.get_u32_le();
        let node = bytes.get_u32_le();
        let state = bytes.get_u32_le();
        let gid_field = &bytes[..GID_WIDTH];
        let trimmed = &gid_field[..gid_field.iter().position(|&b| b == 0).unwrap_or(GID_WIDTH)];
        let gid = std::str::from_utf8(trimmed)
            .map_err(|_| WireError::InvalidGid)?
            .to_string();
        Ok(ArbiterMessage {
            code,
            node,
            state,
            gid,
        })
    }
}
