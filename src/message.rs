use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, Result, VaultError};

/// Control-plane messages exchanged between peers. Bulk file bytes travel in
/// stream frames announced by these messages, never inside them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// The sender is about to push `size` ciphertext bytes (IV included) for
    /// the blob addressed by `hashed_key`.
    StoreFile {
        node_id: String,
        hashed_key: String,
        size: i64,
    },
    /// The sender is looking for the blob addressed by `hashed_key`; any peer
    /// holding it replies with a size-prefixed stream frame.
    GetFile { node_id: String, hashed_key: String },
}

/// Encode a message as a u32 little-endian length prefix followed by the
/// bincode body. The transport prepends the frame kind byte.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    let body = bincode::serialize(msg)
        .map_err(|e| VaultError::wrap(e, ErrorKind::Internal, "failed to encode message"))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a message body (the bytes after the length prefix).
pub fn decode_message(payload: &[u8]) -> Result<Message> {
    bincode::deserialize(payload)
        .map_err(|e| VaultError::wrap(e, ErrorKind::InvalidInput, "failed to decode message"))
}
