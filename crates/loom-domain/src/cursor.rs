//! Pagination cursors
//!
//! Discovery and DLQ listing paginate with an opaque cursor: base64url over
//! a small JSON record `{offset, limit, filterHash}`. The filter hash is a
//! 16-hex digest over the canonicalized filter set, so a cursor replayed
//! with different filters is rejected instead of silently skewing pages.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LoomError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub offset: usize,
    pub limit: usize,
    pub filter_hash: String,
}

impl Cursor {
    pub fn new(offset: usize, limit: usize, filter_hash: String) -> Self {
        Cursor {
            offset,
            limit,
            filter_hash,
        }
    }

    pub fn encode(&self) -> String {
        // The cursor record contains nothing that can fail to serialize.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self, LoomError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| LoomError::validation("cursor is not valid base64url"))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| LoomError::validation("cursor payload is not a cursor"))
    }

    /// Decode and check the fingerprint against the filters actually
    /// supplied with this request.
    pub fn decode_for(token: &str, filter_hash: &str) -> Result<Self, LoomError> {
        let cursor = Self::decode(token)?;
        if cursor.filter_hash != filter_hash {
            return Err(LoomError::validation(
                "cursor was issued for a different filter set; drop the cursor or reuse the original filters",
            ));
        }
        Ok(cursor)
    }
}

/// 16-hex fingerprint over named filter fields. Order of the input pairs is
/// fixed by the caller, absent fields hash distinctly from empty ones.
pub fn filter_fingerprint(fields: &[(&str, Option<&str>)]) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in fields {
        hasher.update(name.as_bytes());
        hasher.update([0x1f]);
        match value {
            Some(v) => {
                hasher.update([1]);
                hasher.update(v.as_bytes());
            }
            None => hasher.update([0]),
        }
        hasher.update([0x1e]);
    }
    let mut out = hex::encode(hasher.finalize());
    out.truncate(16);
    out
}
